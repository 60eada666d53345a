use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use marketplace_core::AppId;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::MarketplaceConfig;
use crate::download::{fetch_artifact, verify_artifact};
use crate::error::InstallError;
use crate::jobs::{JobRegistry, JobWriter};
use crate::layout::{MarketplaceLayout, SiblingKind};
use crate::lock::{HolderProbe, LeaseKeeper, LockHandle, LockHolder, LockKey, LockManager};
use crate::promote::{promote, remove_tree};
use crate::receipts::read_registry;
use crate::retry::{always_retry, with_retry};
use crate::staging::{discard_staging, stage, unpack_artifact};
use crate::sweep::sweep_orphans;
use crate::transport::{ArtifactTransport, DefaultTransport};
use crate::types::{
    CancelAck, InstallRequest, JobKind, JobStatus, JobView, RegistryEntry, SweepReport,
};

enum JobWork {
    Install(InstallRequest),
    Uninstall,
}

struct Inner {
    config: MarketplaceConfig,
    layout: MarketplaceLayout,
    registry: Arc<JobRegistry>,
    locks: LockManager,
    transport: Arc<dyn ArtifactTransport>,
    shutdown: CancellationToken,
}

#[derive(Clone)]
pub struct Marketplace {
    inner: Arc<Inner>,
}

impl Marketplace {
    pub fn open(config: MarketplaceConfig) -> Result<Self, InstallError> {
        Self::with_transport(config, Arc::new(DefaultTransport::default()))
    }

    pub fn with_transport(
        config: MarketplaceConfig,
        transport: Arc<dyn ArtifactTransport>,
    ) -> Result<Self, InstallError> {
        let layout = MarketplaceLayout::new(config.root.clone());
        layout.ensure_base_dirs().map_err(InstallError::storage)?;

        let shutdown = CancellationToken::new();
        let registry = Arc::new(JobRegistry::new(layout.clone(), shutdown.clone()));
        let probe: Arc<dyn HolderProbe> = registry.clone();
        let locks = LockManager::new(layout.clone(), probe);
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                layout,
                registry,
                locks,
                transport,
                shutdown,
            }),
        })
    }

    pub fn config(&self) -> &MarketplaceConfig {
        &self.inner.config
    }

    pub fn layout(&self) -> &MarketplaceLayout {
        &self.inner.layout
    }

    pub fn jobs(&self) -> &JobRegistry {
        &self.inner.registry
    }

    pub fn locks(&self) -> &LockManager {
        &self.inner.locks
    }

    pub fn start_install(
        &self,
        app_id: &str,
        request: InstallRequest,
    ) -> Result<String, InstallError> {
        let app_id = parse_app_id(app_id)?;
        validate_install_request(&request)?;
        let job = self.inner.registry.create(
            &app_id,
            JobKind::Install,
            Some(request.source_url.clone()),
        )?;
        let job_id = job.job_id().to_string();
        tokio::spawn(execute(
            Arc::clone(&self.inner),
            job,
            app_id,
            JobWork::Install(request),
        ));
        Ok(job_id)
    }

    pub fn start_uninstall(&self, app_id: &str) -> Result<String, InstallError> {
        let app_id = parse_app_id(app_id)?;
        let job = self
            .inner
            .registry
            .create(&app_id, JobKind::Uninstall, None)?;
        let job_id = job.job_id().to_string();
        tokio::spawn(execute(
            Arc::clone(&self.inner),
            job,
            app_id,
            JobWork::Uninstall,
        ));
        Ok(job_id)
    }

    pub fn poll(&self, job_id: &str) -> Option<JobView> {
        self.inner.registry.get(job_id)
    }

    pub fn cancel(&self, job_id: &str) -> CancelAck {
        self.inner.registry.cancel(job_id)
    }

    /// Resolves once the job is terminal. Jobs this instance does not run resolve immediately to
    /// their last persisted view.
    pub async fn wait(&self, job_id: &str) -> Option<JobView> {
        let Some(mut receiver) = self.inner.registry.subscribe(job_id) else {
            return self.inner.registry.get(job_id);
        };
        let terminal = receiver
            .wait_for(|view| view.status.is_terminal())
            .await
            .map(|view| view.clone());
        match terminal {
            Ok(view) => Some(view),
            Err(_) => Some(receiver.borrow().clone()),
        }
    }

    pub async fn list_registry(&self) -> Result<Vec<RegistryEntry>, InstallError> {
        let layout = self.inner.layout.clone();
        tokio::task::spawn_blocking(move || read_registry(&layout))
            .await
            .map_err(|err| InstallError::Storage(format!("registry listing task failed: {err}")))?
            .map_err(InstallError::storage)
    }

    pub async fn sweep_orphans(&self) -> Result<SweepReport, InstallError> {
        sweep_orphans(
            &self.inner.layout,
            self.inner.registry.running_job_ids(),
            self.inner.config.staging_grace,
        )
        .await
    }

    pub async fn collect_expired_jobs(&self) -> usize {
        self.inner
            .registry
            .collect_expired(self.inner.config.job_retention)
            .await
    }

    pub fn spawn_maintenance(&self) -> JoinHandle<()> {
        let marketplace = self.clone();
        let shutdown = self.inner.shutdown.clone();
        let interval = self.inner.config.sweep_interval;
        tokio::spawn(async move {
            loop {
                match marketplace.sweep_orphans().await {
                    Ok(report) => debug!(
                        removed = report.removed.len(),
                        skipped_active = report.skipped_active,
                        skipped_recent = report.skipped_recent,
                        "maintenance sweep finished"
                    ),
                    Err(err) => warn!(error = %err, "maintenance sweep failed"),
                }
                marketplace.collect_expired_jobs().await;

                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            debug!("maintenance loop stopped");
        })
    }

    pub fn shutdown(&self) {
        info!("shutting down marketplace");
        self.inner.shutdown.cancel();
    }
}

fn parse_app_id(app_id: &str) -> Result<AppId, InstallError> {
    AppId::parse(app_id).map_err(|err| InstallError::InvalidRequest(format!("{err:#}")))
}

fn validate_install_request(request: &InstallRequest) -> Result<(), InstallError> {
    if request.source_url.trim().is_empty() {
        return Err(InstallError::InvalidRequest(
            "source url must not be empty".to_string(),
        ));
    }
    if let Some(expected) = &request.expected_sha256 {
        validate_hex("sha256", expected, 32)?;
    }
    if let Some(signature) = &request.signature {
        validate_hex("public key", &signature.public_key_hex, 32)?;
        validate_hex("signature", &signature.signature_hex, 64)?;
    }
    Ok(())
}

fn validate_hex(label: &str, value: &str, bytes: usize) -> Result<(), InstallError> {
    let value = value.trim();
    if value.len() != bytes * 2 || !value.chars().all(|ch| ch.is_ascii_hexdigit()) {
        return Err(InstallError::InvalidRequest(format!(
            "{label} must be {} hex characters",
            bytes * 2
        )));
    }
    Ok(())
}

#[tracing::instrument(
    skip_all,
    fields(job_id = %job.job_id(), app_id = %app_id)
)]
async fn execute(inner: Arc<Inner>, mut job: JobWriter, app_id: AppId, work: JobWork) -> JobView {
    let job_id = job.job_id().to_string();
    let cancel = job.cancel_token().clone();
    let is_install = matches!(work, JobWork::Install(_));

    let mut claimed = false;
    let mut lock = None;
    let outcome = match acquire_lock(&inner, &mut job, &app_id, &cancel).await {
        Err(err) => Err(err),
        Ok(handle) => {
            lock = Some(handle.clone());
            match inner.registry.claim_active(&app_id, &job_id) {
                Err(err) => Err(err),
                Ok(()) => {
                    claimed = true;
                    run_locked(&inner, &mut job, &app_id, work, handle, &cancel).await
                }
            }
        }
    };

    if is_install {
        if let Err(err) = discard_staging(&inner.layout, &job_id).await {
            warn!(error = %err, "failed to remove staging directory");
        }
    }
    if claimed {
        inner.registry.release_active(&app_id, &job_id);
    }
    if let Some(handle) = lock {
        if let Err(err) = inner.locks.release(handle).await {
            warn!(error = %err, "lock was not released cleanly");
        }
    }

    match &outcome {
        Ok(()) => info!("job succeeded"),
        Err(InstallError::Cancelled) => info!("job cancelled"),
        Err(err @ InstallError::ConflictExists { .. }) => error!(error = %err, "job failed"),
        Err(err) => warn!(error_kind = err.kind().as_str(), error = %err, "job failed"),
    }
    job.finish(outcome).await
}

async fn acquire_lock(
    inner: &Inner,
    job: &mut JobWriter,
    app_id: &AppId,
    cancel: &CancellationToken,
) -> Result<LockHandle, InstallError> {
    if cancel.is_cancelled() {
        return Err(InstallError::Cancelled);
    }
    job.transition(JobStatus::Locking).await?;
    let holder = LockHolder::new(job.job_id(), inner.registry.instance_id());
    inner
        .locks
        .acquire(
            &LockKey::for_app(app_id),
            &holder,
            inner.config.lock_lease,
            inner.config.lock_wait_timeout,
            cancel,
        )
        .await
}

async fn run_locked(
    inner: &Inner,
    job: &mut JobWriter,
    app_id: &AppId,
    work: JobWork,
    handle: LockHandle,
    cancel: &CancellationToken,
) -> Result<(), InstallError> {
    let work_cancel = cancel.child_token();
    let keeper = LeaseKeeper::spawn(
        inner.locks.clone(),
        handle.clone(),
        inner.config.lock_lease,
        work_cancel.clone(),
    );

    let result = match work {
        JobWork::Install(request) => {
            install_locked(inner, job, app_id, &request, &work_cancel).await
        }
        JobWork::Uninstall => uninstall_locked(inner, job, app_id, &work_cancel).await,
    };

    let lost = keeper.stop().await;
    match result {
        Err(InstallError::Cancelled) if lost && !cancel.is_cancelled() => {
            Err(InstallError::LeaseLost {
                key: handle.key().as_str().to_string(),
            })
        }
        other => other,
    }
}

async fn install_locked(
    inner: &Inner,
    job: &mut JobWriter,
    app_id: &AppId,
    request: &InstallRequest,
    cancel: &CancellationToken,
) -> Result<(), InstallError> {
    let canonical = inner.layout.app_dir(app_id.as_str());
    if !request.replace_existing && path_exists(&canonical).await? {
        return Err(InstallError::AlreadyInstalled {
            app_id: app_id.to_string(),
        });
    }

    job.transition(JobStatus::Downloading).await?;
    let area = stage(&inner.layout, job.job_id()).await?;
    job.set_staging_path(&area.root).await;

    let progress = job.progress_sink();
    let progress = &progress;
    let transport = inner.transport.as_ref();
    let source_url = request.source_url.as_str();
    let artifact_path = area.artifact_path.as_path();
    let max_bytes = inner.config.max_artifact_bytes;
    let fetch_timeout = inner.config.fetch_timeout;
    let fetched = with_retry(
        &inner.config.retry,
        cancel,
        "fetch-artifact",
        move |attempt| {
            debug!(attempt, source_url, "fetching artifact");
            fetch_artifact(
                transport,
                source_url,
                artifact_path,
                max_bytes,
                fetch_timeout,
                cancel,
                move |done, total| progress.update(done, total),
            )
        },
        InstallError::is_transient,
    )
    .await?;
    info!(
        bytes = fetched.bytes_written,
        sha256 = %fetched.sha256,
        "artifact downloaded"
    );

    job.transition(JobStatus::Staging).await?;
    let verified = verify_artifact(
        app_id,
        &area.artifact_path,
        &fetched,
        request.expected_sha256.as_deref(),
        request.signature.as_ref(),
    )
    .await?;
    if cancel.is_cancelled() {
        return Err(InstallError::Cancelled);
    }
    let receipt = unpack_artifact(&area, app_id, &verified, Some(source_url)).await?;
    if cancel.is_cancelled() {
        return Err(InstallError::Cancelled);
    }

    job.transition(JobStatus::Committing).await?;
    let retired = if request.replace_existing && path_exists(&canonical).await? {
        let retired = inner.layout.sibling_path(SiblingKind::Replaced, job.job_id());
        tokio::fs::rename(&canonical, &retired)
            .await
            .map_err(|err| {
                InstallError::MoveFailed(format!(
                    "failed to retire {}: {err}",
                    canonical.display()
                ))
            })?;
        info!(retired = %retired.display(), "retired installed tree");
        Some(retired)
    } else {
        None
    };

    let promoted = promote(
        &area.tree_path,
        &canonical,
        job.job_id(),
        inner.config.promote_strategy,
        &inner.config.retry,
        cancel,
    )
    .await;

    match promoted {
        Ok(outcome) => {
            info!(
                version = %receipt.version,
                content_sha256 = %receipt.content_sha256,
                ?outcome,
                "application committed"
            );
            if let Some(retired) = retired {
                remove_best_effort(inner, retired, "remove-retired-tree").await;
            }
            Ok(())
        }
        Err(err) => {
            if let Some(retired) = retired {
                restore_retired(&retired, &canonical).await;
            }
            Err(err)
        }
    }
}

async fn uninstall_locked(
    inner: &Inner,
    job: &mut JobWriter,
    app_id: &AppId,
    cancel: &CancellationToken,
) -> Result<(), InstallError> {
    let canonical = inner.layout.app_dir(app_id.as_str());
    if !path_exists(&canonical).await? {
        return Err(InstallError::NotInstalled {
            app_id: app_id.to_string(),
        });
    }

    job.transition(JobStatus::Committing).await?;
    if cancel.is_cancelled() {
        return Err(InstallError::Cancelled);
    }
    let removing = inner
        .layout
        .sibling_path(SiblingKind::Removing, job.job_id());
    tokio::fs::rename(&canonical, &removing)
        .await
        .map_err(|err| {
            InstallError::MoveFailed(format!(
                "failed to move {} aside: {err}",
                canonical.display()
            ))
        })?;
    info!(canonical = %canonical.display(), "application removed from registry");

    remove_best_effort(inner, removing, "remove-uninstalled-tree").await;
    Ok(())
}

async fn remove_best_effort(inner: &Inner, path: PathBuf, label: &str) {
    let removed = with_retry(
        &inner.config.retry,
        &CancellationToken::new(),
        label,
        |_| remove_tree(path.clone()),
        always_retry,
    )
    .await;
    if let Err(err) = removed {
        warn!(
            path = %path.display(),
            error = %err,
            "leaving directory for the orphan sweep"
        );
    }
}

async fn restore_retired(retired: &Path, canonical: &Path) {
    match tokio::fs::rename(retired, canonical).await {
        Ok(()) => info!(canonical = %canonical.display(), "restored previous installation"),
        Err(err) => error!(
            retired = %retired.display(),
            canonical = %canonical.display(),
            error = %err,
            "failed to restore previous installation"
        ),
    }
}

async fn path_exists(path: &Path) -> Result<bool, InstallError> {
    match tokio::fs::symlink_metadata(path).await {
        Ok(_) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(InstallError::Storage(format!(
            "failed to stat {}: {err}",
            path.display()
        ))),
    }
}
