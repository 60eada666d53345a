use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use marketplace_core::AppId;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{InstallError, JobErrorDetail};
use crate::fs_utils::current_unix_ms;
use crate::layout::MarketplaceLayout;
use crate::lock::{HolderProbe, HolderStatus, LockHolder};
use crate::types::{CancelAck, JobKind, JobStatus, JobView, StatusChange};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub instance_id: String,
    pub pid: u32,
    pub view: JobView,
}

struct JobEntry {
    view: watch::Receiver<JobView>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct RegistryState {
    jobs: HashMap<String, JobEntry>,
    active_by_app: HashMap<String, String>,
}

pub struct JobRegistry {
    layout: MarketplaceLayout,
    instance_id: String,
    shutdown: CancellationToken,
    state: Mutex<RegistryState>,
}

impl JobRegistry {
    pub fn new(layout: MarketplaceLayout, shutdown: CancellationToken) -> Self {
        Self {
            layout,
            instance_id: uuid::Uuid::new_v4().to_string(),
            shutdown,
            state: Mutex::new(RegistryState::default()),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn create(
        &self,
        app_id: &AppId,
        kind: JobKind,
        source_url: Option<String>,
    ) -> Result<JobWriter, InstallError> {
        let job_id = uuid::Uuid::new_v4().to_string();
        let now = current_unix_ms();
        let view = JobView {
            job_id: job_id.clone(),
            app_id: app_id.to_string(),
            kind,
            source_url,
            status: JobStatus::Queued,
            error: None,
            created_at_unix_ms: now,
            updated_at_unix_ms: now,
            staging_path: None,
            bytes_downloaded: 0,
            total_bytes: None,
            history: vec![StatusChange {
                status: JobStatus::Queued,
                at_unix_ms: now,
            }],
        };

        let record_path = self.layout.job_record_path(&job_id);
        let writer_record = JobRecord {
            instance_id: self.instance_id.clone(),
            pid: std::process::id(),
            view: view.clone(),
        };
        write_job_record(&record_path, &writer_record).map_err(InstallError::storage)?;

        let (sender, receiver) = watch::channel(view);
        let cancel = self.shutdown.child_token();
        self.state().jobs.insert(
            job_id.clone(),
            JobEntry {
                view: receiver,
                cancel: cancel.clone(),
            },
        );
        info!(job_id = %job_id, app_id = %app_id, kind = kind.as_str(), "job queued");

        Ok(JobWriter {
            job_id,
            instance_id: self.instance_id.clone(),
            sender: Arc::new(sender),
            cancel,
            record_path,
        })
    }

    pub fn get(&self, job_id: &str) -> Option<JobView> {
        if let Some(entry) = self.state().jobs.get(job_id) {
            return Some(entry.view.borrow().clone());
        }
        self.read_record(job_id).map(|record| record.view)
    }

    pub fn subscribe(&self, job_id: &str) -> Option<watch::Receiver<JobView>> {
        self.state()
            .jobs
            .get(job_id)
            .map(|entry| entry.view.clone())
    }

    pub fn list(&self) -> Vec<JobView> {
        let mut views = self
            .state()
            .jobs
            .values()
            .map(|entry| entry.view.borrow().clone())
            .collect::<Vec<_>>();
        views.sort_by(|a, b| a.created_at_unix_ms.cmp(&b.created_at_unix_ms));
        views
    }

    pub fn cancel(&self, job_id: &str) -> CancelAck {
        if let Some(entry) = self.state().jobs.get(job_id) {
            if entry.view.borrow().status.is_terminal() {
                return CancelAck::AlreadyFinished;
            }
            entry.cancel.cancel();
            info!(job_id, "cancellation requested");
            return CancelAck::Requested;
        }

        match self.read_record(job_id) {
            Some(record) if record.view.status.is_terminal() => CancelAck::AlreadyFinished,
            _ => CancelAck::NotFound,
        }
    }

    /// Marks `job_id` as the active job for `app_id`. A second active job means the lock was
    /// bypassed.
    pub fn claim_active(&self, app_id: &AppId, job_id: &str) -> Result<(), InstallError> {
        let mut state = self.state();
        match state.active_by_app.get(app_id.as_str()) {
            Some(existing) if existing != job_id => {
                warn!(
                    app_id = %app_id,
                    job_id,
                    active_job_id = %existing,
                    "refusing second active job for application"
                );
                Err(InstallError::ConflictExists {
                    path: self.layout.app_dir(app_id.as_str()),
                })
            }
            _ => {
                state
                    .active_by_app
                    .insert(app_id.as_str().to_string(), job_id.to_string());
                Ok(())
            }
        }
    }

    pub fn release_active(&self, app_id: &AppId, job_id: &str) {
        let mut state = self.state();
        if state.active_by_app.get(app_id.as_str()).map(String::as_str) == Some(job_id) {
            state.active_by_app.remove(app_id.as_str());
        }
    }

    pub fn active_app_job(&self, app_id: &AppId) -> Option<String> {
        self.state().active_by_app.get(app_id.as_str()).cloned()
    }

    pub fn running_job_ids(&self) -> HashSet<String> {
        self.state()
            .jobs
            .iter()
            .filter(|(_, entry)| !entry.view.borrow().status.is_terminal())
            .map(|(job_id, _)| job_id.clone())
            .collect()
    }

    /// Drops terminal jobs last updated before the retention window, from memory and from disk.
    pub async fn collect_expired(&self, retention: Duration) -> usize {
        let cutoff = current_unix_ms().saturating_sub(retention.as_millis() as u64);
        let expired_in_memory = {
            let mut state = self.state();
            let expired = state
                .jobs
                .iter()
                .filter(|(_, entry)| {
                    let view = entry.view.borrow();
                    view.status.is_terminal() && view.updated_at_unix_ms <= cutoff
                })
                .map(|(job_id, _)| job_id.clone())
                .collect::<Vec<_>>();
            for job_id in &expired {
                state.jobs.remove(job_id);
            }
            expired
        };

        let layout = self.layout.clone();
        let running = self.running_job_ids();
        let collected = tokio::task::spawn_blocking(move || {
            collect_expired_records(&layout, &expired_in_memory, &running, cutoff)
        })
        .await
        .unwrap_or_else(|err| {
            warn!(error = %err, "job record collection task failed");
            0
        });

        if collected > 0 {
            info!(collected, "collected expired jobs");
        }
        collected
    }

    fn read_record(&self, job_id: &str) -> Option<JobRecord> {
        uuid::Uuid::parse_str(job_id).ok()?;
        read_job_record(&self.layout.job_record_path(job_id))
    }
}

impl HolderProbe for JobRegistry {
    fn holder_status(&self, holder: &LockHolder) -> HolderStatus {
        if let Some(entry) = self.state().jobs.get(&holder.job_id) {
            return if entry.view.borrow().status.is_terminal() {
                HolderStatus::Finished
            } else {
                HolderStatus::Active
            };
        }

        match self.read_record(&holder.job_id) {
            Some(record) if record.view.status.is_terminal() => HolderStatus::Finished,
            Some(record)
                if record.instance_id != self.instance_id && !process_alive(record.pid) =>
            {
                HolderStatus::Crashed
            }
            Some(_) => HolderStatus::Unknown,
            None if holder.instance_id == self.instance_id => HolderStatus::Finished,
            None => HolderStatus::Unknown,
        }
    }
}

/// Single mutation path for one job. Not `Clone`: exactly one task owns it.
pub struct JobWriter {
    job_id: String,
    instance_id: String,
    sender: Arc<watch::Sender<JobView>>,
    cancel: CancellationToken,
    record_path: PathBuf,
}

impl JobWriter {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn snapshot(&self) -> JobView {
        self.sender.borrow().clone()
    }

    pub fn status(&self) -> JobStatus {
        self.sender.borrow().status
    }

    pub fn progress_sink(&self) -> ProgressSink {
        ProgressSink {
            sender: Arc::clone(&self.sender),
        }
    }

    pub async fn transition(&mut self, next: JobStatus) -> Result<(), InstallError> {
        self.apply(next, None).await
    }

    pub async fn set_staging_path(&mut self, path: &Path) {
        self.sender.send_modify(|view| {
            view.staging_path = Some(path.to_path_buf());
            view.updated_at_unix_ms = current_unix_ms();
        });
        self.persist().await;
    }

    /// Moves the job to its terminal state for `outcome` and returns the final view.
    pub async fn finish(mut self, outcome: Result<(), InstallError>) -> JobView {
        let applied = match &outcome {
            Ok(()) => self.apply(JobStatus::Succeeded, None).await,
            Err(InstallError::Cancelled) => self.apply(JobStatus::Cancelled, None).await,
            Err(err) => {
                self.apply(JobStatus::Failed, Some(JobErrorDetail::from(err)))
                    .await
            }
        };
        if let Err(err) = applied {
            warn!(job_id = %self.job_id, error = %err, "forcing job to failed");
            let detail = JobErrorDetail::from(&err);
            if let Err(err) = self.apply(JobStatus::Failed, Some(detail)).await {
                warn!(job_id = %self.job_id, error = %err, "job already terminal");
            }
        }
        self.snapshot()
    }

    async fn apply(
        &mut self,
        next: JobStatus,
        error: Option<JobErrorDetail>,
    ) -> Result<(), InstallError> {
        let current = self.status();
        if !current.can_transition_to(next) {
            return Err(InstallError::InvalidTransition {
                from: current,
                to: next,
            });
        }

        let now = current_unix_ms();
        self.sender.send_modify(|view| {
            view.status = next;
            view.updated_at_unix_ms = now;
            if error.is_some() {
                view.error = error.clone();
            }
            view.history.push(StatusChange {
                status: next,
                at_unix_ms: now,
            });
        });
        match &error {
            Some(detail) => info!(
                job_id = %self.job_id,
                from = current.as_str(),
                to = next.as_str(),
                error_kind = detail.kind.as_str(),
                error = %detail.message,
                "job transition"
            ),
            None => info!(
                job_id = %self.job_id,
                from = current.as_str(),
                to = next.as_str(),
                "job transition"
            ),
        }
        self.persist().await;
        Ok(())
    }

    async fn persist(&self) {
        let record = JobRecord {
            instance_id: self.instance_id.clone(),
            pid: std::process::id(),
            view: self.snapshot(),
        };
        let record_path = self.record_path.clone();
        let written = tokio::task::spawn_blocking(move || write_job_record(&record_path, &record))
            .await
            .map_err(anyhow::Error::from)
            .and_then(|written| written);
        if let Err(err) = written {
            warn!(
                job_id = %self.job_id,
                error = %format!("{err:#}"),
                "failed to persist job record"
            );
        }
    }
}

#[derive(Clone)]
pub struct ProgressSink {
    sender: Arc<watch::Sender<JobView>>,
}

impl ProgressSink {
    pub fn update(&self, bytes_downloaded: u64, total_bytes: Option<u64>) {
        self.sender.send_modify(|view| {
            view.bytes_downloaded = bytes_downloaded;
            if total_bytes.is_some() {
                view.total_bytes = total_bytes;
            }
        });
    }
}

fn write_job_record(path: &Path, record: &JobRecord) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let payload = serde_json::to_vec_pretty(record).context("failed to encode job record")?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, payload)
        .with_context(|| format!("failed to write job record: {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .with_context(|| format!("failed to commit job record: {}", path.display()))?;
    Ok(())
}

fn collect_expired_records(
    layout: &MarketplaceLayout,
    expired_in_memory: &[String],
    running: &HashSet<String>,
    cutoff: u64,
) -> usize {
    let mut collected = 0;
    for job_id in expired_in_memory {
        remove_record(&layout.job_record_path(job_id));
        collected += 1;
    }

    let entries = match fs::read_dir(layout.jobs_dir()) {
        Ok(entries) => entries,
        Err(err) => {
            if err.kind() != io::ErrorKind::NotFound {
                warn!(error = %err, "failed to scan job records");
            }
            return collected;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
            continue;
        }
        let Some(record) = read_job_record(&path) else {
            continue;
        };
        if running.contains(&record.view.job_id) || !record.view.status.is_terminal() {
            continue;
        }
        if record.view.updated_at_unix_ms <= cutoff {
            remove_record(&path);
            collected += 1;
        }
    }
    collected
}

fn read_job_record(path: &Path) -> Option<JobRecord> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(err) => {
            if err.kind() != io::ErrorKind::NotFound {
                debug!(path = %path.display(), error = %err, "failed to read job record");
            }
            return None;
        }
    };
    match serde_json::from_slice(&raw) {
        Ok(record) => Some(record),
        Err(err) => {
            debug!(path = %path.display(), error = %err, "ignoring unreadable job record");
            None
        }
    }
}

fn remove_record(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), error = %err, "failed to remove job record"),
    }
}

#[cfg(target_os = "linux")]
pub(crate) fn process_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn process_alive(_pid: u32) -> bool {
    true
}
