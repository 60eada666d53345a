use std::ffi::OsString;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use marketplace_core::AppId;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::InstallError;
use crate::fs_utils::{current_unix_ms, remove_file_if_exists};
use crate::layout::MarketplaceLayout;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);
const MAX_CLAIM_ROUNDS: usize = 3;
const RECLAIM_GUARD_STALE_AFTER: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockKey {
    name: String,
    file_stem: String,
}

impl LockKey {
    pub fn for_app(app_id: &AppId) -> Self {
        Self {
            name: app_id.lock_key(),
            file_stem: app_id.as_str().to_string(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.name
    }

    pub fn file_stem(&self) -> &str {
        &self.file_stem
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockHolder {
    pub job_id: String,
    pub instance_id: String,
    pub pid: u32,
}

impl LockHolder {
    pub fn new(job_id: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            instance_id: instance_id.into(),
            pid: std::process::id(),
        }
    }

    fn same_owner(&self, other: &LockHolder) -> bool {
        self.job_id == other.job_id && self.instance_id == other.instance_id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockMarker {
    pub key: String,
    pub holder: LockHolder,
    pub acquired_at_unix_ms: u64,
    pub expires_at_unix_ms: u64,
}

impl LockMarker {
    fn new(key: &LockKey, holder: &LockHolder, lease: Duration) -> Self {
        let now = current_unix_ms();
        Self {
            key: key.as_str().to_string(),
            holder: holder.clone(),
            acquired_at_unix_ms: now,
            expires_at_unix_ms: now.saturating_add(lease.as_millis() as u64),
        }
    }

    pub fn is_expired_at(&self, now_unix_ms: u64) -> bool {
        now_unix_ms >= self.expires_at_unix_ms
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockState {
    Unlocked,
    Held(LockMarker),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HolderStatus {
    Active,
    Finished,
    Crashed,
    Unknown,
}

impl HolderStatus {
    fn is_reclaimable(self) -> bool {
        matches!(self, Self::Finished | Self::Crashed)
    }
}

pub trait HolderProbe: Send + Sync {
    fn holder_status(&self, holder: &LockHolder) -> HolderStatus;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    key: LockKey,
    holder: LockHolder,
    path: PathBuf,
}

impl LockHandle {
    pub fn key(&self) -> &LockKey {
        &self.key
    }

    pub fn holder(&self) -> &LockHolder {
        &self.holder
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

enum MarkerRead {
    Missing,
    Corrupt,
    Present(LockMarker),
}

#[derive(Clone)]
pub struct LockManager {
    layout: MarketplaceLayout,
    probe: Arc<dyn HolderProbe>,
    released: Arc<Notify>,
    poll_interval: Duration,
}

impl LockManager {
    pub fn new(layout: MarketplaceLayout, probe: Arc<dyn HolderProbe>) -> Self {
        Self {
            layout,
            probe,
            released: Arc::new(Notify::new()),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub async fn state(&self, key: &LockKey) -> Result<LockState, InstallError> {
        let path = self.layout.lock_path(key.file_stem());
        match read_marker(&path).await? {
            MarkerRead::Missing => Ok(LockState::Unlocked),
            MarkerRead::Corrupt => Err(InstallError::Storage(format!(
                "lock marker is unreadable: {}",
                path.display()
            ))),
            MarkerRead::Present(marker) => Ok(LockState::Held(marker)),
        }
    }

    pub async fn try_acquire(
        &self,
        key: &LockKey,
        holder: &LockHolder,
        lease: Duration,
    ) -> Result<LockHandle, InstallError> {
        let locks_dir = self.layout.locks_dir();
        tokio::fs::create_dir_all(&locks_dir).await.map_err(|err| {
            InstallError::Storage(format!("failed to create {}: {err}", locks_dir.display()))
        })?;
        let path = self.layout.lock_path(key.file_stem());
        let handle = LockHandle {
            key: key.clone(),
            holder: holder.clone(),
            path: path.clone(),
        };

        let mut last_holder = None;
        for _ in 0..MAX_CLAIM_ROUNDS {
            let marker = LockMarker::new(key, holder, lease);
            if create_marker(&locks_dir, &path, &marker).await? {
                info!(
                    lock = %key,
                    job_id = %holder.job_id,
                    lease_ms = lease.as_millis() as u64,
                    "lock acquired"
                );
                return Ok(handle);
            }

            let existing = match read_marker(&path).await? {
                MarkerRead::Missing => continue,
                MarkerRead::Corrupt => {
                    warn!(lock = %key, path = %path.display(), "refusing unreadable lock marker");
                    return Err(busy(key, None));
                }
                MarkerRead::Present(existing) => existing,
            };

            if existing.holder.same_owner(holder) {
                write_marker_over(&locks_dir, &path, &marker).await?;
                debug!(lock = %key, job_id = %holder.job_id, "lock re-entered by its holder");
                return Ok(handle);
            }

            last_holder = Some(existing.holder.job_id.clone());
            if !existing.is_expired_at(current_unix_ms()) {
                return Err(busy(key, last_holder));
            }

            let status = self.probe.holder_status(&existing.holder);
            if !status.is_reclaimable() {
                debug!(
                    lock = %key,
                    holder = %existing.holder.job_id,
                    ?status,
                    "expired lease holder is not confirmed finished"
                );
                return Err(busy(key, last_holder));
            }

            if !reclaim_marker(&path, &existing, &holder.job_id).await? {
                return Err(busy(key, last_holder));
            }
            info!(
                lock = %key,
                previous_holder = %existing.holder.job_id,
                ?status,
                "reclaimed expired lock"
            );
        }

        Err(busy(key, last_holder))
    }

    pub async fn acquire(
        &self,
        key: &LockKey,
        holder: &LockHolder,
        lease: Duration,
        wait_timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<LockHandle, InstallError> {
        let deadline = Instant::now() + wait_timeout;
        loop {
            if cancel.is_cancelled() {
                return Err(InstallError::Cancelled);
            }

            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            let contended = match self.try_acquire(key, holder, lease).await {
                Ok(handle) => return Ok(handle),
                Err(err @ InstallError::Busy { .. }) => err,
                Err(err) => return Err(err),
            };

            let now = Instant::now();
            if now >= deadline {
                return Err(contended);
            }
            let wait = (deadline - now).min(self.poll_interval);
            tokio::select! {
                _ = cancel.cancelled() => return Err(InstallError::Cancelled),
                _ = &mut released => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    pub async fn renew(&self, handle: &LockHandle, lease: Duration) -> Result<(), InstallError> {
        match read_marker(&handle.path).await? {
            MarkerRead::Present(existing) if existing.holder.same_owner(&handle.holder) => {
                let renewed = LockMarker {
                    expires_at_unix_ms: current_unix_ms().saturating_add(lease.as_millis() as u64),
                    ..existing
                };
                write_marker_over(&self.layout.locks_dir(), &handle.path, &renewed).await
            }
            _ => Err(InstallError::LeaseLost {
                key: handle.key.as_str().to_string(),
            }),
        }
    }

    pub async fn release(&self, handle: LockHandle) -> Result<(), InstallError> {
        let outcome = match read_marker(&handle.path).await? {
            MarkerRead::Present(existing) if existing.holder.same_owner(&handle.holder) => {
                remove_file_if_exists(&handle.path)
                    .await
                    .map_err(|err| storage_io("remove lock marker", &handle.path, err))
            }
            _ => Err(InstallError::LeaseLost {
                key: handle.key.as_str().to_string(),
            }),
        };
        self.released.notify_waiters();
        if outcome.is_ok() {
            info!(lock = %handle.key, job_id = %handle.holder.job_id, "lock released");
        }
        outcome
    }
}

fn busy(key: &LockKey, holder: Option<String>) -> InstallError {
    InstallError::Busy {
        key: key.as_str().to_string(),
        holder,
    }
}

fn storage_io(action: &str, path: &Path, err: io::Error) -> InstallError {
    InstallError::Storage(format!("failed to {action} {}: {err}", path.display()))
}

fn temp_marker_path(locks_dir: &Path, path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    locks_dir.join(format!(".{stem}.{}.tmp", uuid::Uuid::new_v4().simple()))
}

async fn write_temp_marker(
    locks_dir: &Path,
    path: &Path,
    marker: &LockMarker,
) -> Result<PathBuf, InstallError> {
    let payload = serde_json::to_vec_pretty(marker)
        .map_err(|err| InstallError::Storage(format!("failed to encode lock marker: {err}")))?;
    let tmp = temp_marker_path(locks_dir, path);
    tokio::fs::write(&tmp, payload)
        .await
        .map_err(|err| storage_io("write", &tmp, err))?;
    Ok(tmp)
}

async fn create_marker(
    locks_dir: &Path,
    path: &Path,
    marker: &LockMarker,
) -> Result<bool, InstallError> {
    let tmp = write_temp_marker(locks_dir, path, marker).await?;
    let linked = tokio::fs::hard_link(&tmp, path).await;
    let _ = tokio::fs::remove_file(&tmp).await;
    match linked {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(err) => Err(storage_io("create lock marker", path, err)),
    }
}

async fn write_marker_over(
    locks_dir: &Path,
    path: &Path,
    marker: &LockMarker,
) -> Result<(), InstallError> {
    let tmp = write_temp_marker(locks_dir, path, marker).await?;
    if let Err(err) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(storage_io("replace lock marker", path, err));
    }
    Ok(())
}

async fn read_marker(path: &Path) -> Result<MarkerRead, InstallError> {
    let raw = match tokio::fs::read(path).await {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(MarkerRead::Missing),
        Err(err) => return Err(storage_io("read lock marker", path, err)),
    };
    Ok(match serde_json::from_slice::<LockMarker>(&raw) {
        Ok(marker) => MarkerRead::Present(marker),
        Err(_) => MarkerRead::Corrupt,
    })
}

fn reclaim_guard_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(OsString::from).unwrap_or_default();
    name.push(".reclaim");
    path.with_file_name(name)
}

/// Exclusive right to inspect and remove one lock's marker, held as a `create_new` file next to
/// it. A guard left behind by a crashed claimant is broken once it is older than
/// `RECLAIM_GUARD_STALE_AFTER`.
struct ReclaimGuard {
    path: PathBuf,
}

impl ReclaimGuard {
    async fn try_create(
        lock_path: &Path,
        claimant_job_id: &str,
    ) -> Result<Option<Self>, InstallError> {
        let path = reclaim_guard_path(lock_path);
        for _ in 0..2 {
            match create_guard_file(&path, claimant_job_id).await {
                Ok(()) => return Ok(Some(Self { path })),
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {}
                Err(err) => return Err(storage_io("create reclaim guard", &path, err)),
            }

            let age = match tokio::fs::symlink_metadata(&path).await {
                Ok(metadata) => metadata
                    .modified()
                    .ok()
                    .and_then(|modified| SystemTime::now().duration_since(modified).ok())
                    .unwrap_or(Duration::ZERO),
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => return Err(storage_io("inspect reclaim guard", &path, err)),
            };
            if age < RECLAIM_GUARD_STALE_AFTER {
                return Ok(None);
            }
            warn!(
                path = %path.display(),
                age_ms = age.as_millis() as u64,
                "breaking abandoned reclaim guard"
            );
            remove_file_if_exists(&path)
                .await
                .map_err(|err| storage_io("remove reclaim guard", &path, err))?;
        }
        Ok(None)
    }

    async fn release(self) {
        if let Err(err) = remove_file_if_exists(&self.path).await {
            warn!(path = %self.path.display(), error = %err, "failed to remove reclaim guard");
        }
    }
}

async fn create_guard_file(path: &Path, claimant_job_id: &str) -> io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await?;
    file.write_all(claimant_job_id.as_bytes()).await?;
    file.flush().await
}

/// Removes the marker at `path` if it is still exactly `expected`. Returns false when another
/// claimant holds the guard or the marker has changed since it was read.
pub(crate) async fn reclaim_marker(
    path: &Path,
    expected: &LockMarker,
    claimant_job_id: &str,
) -> Result<bool, InstallError> {
    let Some(guard) = ReclaimGuard::try_create(path, claimant_job_id).await? else {
        debug!(path = %path.display(), "another claimant is reclaiming this lock");
        return Ok(false);
    };

    let outcome = match read_marker(path).await {
        Ok(MarkerRead::Missing) => Ok(true),
        Ok(MarkerRead::Present(current)) if current == *expected => {
            remove_file_if_exists(path)
                .await
                .map(|()| true)
                .map_err(|err| storage_io("remove stale lock marker", path, err))
        }
        Ok(_) => Ok(false),
        Err(err) => Err(err),
    };
    guard.release().await;
    outcome
}

pub struct LeaseKeeper {
    stop: CancellationToken,
    lost: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl LeaseKeeper {
    /// Renews `handle` every third of `lease` until stopped. A lost lease cancels `on_lost`.
    pub fn spawn(
        manager: LockManager,
        handle: LockHandle,
        lease: Duration,
        on_lost: CancellationToken,
    ) -> Self {
        let stop = CancellationToken::new();
        let lost = CancellationToken::new();
        let interval = (lease / 3).max(Duration::from_millis(10));
        let task = tokio::spawn({
            let stop = stop.clone();
            let lost = lost.clone();
            async move {
                loop {
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = tokio::time::sleep(interval) => {}
                    }
                    match manager.renew(&handle, lease).await {
                        Ok(()) => debug!(lock = %handle.key, "lease renewed"),
                        Err(InstallError::LeaseLost { .. }) => {
                            error!(
                                lock = %handle.key,
                                job_id = %handle.holder.job_id,
                                "lease lost while job was running"
                            );
                            lost.cancel();
                            on_lost.cancel();
                            break;
                        }
                        Err(err) => warn!(lock = %handle.key, error = %err, "lease renewal failed"),
                    }
                }
            }
        });

        Self {
            stop,
            lost,
            task: Some(task),
        }
    }

    pub fn is_lost(&self) -> bool {
        self.lost.is_cancelled()
    }

    pub async fn stop(mut self) -> bool {
        self.stop.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        self.is_lost()
    }
}

impl Drop for LeaseKeeper {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}
