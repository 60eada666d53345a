use std::io;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::InstallError;
use crate::fs_utils::{copy_tree, remove_dir_all_if_exists, tree_digest, TreeDigest};
use crate::layout::SiblingKind;
use crate::retry::{always_retry, with_retry, RetryError, RetryPolicy};
use crate::types::{PromoteOutcome, PromoteStrategy};

#[cfg(unix)]
const EXDEV: i32 = 18;
#[cfg(windows)]
const ERROR_NOT_SAME_DEVICE: i32 = 17;

/// Exposes `staging_tree` at `canonical` in a single rename. The canonical path is either absent
/// or the complete tree whatever happens here.
pub async fn promote(
    staging_tree: &Path,
    canonical: &Path,
    job_id: &str,
    strategy: PromoteStrategy,
    retry: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<PromoteOutcome, InstallError> {
    if cancel.is_cancelled() {
        return Err(InstallError::Cancelled);
    }
    let parent = canonical
        .parent()
        .ok_or_else(|| InstallError::MoveFailed(format!("{} has no parent", canonical.display())))?
        .to_path_buf();
    ensure_absent(canonical).await?;
    tokio::fs::create_dir_all(&parent).await.map_err(|err| {
        InstallError::MoveFailed(format!("failed to create {}: {err}", parent.display()))
    })?;

    if strategy == PromoteStrategy::Auto && same_filesystem(staging_tree, &parent).await {
        match tokio::fs::rename(staging_tree, canonical).await {
            Ok(()) => {
                info!(
                    job_id,
                    canonical = %canonical.display(),
                    outcome = "renamed_directly",
                    "promoted staging tree"
                );
                return Ok(PromoteOutcome::RenamedDirectly);
            }
            Err(err) if is_cross_device(&err) => {
                info!(job_id, "rename crossed filesystems, falling back to copy");
            }
            Err(err) => return Err(rename_failure(canonical, err).await),
        }
    }

    let sibling = parent.join(SiblingKind::Incoming.dir_name(job_id));
    let copied = with_retry(
        retry,
        cancel,
        "promote-copy",
        |_| copy_into_sibling(staging_tree.to_path_buf(), sibling.clone(), cancel.clone()),
        always_retry,
    )
    .await;
    let digest = match copied {
        Ok(digest) => digest,
        Err(err) => {
            remove_sibling(&sibling).await;
            return Err(match err {
                RetryError::Cancelled => InstallError::Cancelled,
                other => InstallError::MoveFailed(other.to_string()),
            });
        }
    };

    if cancel.is_cancelled() {
        remove_sibling(&sibling).await;
        return Err(InstallError::Cancelled);
    }
    if let Err(err) = ensure_absent(canonical).await {
        remove_sibling(&sibling).await;
        return Err(err);
    }
    if let Err(err) = tokio::fs::rename(&sibling, canonical).await {
        let failure = rename_failure(canonical, err).await;
        remove_sibling(&sibling).await;
        return Err(failure);
    }
    info!(
        job_id,
        canonical = %canonical.display(),
        files = digest.files,
        bytes = digest.bytes,
        outcome = "copied_then_renamed",
        "promoted staging tree"
    );

    let cleanup = with_retry(
        retry,
        &CancellationToken::new(),
        "remove-staged-source",
        |_| remove_tree(staging_tree.to_path_buf()),
        always_retry,
    )
    .await;
    if let Err(err) = cleanup {
        warn!(
            path = %staging_tree.display(),
            error = %err,
            "failed to remove staged source after promotion"
        );
    }

    Ok(PromoteOutcome::CopiedThenRenamed)
}

/// Copies the staged tree next to its destination and checks the copy against the source.
pub(crate) async fn copy_into_sibling(
    source: PathBuf,
    sibling: PathBuf,
    cancel: CancellationToken,
) -> Result<TreeDigest, anyhow::Error> {
    tokio::task::spawn_blocking(move || {
        remove_dir_all_if_exists(&sibling)
            .with_context(|| format!("failed to clear {}", sibling.display()))?;
        copy_tree(&source, &sibling, &cancel)?;
        let expected = tree_digest(&source, &[])?;
        let actual = tree_digest(&sibling, &[])?;
        if expected != actual {
            return Err(anyhow!(
                "copied tree does not match source: {} files/{} bytes/{} vs {} files/{} bytes/{}",
                expected.files,
                expected.bytes,
                expected.sha256,
                actual.files,
                actual.bytes,
                actual.sha256
            ));
        }
        Ok(actual)
    })
    .await
    .map_err(|err| anyhow!("copy task failed: {err}"))?
}

pub(crate) async fn remove_tree(path: PathBuf) -> Result<bool, anyhow::Error> {
    tokio::task::spawn_blocking(move || {
        remove_dir_all_if_exists(&path)
            .with_context(|| format!("failed to remove {}", path.display()))
    })
    .await
    .map_err(|err| anyhow!("removal task failed: {err}"))?
}

async fn remove_sibling(sibling: &Path) {
    if let Err(err) = remove_tree(sibling.to_path_buf()).await {
        warn!(
            path = %sibling.display(),
            error = %format!("{err:#}"),
            "failed to remove copy sibling"
        );
    }
}

async fn ensure_absent(canonical: &Path) -> Result<(), InstallError> {
    match tokio::fs::symlink_metadata(canonical).await {
        Ok(_) => {
            error!(
                canonical = %canonical.display(),
                "canonical path already exists; refusing to overwrite"
            );
            Err(InstallError::ConflictExists {
                path: canonical.to_path_buf(),
            })
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(InstallError::MoveFailed(format!(
            "failed to stat {}: {err}",
            canonical.display()
        ))),
    }
}

async fn rename_failure(canonical: &Path, err: io::Error) -> InstallError {
    if let Err(conflict) = ensure_absent(canonical).await {
        return conflict;
    }
    InstallError::MoveFailed(format!(
        "failed to rename into {}: {err}",
        canonical.display()
    ))
}

fn is_cross_device(err: &io::Error) -> bool {
    #[cfg(unix)]
    {
        err.raw_os_error() == Some(EXDEV)
    }
    #[cfg(windows)]
    {
        err.raw_os_error() == Some(ERROR_NOT_SAME_DEVICE)
    }
    #[cfg(not(any(unix, windows)))]
    {
        let _ = err;
        false
    }
}

#[cfg(unix)]
async fn same_filesystem(a: &Path, b: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;

    match (tokio::fs::metadata(a).await, tokio::fs::metadata(b).await) {
        (Ok(a), Ok(b)) => a.dev() == b.dev(),
        _ => true,
    }
}

#[cfg(not(unix))]
async fn same_filesystem(_a: &Path, _b: &Path) -> bool {
    true
}
