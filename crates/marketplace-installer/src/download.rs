use std::path::{Path, PathBuf};
use std::time::Duration;

use marketplace_core::{AppId, AppManifest};
use marketplace_security::{
    verify_digest_signature_hex, verify_sha256_digest, ArtifactSignature, Sha256Stream,
};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::archive::inspect_archive;
use crate::error::InstallError;
use crate::fs_utils::remove_file_if_exists;
use crate::transport::ArtifactTransport;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOutcome {
    pub bytes_written: u64,
    pub sha256: String,
    pub content_length: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedArtifact {
    pub path: PathBuf,
    pub sha256: String,
    pub bytes: u64,
    pub manifest: AppManifest,
}

/// Streams `source_url` into `dest`. Nothing is left at `dest` when this returns an error.
pub async fn fetch_artifact<F>(
    transport: &dyn ArtifactTransport,
    source_url: &str,
    dest: &Path,
    max_bytes: u64,
    timeout: Duration,
    cancel: &CancellationToken,
    on_progress: F,
) -> Result<FetchOutcome, InstallError>
where
    F: FnMut(u64, Option<u64>) + Send,
{
    let result = tokio::select! {
        _ = cancel.cancelled() => Err(InstallError::Cancelled),
        outcome = tokio::time::timeout(
            timeout,
            stream_to_file(transport, source_url, dest, max_bytes, on_progress),
        ) => match outcome {
            Ok(result) => result,
            Err(_) => Err(InstallError::NetworkFailure(format!(
                "download timed out after {}s",
                timeout.as_secs_f64()
            ))),
        },
    };

    if let Err(err) = &result {
        debug!(path = %dest.display(), error = %err, "removing partial artifact");
        discard_artifact(dest).await;
    }
    result
}

async fn stream_to_file<F>(
    transport: &dyn ArtifactTransport,
    source_url: &str,
    dest: &Path,
    max_bytes: u64,
    mut on_progress: F,
) -> Result<FetchOutcome, InstallError>
where
    F: FnMut(u64, Option<u64>) + Send,
{
    let mut stream = transport.open(source_url).await?;
    let content_length = stream.content_length();
    if let Some(declared) = content_length {
        if declared > max_bytes {
            return Err(InstallError::TooLarge {
                limit: max_bytes,
                observed: declared,
            });
        }
    }

    let mut file = tokio::fs::File::create(dest).await.map_err(|err| {
        InstallError::Storage(format!("failed to create {}: {err}", dest.display()))
    })?;
    let mut hasher = Sha256Stream::new();
    let mut total = 0_u64;
    on_progress(0, content_length);
    while let Some(chunk) = stream.next_chunk().await? {
        let next_total = total + chunk.len() as u64;
        if next_total > max_bytes {
            return Err(InstallError::TooLarge {
                limit: max_bytes,
                observed: next_total,
            });
        }
        file.write_all(&chunk).await.map_err(|err| {
            InstallError::Storage(format!("failed to write {}: {err}", dest.display()))
        })?;
        hasher.update(&chunk);
        total = next_total;
        on_progress(total, content_length);
    }
    file.flush().await.map_err(|err| {
        InstallError::Storage(format!("failed to flush {}: {err}", dest.display()))
    })?;
    file.sync_all().await.map_err(|err| {
        InstallError::Storage(format!("failed to sync {}: {err}", dest.display()))
    })?;

    Ok(FetchOutcome {
        bytes_written: total,
        sha256: hasher.finalize_hex(),
        content_length,
    })
}

pub async fn verify_artifact(
    app_id: &AppId,
    path: &Path,
    fetched: &FetchOutcome,
    expected_sha256: Option<&str>,
    signature: Option<&ArtifactSignature>,
) -> Result<VerifiedArtifact, InstallError> {
    let result = check_artifact(app_id, path, fetched, expected_sha256, signature).await;
    if let Err(err) = &result {
        warn!(app_id = %app_id, path = %path.display(), error = %err, "artifact rejected");
        discard_artifact(path).await;
    }
    result
}

async fn check_artifact(
    app_id: &AppId,
    path: &Path,
    fetched: &FetchOutcome,
    expected_sha256: Option<&str>,
    signature: Option<&ArtifactSignature>,
) -> Result<VerifiedArtifact, InstallError> {
    if let Some(expected) = expected_sha256 {
        let matches = verify_sha256_digest(&fetched.sha256, expected)
            .map_err(|err| InstallError::IntegrityFailure(format!("{err:#}")))?;
        if !matches {
            return Err(InstallError::IntegrityFailure(format!(
                "sha256 mismatch: expected {}, got {}",
                expected.trim().to_ascii_lowercase(),
                fetched.sha256
            )));
        }
    }

    if let Some(signature) = signature {
        let verified = verify_digest_signature_hex(
            &fetched.sha256,
            &signature.public_key_hex,
            &signature.signature_hex,
        )
        .map_err(|err| InstallError::IntegrityFailure(format!("bad signature input: {err:#}")))?;
        if !verified {
            return Err(InstallError::IntegrityFailure(
                "publisher signature does not match the artifact digest".to_string(),
            ));
        }
    }

    let archive_path = path.to_path_buf();
    let manifest = tokio::task::spawn_blocking(move || inspect_archive(&archive_path))
        .await
        .map_err(|err| InstallError::Storage(format!("archive inspection task failed: {err}")))?
        .map_err(|err| InstallError::IntegrityFailure(format!("{err:#}")))?;
    if manifest.id != app_id.as_str() {
        return Err(InstallError::IntegrityFailure(format!(
            "manifest id '{}' does not match requested application '{}'",
            manifest.id, app_id
        )));
    }

    Ok(VerifiedArtifact {
        path: path.to_path_buf(),
        sha256: fetched.sha256.clone(),
        bytes: fetched.bytes_written,
        manifest,
    })
}

async fn discard_artifact(path: &Path) {
    if let Err(err) = remove_file_if_exists(path).await {
        warn!(path = %path.display(), error = %err, "failed to remove artifact");
    }
}
