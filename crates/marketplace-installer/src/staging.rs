use std::path::PathBuf;

use marketplace_core::AppId;

use crate::archive::unpack_archive;
use crate::download::VerifiedArtifact;
use crate::error::InstallError;
use crate::fs_utils::{
    current_unix_ms, remove_dir_all_if_exists, remove_file_if_exists, tree_digest,
};
use crate::layout::MarketplaceLayout;
use crate::receipts::write_install_receipt;
use crate::types::InstallReceipt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingArea {
    pub job_id: String,
    pub root: PathBuf,
    pub artifact_path: PathBuf,
    pub tree_path: PathBuf,
}

pub async fn stage(layout: &MarketplaceLayout, job_id: &str) -> Result<StagingArea, InstallError> {
    let root = layout.staging_path(job_id);
    tokio::fs::create_dir_all(&root).await.map_err(|err| {
        InstallError::Storage(format!(
            "failed to create staging directory {}: {err}",
            root.display()
        ))
    })?;
    Ok(StagingArea {
        job_id: job_id.to_string(),
        artifact_path: layout.staging_artifact_path(job_id),
        tree_path: layout.staging_tree_path(job_id),
        root,
    })
}

/// Extracts the verified artifact into the staging tree and writes its install receipt.
pub async fn unpack_artifact(
    area: &StagingArea,
    app_id: &AppId,
    artifact: &VerifiedArtifact,
    source_url: Option<&str>,
) -> Result<InstallReceipt, InstallError> {
    let artifact_path = artifact.path.clone();
    let tree_path = area.tree_path.clone();
    let mut receipt = InstallReceipt {
        app_id: app_id.to_string(),
        name: artifact.manifest.name.clone(),
        version: artifact.manifest.version.to_string(),
        content_sha256: String::new(),
        artifact_sha256: Some(artifact.sha256.clone()),
        source_url: source_url.map(str::to_string),
        job_id: Some(area.job_id.clone()),
        installed_at_unix_ms: 0,
    };

    let receipt = tokio::task::spawn_blocking(move || -> anyhow::Result<InstallReceipt> {
        remove_dir_all_if_exists(&tree_path)?;
        unpack_archive(&artifact_path, &tree_path)?;
        let digest = tree_digest(&tree_path, &[])?;
        receipt.content_sha256 = digest.sha256;
        receipt.installed_at_unix_ms = current_unix_ms();
        write_install_receipt(&tree_path, &receipt)?;
        Ok(receipt)
    })
    .await
    .map_err(|err| InstallError::Storage(format!("unpack task failed: {err}")))?
    .map_err(InstallError::storage)?;

    remove_file_if_exists(&artifact.path).await.map_err(|err| {
        InstallError::Storage(format!(
            "failed to remove {}: {err}",
            artifact.path.display()
        ))
    })?;
    Ok(receipt)
}

pub async fn discard_staging(
    layout: &MarketplaceLayout,
    job_id: &str,
) -> Result<bool, InstallError> {
    let root = layout.staging_path(job_id);
    tokio::task::spawn_blocking(move || remove_dir_all_if_exists(&root))
        .await
        .map_err(|err| InstallError::Storage(format!("staging cleanup task failed: {err}")))?
        .map_err(|err| {
            InstallError::Storage(format!(
                "failed to remove staging directory {}: {err}",
                layout.staging_path(job_id).display()
            ))
        })
}
