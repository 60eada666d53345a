use anyhow::{Context, Result};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::{InstallReceipt, MarketplaceLayout, RegistryEntry};

pub const RECEIPT_FILE_NAME: &str = ".install-receipt";

pub fn write_install_receipt(app_dir: &Path, receipt: &InstallReceipt) -> Result<PathBuf> {
    let mut payload = String::new();
    payload.push_str(&format!("app_id={}\n", receipt.app_id));
    payload.push_str(&format!("name={}\n", receipt.name));
    payload.push_str(&format!("version={}\n", receipt.version));
    payload.push_str(&format!("content_sha256={}\n", receipt.content_sha256));
    if let Some(sha256) = &receipt.artifact_sha256 {
        payload.push_str(&format!("artifact_sha256={}\n", sha256));
    }
    if let Some(url) = &receipt.source_url {
        payload.push_str(&format!("source_url={}\n", url));
    }
    if let Some(job_id) = &receipt.job_id {
        payload.push_str(&format!("job_id={}\n", job_id));
    }
    payload.push_str(&format!(
        "installed_at_unix_ms={}\n",
        receipt.installed_at_unix_ms
    ));

    let path = app_dir.join(RECEIPT_FILE_NAME);
    fs::write(&path, payload.as_bytes())
        .with_context(|| format!("failed to write install receipt: {}", path.display()))?;
    Ok(path)
}

pub fn read_install_receipt(app_dir: &Path) -> Result<Option<InstallReceipt>> {
    let path = app_dir.join(RECEIPT_FILE_NAME);
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read install receipt: {}", path.display()))
        }
    };
    let receipt = parse_receipt(&raw)
        .with_context(|| format!("failed to parse install receipt: {}", path.display()))?;
    Ok(Some(receipt))
}

/// Lists committed applications. Dot-prefixed siblings are never entries.
pub fn read_registry(layout: &MarketplaceLayout) -> Result<Vec<RegistryEntry>> {
    let dir = layout.apps_dir();
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read registry directory: {}", dir.display()))
        }
    };

    let mut registry = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            continue;
        };
        if name.starts_with('.') {
            continue;
        }

        let path = entry.path();
        match read_install_receipt(&path) {
            Ok(Some(receipt)) => registry.push(RegistryEntry {
                app_id: receipt.app_id,
                name: receipt.name,
                version: receipt.version,
                content_sha256: receipt.content_sha256,
                installed_at_unix_ms: receipt.installed_at_unix_ms,
                path,
            }),
            Ok(None) => {
                warn!(path = %path.display(), "skipping registry entry without install receipt")
            }
            Err(err) => {
                warn!(path = %path.display(), error = %format!("{err:#}"), "skipping registry entry")
            }
        }
    }

    registry.sort_by(|a, b| a.app_id.cmp(&b.app_id));
    Ok(registry)
}

pub(crate) fn parse_receipt(raw: &str) -> Result<InstallReceipt> {
    let mut app_id = None;
    let mut name = None;
    let mut version = None;
    let mut content_sha256 = None;
    let mut artifact_sha256 = None;
    let mut source_url = None;
    let mut job_id = None;
    let mut installed_at_unix_ms = None;

    for line in raw.lines().map(str::trim).filter(|line| !line.is_empty()) {
        let Some((k, v)) = line.split_once('=') else {
            continue;
        };
        match k {
            "app_id" => app_id = Some(v.to_string()),
            "name" => name = Some(v.to_string()),
            "version" => version = Some(v.to_string()),
            "content_sha256" => content_sha256 = Some(v.to_string()),
            "artifact_sha256" => artifact_sha256 = Some(v.to_string()),
            "source_url" => source_url = Some(v.to_string()),
            "job_id" => job_id = Some(v.to_string()),
            "installed_at_unix_ms" => {
                installed_at_unix_ms =
                    Some(v.parse().context("installed_at_unix_ms must be u64")?)
            }
            _ => {}
        }
    }

    Ok(InstallReceipt {
        app_id: app_id.context("missing app_id")?,
        name: name.context("missing name")?,
        version: version.context("missing version")?,
        content_sha256: content_sha256.context("missing content_sha256")?,
        artifact_sha256,
        source_url,
        job_id,
        installed_at_unix_ms: installed_at_unix_ms.context("missing installed_at_unix_ms")?,
    })
}
