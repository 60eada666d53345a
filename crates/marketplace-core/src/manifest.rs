use std::path::{Component, Path};

use anyhow::{anyhow, Context};
use semver::Version;
use serde::{Deserialize, Serialize};

use crate::app_id::validate_app_id;

pub const MANIFEST_FILE_NAME: &str = "app.toml";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppManifest {
    pub id: String,
    pub name: String,
    pub version: Version,
    pub description: Option<String>,
    pub entry: Option<String>,
}

impl AppManifest {
    pub fn from_toml_str(input: &str) -> anyhow::Result<Self> {
        let manifest: Self = toml::from_str(input).context("failed to parse app manifest")?;
        validate_app_id(&manifest.id)
            .with_context(|| format!("invalid id in app manifest '{}'", manifest.name))?;
        if manifest.name.trim().is_empty() {
            return Err(anyhow!("app manifest '{}' has an empty name", manifest.id));
        }
        if let Some(entry) = &manifest.entry {
            validate_entry_path(entry).with_context(|| {
                format!("invalid entry '{}' for app '{}'", entry, manifest.id)
            })?;
        }
        Ok(manifest)
    }
}

fn validate_entry_path(entry: &str) -> anyhow::Result<()> {
    let trimmed = entry.trim();
    if trimmed.is_empty() {
        return Err(anyhow!("entry must not be empty"));
    }

    let path = Path::new(trimmed);
    if path.is_absolute() {
        return Err(anyhow!("entry must be a relative path: {entry}"));
    }
    for component in path.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => return Err(anyhow!("entry must stay inside the package: {entry}")),
        }
    }

    Ok(())
}
