use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::error::InstallError;
use crate::fs_utils::{modified_age, remove_dir_all_if_exists};
use crate::layout::{MarketplaceLayout, SiblingKind};
use crate::types::SweepReport;

/// Removes staging directories and registry siblings left behind by jobs that are no longer
/// running. Entries younger than `grace` are kept.
pub async fn sweep_orphans(
    layout: &MarketplaceLayout,
    running: HashSet<String>,
    grace: Duration,
) -> Result<SweepReport, InstallError> {
    let layout = layout.clone();
    tokio::task::spawn_blocking(move || sweep_blocking(&layout, &running, grace))
        .await
        .map_err(|err| InstallError::Storage(format!("sweep task failed: {err}")))?
        .map_err(InstallError::storage)
}

fn sweep_blocking(
    layout: &MarketplaceLayout,
    running: &HashSet<String>,
    grace: Duration,
) -> Result<SweepReport> {
    let mut report = SweepReport::default();

    for (path, job_id) in candidate_dirs(&layout.staging_root(), |name| Some(name.to_string()))? {
        consider(&path, &job_id, running, grace, &mut report);
    }
    for (path, job_id) in candidate_dirs(&layout.apps_dir(), |name| {
        SiblingKind::parse_dir_name(name).map(|(_, job_id)| job_id.to_string())
    })? {
        consider(&path, &job_id, running, grace, &mut report);
    }

    if !report.removed.is_empty() {
        info!(removed = report.removed.len(), "swept orphaned directories");
    }
    Ok(report)
}

fn candidate_dirs<F>(dir: &Path, job_of: F) -> Result<Vec<(PathBuf, String)>>
where
    F: Fn(&str) -> Option<String>,
{
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read {}", dir.display()));
        }
    };

    let mut candidates = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("failed to read {}", dir.display()))?;
        let is_dir = match entry.file_type() {
            Ok(file_type) => file_type.is_dir(),
            Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to stat {}", entry.path().display()))
            }
        };
        if !is_dir {
            continue;
        }
        let file_name = entry.file_name();
        let Some(job_id) = file_name.to_str().and_then(&job_of) else {
            continue;
        };
        candidates.push((entry.path(), job_id));
    }
    candidates.sort();
    Ok(candidates)
}

fn consider(
    path: &Path,
    job_id: &str,
    running: &HashSet<String>,
    grace: Duration,
    report: &mut SweepReport,
) {
    if running.contains(job_id) {
        debug!(path = %path.display(), job_id, "keeping directory of running job");
        report.skipped_active += 1;
        return;
    }

    let age = match modified_age(path) {
        Ok(age) => age,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "failed to stat orphan candidate");
            return;
        }
    };
    if age < grace {
        debug!(
            path = %path.display(),
            job_id,
            age_secs = age.as_secs(),
            "keeping recent directory"
        );
        report.skipped_recent += 1;
        return;
    }

    match remove_dir_all_if_exists(path) {
        Ok(true) => {
            debug!(path = %path.display(), job_id, "removed orphaned directory");
            report.removed.push(path.to_path_buf());
        }
        Ok(false) => {}
        Err(err) => warn!(path = %path.display(), error = %err, "failed to remove orphan"),
    }
}
