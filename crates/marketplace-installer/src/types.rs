use std::path::PathBuf;

use marketplace_security::ArtifactSignature;
use serde::{Deserialize, Serialize};

use crate::error::JobErrorDetail;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Locking,
    Downloading,
    Staging,
    Committing,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Locking => "locking",
            Self::Downloading => "downloading",
            Self::Staging => "staging",
            Self::Committing => "committing",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        match (self, next) {
            (from, _) if from.is_terminal() => false,
            (_, Self::Failed | Self::Cancelled) => true,
            (Self::Queued, Self::Locking) => true,
            (Self::Locking, Self::Downloading | Self::Committing) => true,
            (Self::Downloading, Self::Staging) => true,
            (Self::Staging, Self::Committing) => true,
            (Self::Committing, Self::Succeeded) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Install,
    Uninstall,
}

impl JobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Install => "install",
            Self::Uninstall => "uninstall",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub status: JobStatus,
    pub at_unix_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobView {
    pub job_id: String,
    pub app_id: String,
    pub kind: JobKind,
    pub source_url: Option<String>,
    pub status: JobStatus,
    pub error: Option<JobErrorDetail>,
    pub created_at_unix_ms: u64,
    pub updated_at_unix_ms: u64,
    pub staging_path: Option<PathBuf>,
    pub bytes_downloaded: u64,
    pub total_bytes: Option<u64>,
    pub history: Vec<StatusChange>,
}

impl JobView {
    pub fn statuses(&self) -> Vec<JobStatus> {
        self.history.iter().map(|change| change.status).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallRequest {
    pub source_url: String,
    pub expected_sha256: Option<String>,
    pub signature: Option<ArtifactSignature>,
    pub replace_existing: bool,
}

impl InstallRequest {
    pub fn new(source_url: impl Into<String>) -> Self {
        Self {
            source_url: source_url.into(),
            expected_sha256: None,
            signature: None,
            replace_existing: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelAck {
    Requested,
    AlreadyFinished,
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReceipt {
    pub app_id: String,
    pub name: String,
    pub version: String,
    pub content_sha256: String,
    pub artifact_sha256: Option<String>,
    pub source_url: Option<String>,
    pub job_id: Option<String>,
    pub installed_at_unix_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub app_id: String,
    pub name: String,
    pub version: String,
    pub content_sha256: String,
    pub installed_at_unix_ms: u64,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromoteOutcome {
    RenamedDirectly,
    CopiedThenRenamed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PromoteStrategy {
    #[default]
    Auto,
    ForceCopy,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub removed: Vec<PathBuf>,
    pub skipped_active: usize,
    pub skipped_recent: usize,
}
