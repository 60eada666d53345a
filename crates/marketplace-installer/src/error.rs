use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::JobStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Busy,
    TooLarge,
    NetworkFailure,
    IntegrityFailure,
    ConflictExists,
    MoveFailed,
    AlreadyInstalled,
    NotInstalled,
    LeaseLost,
    InvalidRequest,
    Storage,
    Internal,
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Busy => "busy",
            Self::TooLarge => "too_large",
            Self::NetworkFailure => "network_failure",
            Self::IntegrityFailure => "integrity_failure",
            Self::ConflictExists => "conflict_exists",
            Self::MoveFailed => "move_failed",
            Self::AlreadyInstalled => "already_installed",
            Self::NotInstalled => "not_installed",
            Self::LeaseLost => "lease_lost",
            Self::InvalidRequest => "invalid_request",
            Self::Storage => "storage",
            Self::Internal => "internal",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InstallError {
    #[error("lock '{key}' is busy{}", holder_suffix(.holder))]
    Busy { key: String, holder: Option<String> },
    #[error("artifact exceeds the {limit} byte ceiling (observed {observed} bytes)")]
    TooLarge { limit: u64, observed: u64 },
    #[error("network failure: {0}")]
    NetworkFailure(String),
    #[error("integrity failure: {0}")]
    IntegrityFailure(String),
    #[error("canonical path already exists: {}", .path.display())]
    ConflictExists { path: PathBuf },
    #[error("move failed: {0}")]
    MoveFailed(String),
    #[error("application '{app_id}' is already installed")]
    AlreadyInstalled { app_id: String },
    #[error("application '{app_id}' is not installed")]
    NotInstalled { app_id: String },
    #[error("lease for lock '{key}' was lost")]
    LeaseLost { key: String },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("storage failure: {0}")]
    Storage(String),
    #[error("invalid job transition {} -> {}", .from.as_str(), .to.as_str())]
    InvalidTransition { from: JobStatus, to: JobStatus },
    #[error("job was cancelled")]
    Cancelled,
}

fn holder_suffix(holder: &Option<String>) -> String {
    holder
        .as_ref()
        .map(|holder| format!(" (held by job {holder})"))
        .unwrap_or_default()
}

impl InstallError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Busy { .. } => ErrorKind::Busy,
            Self::TooLarge { .. } => ErrorKind::TooLarge,
            Self::NetworkFailure(_) => ErrorKind::NetworkFailure,
            Self::IntegrityFailure(_) => ErrorKind::IntegrityFailure,
            Self::ConflictExists { .. } => ErrorKind::ConflictExists,
            Self::MoveFailed(_) => ErrorKind::MoveFailed,
            Self::AlreadyInstalled { .. } => ErrorKind::AlreadyInstalled,
            Self::NotInstalled { .. } => ErrorKind::NotInstalled,
            Self::LeaseLost { .. } => ErrorKind::LeaseLost,
            Self::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Self::Storage(_) => ErrorKind::Storage,
            Self::InvalidTransition { .. } => ErrorKind::Internal,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::NetworkFailure(_))
    }

    pub(crate) fn storage(err: anyhow::Error) -> Self {
        Self::Storage(format!("{err:#}"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobErrorDetail {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&InstallError> for JobErrorDetail {
    fn from(value: &InstallError) -> Self {
        Self {
            kind: value.kind(),
            message: value.to_string(),
        }
    }
}
