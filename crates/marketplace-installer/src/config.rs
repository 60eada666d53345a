use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};

use crate::retry::RetryPolicy;
use crate::types::PromoteStrategy;

pub const ENV_ROOT: &str = "MARKETPLACE_ROOT";
pub const ENV_MAX_ARTIFACT_BYTES: &str = "MARKETPLACE_MAX_ARTIFACT_BYTES";
pub const ENV_LOCK_LEASE_SECS: &str = "MARKETPLACE_LOCK_LEASE_SECS";
pub const ENV_LOCK_WAIT_SECS: &str = "MARKETPLACE_LOCK_WAIT_SECS";
pub const ENV_RETRY_MAX_ATTEMPTS: &str = "MARKETPLACE_RETRY_MAX_ATTEMPTS";
pub const ENV_RETRY_BASE_DELAY_MS: &str = "MARKETPLACE_RETRY_BASE_DELAY_MS";
pub const ENV_RETRY_MAX_DELAY_MS: &str = "MARKETPLACE_RETRY_MAX_DELAY_MS";
pub const ENV_FETCH_TIMEOUT_SECS: &str = "MARKETPLACE_FETCH_TIMEOUT_SECS";
pub const ENV_STAGING_GRACE_SECS: &str = "MARKETPLACE_STAGING_GRACE_SECS";
pub const ENV_JOB_RETENTION_SECS: &str = "MARKETPLACE_JOB_RETENTION_SECS";
pub const ENV_SWEEP_INTERVAL_SECS: &str = "MARKETPLACE_SWEEP_INTERVAL_SECS";

const DEFAULT_MAX_ARTIFACT_BYTES: u64 = 512 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarketplaceConfig {
    pub root: PathBuf,
    pub max_artifact_bytes: u64,
    pub lock_lease: Duration,
    pub lock_wait_timeout: Duration,
    pub retry: RetryPolicy,
    pub fetch_timeout: Duration,
    pub staging_grace: Duration,
    pub job_retention: Duration,
    pub sweep_interval: Duration,
    pub promote_strategy: PromoteStrategy,
}

impl MarketplaceConfig {
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            max_artifact_bytes: DEFAULT_MAX_ARTIFACT_BYTES,
            lock_lease: Duration::from_secs(30),
            lock_wait_timeout: Duration::from_secs(60),
            retry: RetryPolicy::default(),
            fetch_timeout: Duration::from_secs(300),
            staging_grace: Duration::from_secs(3600),
            job_retention: Duration::from_secs(86_400),
            sweep_interval: Duration::from_secs(600),
            promote_strategy: PromoteStrategy::Auto,
        }
    }

    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let value = |key: &str| {
            lookup(key)
                .map(|raw| raw.trim().to_string())
                .filter(|raw| !raw.is_empty())
        };

        let root = match value(ENV_ROOT) {
            Some(root) => PathBuf::from(root),
            None => default_marketplace_root(&lookup)?,
        };
        let mut config = Self::with_root(root);

        if let Some(raw) = value(ENV_MAX_ARTIFACT_BYTES) {
            config.max_artifact_bytes = parse_number(ENV_MAX_ARTIFACT_BYTES, &raw)?;
        }
        if let Some(raw) = value(ENV_LOCK_LEASE_SECS) {
            config.lock_lease = Duration::from_secs(parse_number(ENV_LOCK_LEASE_SECS, &raw)?);
            if config.lock_lease.is_zero() {
                return Err(anyhow!("{ENV_LOCK_LEASE_SECS} must be greater than zero"));
            }
        }
        if let Some(raw) = value(ENV_LOCK_WAIT_SECS) {
            config.lock_wait_timeout =
                Duration::from_secs(parse_number(ENV_LOCK_WAIT_SECS, &raw)?);
        }
        if let Some(raw) = value(ENV_RETRY_MAX_ATTEMPTS) {
            config.retry.max_attempts = parse_number(ENV_RETRY_MAX_ATTEMPTS, &raw)?;
            if config.retry.max_attempts == 0 {
                return Err(anyhow!("{ENV_RETRY_MAX_ATTEMPTS} must be at least 1"));
            }
        }
        if let Some(raw) = value(ENV_RETRY_BASE_DELAY_MS) {
            config.retry.base_delay =
                Duration::from_millis(parse_number(ENV_RETRY_BASE_DELAY_MS, &raw)?);
        }
        if let Some(raw) = value(ENV_RETRY_MAX_DELAY_MS) {
            config.retry.max_delay =
                Duration::from_millis(parse_number(ENV_RETRY_MAX_DELAY_MS, &raw)?);
        }
        if let Some(raw) = value(ENV_FETCH_TIMEOUT_SECS) {
            config.fetch_timeout = Duration::from_secs(parse_number(ENV_FETCH_TIMEOUT_SECS, &raw)?);
        }
        if let Some(raw) = value(ENV_STAGING_GRACE_SECS) {
            config.staging_grace = Duration::from_secs(parse_number(ENV_STAGING_GRACE_SECS, &raw)?);
        }
        if let Some(raw) = value(ENV_JOB_RETENTION_SECS) {
            config.job_retention = Duration::from_secs(parse_number(ENV_JOB_RETENTION_SECS, &raw)?);
        }
        if let Some(raw) = value(ENV_SWEEP_INTERVAL_SECS) {
            config.sweep_interval =
                Duration::from_secs(parse_number(ENV_SWEEP_INTERVAL_SECS, &raw)?);
            if config.sweep_interval.is_zero() {
                return Err(anyhow!("{ENV_SWEEP_INTERVAL_SECS} must be greater than zero"));
            }
        }

        Ok(config)
    }
}

fn parse_number<T>(key: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.parse::<T>()
        .with_context(|| format!("{key} must be a non-negative integer, got '{raw}'"))
}

pub fn default_marketplace_root<F>(lookup: F) -> Result<PathBuf>
where
    F: Fn(&str) -> Option<String>,
{
    if cfg!(windows) {
        let app_data = lookup("LOCALAPPDATA")
            .context("LOCALAPPDATA is not set; cannot resolve Windows marketplace root")?;
        return Ok(PathBuf::from(app_data).join("Marketplace"));
    }

    let home = lookup("HOME").context("HOME is not set; cannot resolve marketplace root")?;
    Ok(PathBuf::from(home).join(".marketplace"))
}
