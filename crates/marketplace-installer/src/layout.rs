use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

const INCOMING_PREFIX: &str = ".incoming-";
const REPLACED_PREFIX: &str = ".replaced-";
const REMOVING_PREFIX: &str = ".removing-";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiblingKind {
    Incoming,
    Replaced,
    Removing,
}

impl SiblingKind {
    fn prefix(self) -> &'static str {
        match self {
            Self::Incoming => INCOMING_PREFIX,
            Self::Replaced => REPLACED_PREFIX,
            Self::Removing => REMOVING_PREFIX,
        }
    }

    pub fn dir_name(self, job_id: &str) -> String {
        format!("{}{job_id}", self.prefix())
    }

    pub fn parse_dir_name(name: &str) -> Option<(Self, &str)> {
        [Self::Incoming, Self::Replaced, Self::Removing]
            .into_iter()
            .find_map(|kind| {
                name.strip_prefix(kind.prefix())
                    .filter(|job_id| !job_id.is_empty())
                    .map(|job_id| (kind, job_id))
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarketplaceLayout {
    root: PathBuf,
}

impl MarketplaceLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn apps_dir(&self) -> PathBuf {
        self.root.join("apps")
    }

    pub fn app_dir(&self, app_id: &str) -> PathBuf {
        self.apps_dir().join(app_id)
    }

    pub fn sibling_path(&self, kind: SiblingKind, job_id: &str) -> PathBuf {
        self.apps_dir().join(kind.dir_name(job_id))
    }

    pub fn staging_root(&self) -> PathBuf {
        self.root.join(".staging")
    }

    pub fn staging_path(&self, job_id: &str) -> PathBuf {
        self.staging_root().join(job_id)
    }

    pub fn staging_artifact_path(&self, job_id: &str) -> PathBuf {
        self.staging_path(job_id).join("artifact.part")
    }

    pub fn staging_tree_path(&self, job_id: &str) -> PathBuf {
        self.staging_path(job_id).join("tree")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.root.join(".locks")
    }

    pub fn lock_path(&self, file_stem: &str) -> PathBuf {
        self.locks_dir().join(format!("{file_stem}.lock"))
    }

    pub fn jobs_dir(&self) -> PathBuf {
        self.root.join(".jobs")
    }

    pub fn job_record_path(&self, job_id: &str) -> PathBuf {
        self.jobs_dir().join(format!("{job_id}.json"))
    }

    pub fn ensure_base_dirs(&self) -> Result<()> {
        for dir in [
            self.apps_dir(),
            self.staging_root(),
            self.locks_dir(),
            self.jobs_dir(),
        ] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}
