mod archive;
mod config;
mod download;
mod error;
mod fs_utils;
mod jobs;
mod layout;
mod lock;
mod promote;
mod receipts;
mod retry;
mod service;
mod staging;
mod sweep;
mod transport;
mod types;

pub use config::{default_marketplace_root, MarketplaceConfig, ENV_ROOT};
pub use download::{fetch_artifact, verify_artifact, FetchOutcome, VerifiedArtifact};
pub use error::{ErrorKind, InstallError, JobErrorDetail};
pub use fs_utils::{tree_digest, TreeDigest};
pub use jobs::{JobRecord, JobRegistry, JobWriter, ProgressSink};
pub use layout::{MarketplaceLayout, SiblingKind};
pub use lock::{
    HolderProbe, HolderStatus, LeaseKeeper, LockHandle, LockHolder, LockKey, LockManager,
    LockMarker, LockState,
};
pub use marketplace_security::ArtifactSignature;
pub use promote::promote;
pub use receipts::{read_install_receipt, read_registry, write_install_receipt, RECEIPT_FILE_NAME};
pub use retry::{with_retry, RetryError, RetryPolicy};
pub use service::Marketplace;
pub use staging::{discard_staging, stage, unpack_artifact, StagingArea};
pub use sweep::sweep_orphans;
pub use transport::{
    ArtifactStream, ArtifactTransport, DefaultTransport, FileTransport, HttpTransport,
};
pub use types::{
    CancelAck, InstallReceipt, InstallRequest, JobKind, JobStatus, JobView, PromoteOutcome,
    PromoteStrategy, RegistryEntry, StatusChange, SweepReport,
};
