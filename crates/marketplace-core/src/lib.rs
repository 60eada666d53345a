mod app_id;
mod archive;
mod manifest;

pub use app_id::{validate_app_id, AppId};
pub use archive::ArchiveFormat;
pub use manifest::{AppManifest, MANIFEST_FILE_NAME};
