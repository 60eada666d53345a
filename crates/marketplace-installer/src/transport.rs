use std::io;
use std::path::PathBuf;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::AsyncReadExt;

use crate::error::InstallError;

const FILE_CHUNK_SIZE: usize = 64 * 1024;
const USER_AGENT: &str = concat!("marketplace-installer/", env!("CARGO_PKG_VERSION"));

#[async_trait]
pub trait ArtifactStream: Send {
    fn content_length(&self) -> Option<u64>;

    async fn next_chunk(&mut self) -> Result<Option<Bytes>, InstallError>;
}

#[async_trait]
pub trait ArtifactTransport: Send + Sync {
    async fn open(&self, source_url: &str) -> Result<Box<dyn ArtifactStream>, InstallError>;
}

#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpTransport {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client }
    }
}

struct HttpStream {
    response: reqwest::Response,
}

#[async_trait]
impl ArtifactStream for HttpStream {
    fn content_length(&self) -> Option<u64> {
        self.response.content_length()
    }

    async fn next_chunk(&mut self) -> Result<Option<Bytes>, InstallError> {
        self.response
            .chunk()
            .await
            .map_err(|err| InstallError::NetworkFailure(format!("download interrupted: {err}")))
    }
}

#[async_trait]
impl ArtifactTransport for HttpTransport {
    async fn open(&self, source_url: &str) -> Result<Box<dyn ArtifactStream>, InstallError> {
        let response = self
            .client
            .get(source_url)
            .send()
            .await
            .map_err(|err| InstallError::NetworkFailure(format!("request failed: {err}")))?;

        let status = response.status();
        if status.is_success() {
            return Ok(Box::new(HttpStream { response }));
        }
        if status.is_server_error()
            || status == reqwest::StatusCode::REQUEST_TIMEOUT
            || status == reqwest::StatusCode::TOO_MANY_REQUESTS
        {
            return Err(InstallError::NetworkFailure(format!(
                "source returned {status}: {source_url}"
            )));
        }
        Err(InstallError::InvalidRequest(format!(
            "source returned {status}: {source_url}"
        )))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FileTransport;

impl FileTransport {
    fn local_path(source_url: &str) -> PathBuf {
        PathBuf::from(source_url.strip_prefix("file://").unwrap_or(source_url))
    }
}

struct FileStream {
    file: tokio::fs::File,
    len: u64,
}

#[async_trait]
impl ArtifactStream for FileStream {
    fn content_length(&self) -> Option<u64> {
        Some(self.len)
    }

    async fn next_chunk(&mut self) -> Result<Option<Bytes>, InstallError> {
        let mut buffer = BytesMut::with_capacity(FILE_CHUNK_SIZE);
        let read = self
            .file
            .read_buf(&mut buffer)
            .await
            .map_err(|err| InstallError::NetworkFailure(format!("failed to read source: {err}")))?;
        if read == 0 {
            return Ok(None);
        }
        Ok(Some(buffer.freeze()))
    }
}

#[async_trait]
impl ArtifactTransport for FileTransport {
    async fn open(&self, source_url: &str) -> Result<Box<dyn ArtifactStream>, InstallError> {
        let path = Self::local_path(source_url);
        let file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(InstallError::InvalidRequest(format!(
                    "artifact not found: {}",
                    path.display()
                )));
            }
            Err(err) => {
                return Err(InstallError::NetworkFailure(format!(
                    "failed to open {}: {err}",
                    path.display()
                )));
            }
        };
        let metadata = file.metadata().await.map_err(|err| {
            InstallError::NetworkFailure(format!("failed to stat {}: {err}", path.display()))
        })?;
        if !metadata.is_file() {
            return Err(InstallError::InvalidRequest(format!(
                "artifact source is not a file: {}",
                path.display()
            )));
        }

        Ok(Box::new(FileStream {
            file,
            len: metadata.len(),
        }))
    }
}

#[derive(Clone, Default)]
pub struct DefaultTransport {
    http: HttpTransport,
    file: FileTransport,
}

#[async_trait]
impl ArtifactTransport for DefaultTransport {
    async fn open(&self, source_url: &str) -> Result<Box<dyn ArtifactStream>, InstallError> {
        let lower = source_url.to_ascii_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            return self.http.open(source_url).await;
        }
        if lower.starts_with("file://") || !lower.contains("://") {
            return self.file.open(source_url).await;
        }
        Err(InstallError::InvalidRequest(format!(
            "unsupported source scheme: {source_url}"
        )))
    }
}
