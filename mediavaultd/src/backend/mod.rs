//! Remote services the orchestrator talks to, and the single error shape
//! every backend failure is normalized into.

pub mod disk;
pub mod transfer;

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mediavault_core::DiskError;

pub use disk::DiskBlobStore;
pub use transfer::{TransferClient, TransferError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorOrigin {
    /// The service answered with a status code.
    Http,
    /// No usable answer: DNS, connect, reset, timeout.
    Network,
    /// Local file access while preparing a transfer.
    Io,
    /// Anything the adapter rejected on its own.
    Backend,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendError {
    pub origin: ErrorOrigin,
    pub code: Option<u16>,
    pub message: String,
    pub retry_after_ms: Option<u64>,
}

impl BackendError {
    pub fn http(code: u16, message: impl Into<String>) -> Self {
        Self {
            origin: ErrorOrigin::Http,
            code: Some(code),
            message: message.into(),
            retry_after_ms: None,
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self {
            origin: ErrorOrigin::Network,
            code: None,
            message: message.into(),
            retry_after_ms: None,
        }
    }

    pub fn backend(message: impl Into<String>) -> Self {
        Self {
            origin: ErrorOrigin::Backend,
            code: None,
            message: message.into(),
            retry_after_ms: None,
        }
    }

    pub fn unauthenticated() -> Self {
        Self::http(401, "no credentials available")
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after_ms = Some(retry_after.as_millis().min(u128::from(u64::MAX)) as u64);
        self
    }

    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after_ms.map(Duration::from_millis)
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "[{code}] {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for BackendError {}

impl From<std::io::Error> for BackendError {
    fn from(err: std::io::Error) -> Self {
        Self {
            origin: ErrorOrigin::Io,
            code: None,
            message: err.to_string(),
            retry_after_ms: None,
        }
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return Self::http(status.as_u16(), err.to_string());
        }
        // reqwest's Display is vague ("error sending request"); name the failure.
        let message = if err.is_timeout() {
            format!("timeout: {err}")
        } else if err.is_connect() {
            format!("connection failed: {err}")
        } else {
            format!("network error: {err}")
        };
        Self::network(message)
    }
}

impl From<DiskError> for BackendError {
    fn from(err: DiskError) -> Self {
        match err {
            DiskError::Api {
                status,
                body,
                retry_after,
            } => {
                let normalized = Self::http(status.as_u16(), body);
                match retry_after {
                    Some(delay) => normalized.with_retry_after(delay),
                    None => normalized,
                }
            }
            DiskError::Request(err) => Self::from(err),
            DiskError::Url(err) => Self::backend(format!("invalid url: {err}")),
        }
    }
}

pub type ProgressFn = Arc<dyn Fn(u64, u64) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobMetadata {
    pub name: String,
    pub mime_type: String,
    pub parent_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteBlob {
    pub id: String,
    pub name: String,
    pub size: u64,
    pub mime_type: String,
    pub created_time: Option<String>,
    pub web_link: Option<String>,
}

/// Folder-based storage for arbitrary files.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn create(
        &self,
        metadata: &BlobMetadata,
        bytes: Vec<u8>,
    ) -> Result<RemoteBlob, BackendError>;

    async fn create_resumable(
        &self,
        metadata: &BlobMetadata,
        source: &Path,
        total_bytes: u64,
        progress: ProgressFn,
    ) -> Result<RemoteBlob, BackendError>;

    async fn create_container(
        &self,
        name: &str,
        parent_id: Option<&str>,
    ) -> Result<String, BackendError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaItemMetadata {
    pub file_name: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaItem {
    pub id: String,
    pub filename: String,
    pub product_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipResult {
    pub item_id: String,
    pub added: bool,
    pub message: Option<String>,
}

/// Photo/video library with albums. Items are created in two phases:
/// raw bytes first, then an item referencing the returned upload token.
#[async_trait]
pub trait MediaLibrary: Send + Sync {
    async fn upload_bytes(
        &self,
        bytes: Vec<u8>,
        file_name: &str,
        mime_type: &str,
    ) -> Result<String, BackendError>;

    async fn create_item(
        &self,
        upload_token: &str,
        metadata: &MediaItemMetadata,
    ) -> Result<MediaItem, BackendError>;

    async fn create_container(&self, name: &str) -> Result<String, BackendError>;

    async fn add_items_to_container(
        &self,
        container_id: &str,
        item_ids: &[String],
    ) -> Result<Vec<MembershipResult>, BackendError>;
}

pub trait CredentialProvider: Send + Sync {
    fn is_authenticated(&self) -> bool;
    fn current_credentials(&self) -> Option<String>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn disk_api_error_keeps_status_and_retry_hint() {
        let err = BackendError::from(DiskError::Api {
            status: StatusCode::SERVICE_UNAVAILABLE,
            body: "try later".into(),
            retry_after: Some(Duration::from_secs(2)),
        });
        assert_eq!(err.origin, ErrorOrigin::Http);
        assert_eq!(err.code, Some(503));
        assert_eq!(err.message, "try later");
        assert_eq!(err.retry_after(), Some(Duration::from_secs(2)));
        assert_eq!(err.to_string(), "[503] try later");
    }

    #[test]
    fn io_error_is_tagged_local() {
        let err = BackendError::from(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "denied",
        ));
        assert_eq!(err.origin, ErrorOrigin::Io);
        assert_eq!(err.code, None);
        assert_eq!(err.to_string(), "denied");
    }
}
