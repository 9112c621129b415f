use std::io;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::StreamExt;
use reqwest::Client;
use thiserror::Error;
use tokio_util::io::ReaderStream;
use url::Url;

use super::{BackendError, ProgressFn};

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
}

impl From<TransferError> for BackendError {
    fn from(err: TransferError) -> Self {
        match err {
            TransferError::Request(err) => BackendError::from(err),
            TransferError::Io(err) => BackendError::from(err),
            TransferError::Url(err) => BackendError::backend(format!("invalid url: {err}")),
        }
    }
}

/// Moves bytes to pre-negotiated upload URLs.
#[derive(Clone, Default)]
pub struct TransferClient {
    http: Client,
}

impl TransferClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_http(http: Client) -> Self {
        Self { http }
    }

    pub async fn put_bytes(&self, href: &str, bytes: Vec<u8>) -> Result<(), TransferError> {
        let url = Url::parse(href)?;
        self.http
            .put(url)
            .body(bytes)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Streams `source` in chunks, reporting `(sent, total)` after each one.
    pub async fn put_file(
        &self,
        href: &str,
        source: &Path,
        total_bytes: u64,
        progress: ProgressFn,
    ) -> Result<(), TransferError> {
        let url = Url::parse(href)?;
        let file = tokio::fs::File::open(source).await?;
        let sent = Arc::new(AtomicU64::new(0));
        let stream = ReaderStream::new(file).map(move |chunk| {
            if let Ok(bytes) = &chunk {
                let now = sent.fetch_add(bytes.len() as u64, Ordering::SeqCst) + bytes.len() as u64;
                progress(now, total_bytes);
            }
            chunk
        });
        self.http
            .put(url)
            .header(reqwest::header::CONTENT_LENGTH, total_bytes)
            .body(reqwest::Body::wrap_stream(stream))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::tempdir;
    use wiremock::matchers::{body_bytes, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn put_bytes_sends_payload() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/upload"))
            .and(body_bytes(b"payload"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        TransferClient::new()
            .put_bytes(&format!("{}/upload", server.uri()), b"payload".to_vec())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn put_file_streams_contents_and_reports_progress() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/upload"))
            .and(body_bytes(b"streamed payload"))
            .respond_with(ResponseTemplate::new(201))
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let source = dir.path().join("in.bin");
        std::fs::write(&source, b"streamed payload").unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let progress: ProgressFn = Arc::new(move |sent, total| {
            sink.lock().unwrap().push((sent, total));
        });

        TransferClient::new()
            .put_file(&format!("{}/upload", server.uri()), &source, 16, progress)
            .await
            .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.last(), Some(&(16, 16)));
    }

    #[tokio::test]
    async fn rejected_upload_maps_to_http_backend_error() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/upload"))
            .respond_with(ResponseTemplate::new(507))
            .mount(&server)
            .await;

        let err = TransferClient::new()
            .put_bytes(&format!("{}/upload", server.uri()), b"x".to_vec())
            .await
            .expect_err("expected failure");
        let normalized = BackendError::from(err);
        assert_eq!(normalized.code, Some(507));
    }
}
