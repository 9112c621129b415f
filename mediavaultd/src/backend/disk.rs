use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use mediavault_core::{DiskClient, DiskError, Resource};
use reqwest::StatusCode;

use super::{
    BackendError, BlobMetadata, BlobStore, CredentialProvider, ProgressFn, RemoteBlob,
    TransferClient,
};

/// [`BlobStore`] over the disk REST API. Container ids are folder paths.
pub struct DiskBlobStore {
    client: DiskClient,
    transfer: TransferClient,
    credentials: Arc<dyn CredentialProvider>,
    root: String,
}

impl DiskBlobStore {
    pub fn new(
        client: DiskClient,
        credentials: Arc<dyn CredentialProvider>,
        root: impl Into<String>,
    ) -> Self {
        Self {
            client,
            transfer: TransferClient::new(),
            credentials,
            root: root.into(),
        }
    }

    fn authorized(&self) -> Result<DiskClient, BackendError> {
        let token = self
            .credentials
            .current_credentials()
            .ok_or_else(BackendError::unauthenticated)?;
        Ok(self.client.authorized(token))
    }

    fn target_path(&self, metadata: &BlobMetadata) -> String {
        let parent = metadata.parent_id.as_deref().unwrap_or(&self.root);
        join_remote(parent, &metadata.name)
    }

    async fn finish_upload(
        &self,
        client: &DiskClient,
        target: &str,
        metadata: &BlobMetadata,
        size: u64,
    ) -> Result<RemoteBlob, BackendError> {
        let resource = client.get_resource(target).await?;
        Ok(remote_blob_from(resource, metadata, size))
    }
}

#[async_trait]
impl BlobStore for DiskBlobStore {
    async fn create(
        &self,
        metadata: &BlobMetadata,
        bytes: Vec<u8>,
    ) -> Result<RemoteBlob, BackendError> {
        let client = self.authorized()?;
        let target = self.target_path(metadata);
        let size = bytes.len() as u64;
        let link = client.get_upload_link(&target, false).await?;
        self.transfer.put_bytes(link.href.as_str(), bytes).await?;
        self.finish_upload(&client, &target, metadata, size).await
    }

    async fn create_resumable(
        &self,
        metadata: &BlobMetadata,
        source: &Path,
        total_bytes: u64,
        progress: ProgressFn,
    ) -> Result<RemoteBlob, BackendError> {
        let client = self.authorized()?;
        let target = self.target_path(metadata);
        let link = client.get_upload_link(&target, false).await?;
        self.transfer
            .put_file(link.href.as_str(), source, total_bytes, progress)
            .await?;
        self.finish_upload(&client, &target, metadata, total_bytes)
            .await
    }

    async fn create_container(
        &self,
        name: &str,
        parent_id: Option<&str>,
    ) -> Result<String, BackendError> {
        let client = self.authorized()?;
        let path = join_remote(parent_id.unwrap_or(&self.root), &sanitize_segment(name));
        match client.create_folder(&path).await {
            Ok(_) => Ok(path),
            // Left over from an earlier run; reuse it.
            Err(DiskError::Api { status, .. }) if status == StatusCode::CONFLICT => Ok(path),
            Err(err) => Err(err.into()),
        }
    }
}

fn remote_blob_from(resource: Resource, metadata: &BlobMetadata, size: u64) -> RemoteBlob {
    RemoteBlob {
        id: resource.resource_id.unwrap_or_else(|| resource.path.clone()),
        name: resource.name,
        size: resource.size.unwrap_or(size),
        mime_type: resource
            .mime_type
            .unwrap_or_else(|| metadata.mime_type.clone()),
        created_time: resource.created,
        web_link: resource.public_url.or(Some(resource.path)),
    }
}

fn join_remote(parent: &str, name: &str) -> String {
    format!("{}/{}", parent.trim_end_matches('/'), name.trim_start_matches('/'))
}

/// Folder names come from chat titles; keep them to one path segment.
fn sanitize_segment(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if matches!(c, '/' | '\\' | ':') { '_' } else { c })
        .collect();
    let trimmed = cleaned.trim();
    if trimmed.is_empty() {
        "untitled".to_string()
    } else {
        trimmed.to_string()
    }
}
