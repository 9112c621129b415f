use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::backend::{
    BackendError, BlobMetadata, BlobStore, MediaItemMetadata, MediaLibrary, ProgressFn,
};
use crate::model::{ChannelContainers, Container, FileDescriptor, MediaType, TrackedFile};

pub const DEFAULT_RESUMABLE_THRESHOLD: u64 = 5 * 1024 * 1024;
pub const MEMBERSHIP_BATCH_SIZE: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    MediaLibrary,
    BlobStore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadMode {
    SingleShot,
    Resumable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub destination: Destination,
    pub mode: UploadMode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOutcome {
    pub route: Route,
    pub remote_id: String,
    pub remote_link: Option<String>,
    /// Set only when this transfer had to create the channel's container.
    pub created_container: Option<Container>,
    /// The item exists but could not be added to the album.
    pub album_error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MembershipReport {
    pub added: Vec<String>,
    /// Item ids paired with the reason they were left out.
    pub rejected: Vec<(String, String)>,
}

pub fn is_media(descriptor: &FileDescriptor) -> bool {
    let mime = descriptor.mime_type.to_ascii_lowercase();
    mime.starts_with("image/")
        || mime.starts_with("video/")
        || matches!(descriptor.media_type, MediaType::Image | MediaType::Video)
}

pub struct TransferRouter {
    blob_store: Arc<dyn BlobStore>,
    media_library: Option<Arc<dyn MediaLibrary>>,
    resumable_threshold: u64,
    blob_root: Option<String>,
}

impl TransferRouter {
    pub fn new(blob_store: Arc<dyn BlobStore>) -> Self {
        Self {
            blob_store,
            media_library: None,
            resumable_threshold: DEFAULT_RESUMABLE_THRESHOLD,
            blob_root: None,
        }
    }

    pub fn with_media_library(mut self, media_library: Arc<dyn MediaLibrary>) -> Self {
        self.media_library = Some(media_library);
        self
    }

    pub fn with_resumable_threshold(mut self, threshold: u64) -> Self {
        self.resumable_threshold = threshold;
        self
    }

    pub fn with_blob_root(mut self, root: Option<String>) -> Self {
        self.blob_root = root;
        self
    }

    /// Photos and videos go to the media library when one is configured;
    /// everything else goes to the blob store.
    pub fn route(&self, descriptor: &FileDescriptor) -> Route {
        if self.media_library.is_some() && is_media(descriptor) {
            return Route {
                destination: Destination::MediaLibrary,
                mode: UploadMode::SingleShot,
            };
        }
        let mode = if descriptor.size >= self.resumable_threshold {
            UploadMode::Resumable
        } else {
            UploadMode::SingleShot
        };
        Route {
            destination: Destination::BlobStore,
            mode,
        }
    }

    /// Uploads one file. A container created on the way is written into
    /// `containers` before any bytes move, so a retry after a failed upload
    /// reuses it.
    pub async fn transfer(
        &self,
        file: &TrackedFile,
        channel_name: &str,
        containers: &mut ChannelContainers,
    ) -> Result<TransferOutcome, BackendError> {
        let route = self.route(&file.descriptor);
        match (route.destination, self.media_library.as_ref()) {
            (Destination::MediaLibrary, Some(library)) => {
                self.transfer_media(library.as_ref(), route, file, channel_name, containers)
                    .await
            }
            _ => self.transfer_blob(route, file, channel_name, containers).await,
        }
    }

    async fn transfer_media(
        &self,
        library: &dyn MediaLibrary,
        route: Route,
        file: &TrackedFile,
        channel_name: &str,
        containers: &mut ChannelContainers,
    ) -> Result<TransferOutcome, BackendError> {
        let (album, created_container) = match containers.album.clone() {
            Some(album) => (album, None),
            None => {
                let id = library.create_container(channel_name).await?;
                let album = Container {
                    id,
                    name: channel_name.to_string(),
                };
                info!(channel = channel_name, album = %album.id, "created album");
                containers.album = Some(album.clone());
                (album.clone(), Some(album))
            }
        };

        let descriptor = &file.descriptor;
        let bytes = tokio::fs::read(&descriptor.path).await?;
        let token = library
            .upload_bytes(bytes, &descriptor.name, &descriptor.mime_type)
            .await?;
        let item = library
            .create_item(
                &token,
                &MediaItemMetadata {
                    file_name: descriptor.name.clone(),
                    description: Some(channel_name.to_string()),
                },
            )
            .await?;

        let membership =
            add_to_container(library, &album.id, std::slice::from_ref(&item.id)).await;
        let album_error = membership
            .rejected
            .into_iter()
            .next()
            .map(|(_, reason)| reason);

        Ok(TransferOutcome {
            route,
            remote_link: item.product_url.clone().or_else(|| Some(item.id.clone())),
            remote_id: item.id,
            created_container,
            album_error,
        })
    }

    async fn transfer_blob(
        &self,
        route: Route,
        file: &TrackedFile,
        channel_name: &str,
        containers: &mut ChannelContainers,
    ) -> Result<TransferOutcome, BackendError> {
        let (folder, created_container) = match containers.folder.clone() {
            Some(folder) => (folder, None),
            None => {
                let id = self
                    .blob_store
                    .create_container(channel_name, self.blob_root.as_deref())
                    .await?;
                let folder = Container {
                    id,
                    name: channel_name.to_string(),
                };
                info!(channel = channel_name, folder = %folder.id, "created folder");
                containers.folder = Some(folder.clone());
                (folder.clone(), Some(folder))
            }
        };

        let descriptor = &file.descriptor;
        let metadata = BlobMetadata {
            name: descriptor.name.clone(),
            mime_type: descriptor.mime_type.clone(),
            parent_id: Some(folder.id),
        };
        let blob = match route.mode {
            UploadMode::SingleShot => {
                let bytes = tokio::fs::read(&descriptor.path).await?;
                self.blob_store.create(&metadata, bytes).await?
            }
            UploadMode::Resumable => {
                let name = descriptor.name.clone();
                let progress: ProgressFn = Arc::new(move |sent, total| {
                    debug!(file = %name, sent, total, "upload progress");
                });
                self.blob_store
                    .create_resumable(&metadata, &descriptor.path, descriptor.size, progress)
                    .await?
            }
        };

        Ok(TransferOutcome {
            route,
            remote_link: blob.web_link.clone().or_else(|| Some(blob.id.clone())),
            remote_id: blob.id,
            created_container,
            album_error: None,
        })
    }

    /// Adds items that missed the album during their transfer. Returns `None`
    /// when there is no media library or no album to join.
    pub async fn join_album(
        &self,
        containers: &ChannelContainers,
        item_ids: &[String],
    ) -> Option<MembershipReport> {
        let library = self.media_library.as_ref()?;
        let album = containers.album.as_ref()?;
        Some(add_to_container(library.as_ref(), &album.id, item_ids).await)
    }
}

/// Adds items to an album in batches of at most [`MEMBERSHIP_BATCH_SIZE`].
/// Membership failures are logged, not returned: the items already exist
/// and re-uploading them would create duplicates.
pub async fn add_to_container(
    library: &dyn MediaLibrary,
    container_id: &str,
    item_ids: &[String],
) -> MembershipReport {
    let mut report = MembershipReport::default();
    for batch in item_ids.chunks(MEMBERSHIP_BATCH_SIZE) {
        match library.add_items_to_container(container_id, batch).await {
            Ok(results) => {
                for result in results {
                    if result.added {
                        report.added.push(result.item_id);
                        continue;
                    }
                    let reason = result.message.unwrap_or_else(|| "unknown".to_string());
                    warn!(
                        album = container_id,
                        item = %result.item_id,
                        reason = %reason,
                        "item was not added to album"
                    );
                    report.rejected.push((result.item_id, reason));
                }
            }
            Err(err) => {
                warn!(album = container_id, error = %err, "adding items to album failed");
                let reason = err.to_string();
                report
                    .rejected
                    .extend(batch.iter().map(|id| (id.clone(), reason.clone())));
            }
        }
    }
    report
}
