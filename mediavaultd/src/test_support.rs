use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::backend::{
    BackendError, BlobMetadata, BlobStore, MediaItem, MediaItemMetadata, MediaLibrary,
    MembershipResult, ProgressFn, RemoteBlob,
};
use crate::model::{
    ChannelState, FileDescriptor, MediaType, PersistedRow, ProgressRecord, UploadStatus,
};
use crate::sync::reconcile::{RowStore, StoreError};

pub const CHANNEL_ID: &str = "chat-1";
pub const CHANNEL_NAME: &str = "Family";

/// Builds a descriptor for `dir/name`. When `dir` exists a file of `size`
/// bytes is written there so transfers can read it.
pub fn descriptor_at(
    dir: &Path,
    name: &str,
    mime_type: &str,
    media_type: MediaType,
    size: u64,
) -> FileDescriptor {
    let path = dir.join(name);
    if dir.is_dir() {
        let body: Vec<u8> = name.bytes().cycle().take(size as usize).collect();
        std::fs::write(&path, body).unwrap();
    }
    FileDescriptor {
        id: name.to_string(),
        name: name.to_string(),
        path,
        size,
        mime_type: mime_type.to_string(),
        media_type,
        timestamp: 0,
    }
}

/// Channel whose files do not exist on disk.
pub fn channel_with(ids: &[&str]) -> ChannelState {
    let descriptors = ids
        .iter()
        .map(|id| FileDescriptor {
            id: id.to_string(),
            name: format!("{id}.jpg"),
            path: PathBuf::from(format!("/nonexistent/{id}.jpg")),
            size: 1,
            mime_type: "image/jpeg".into(),
            media_type: MediaType::Image,
            timestamp: 0,
        })
        .collect();
    ChannelState::from_descriptors(CHANNEL_ID, CHANNEL_NAME, descriptors).unwrap()
}

/// Channel of `count` distinct documents named `f1.pdf`..`fN.pdf` on disk.
pub fn channel_on_disk(dir: &Path, count: usize) -> ChannelState {
    let descriptors = (1..=count)
        .map(|i| {
            let name = format!("f{i}.pdf");
            let path = dir.join(&name);
            std::fs::write(&path, format!("contents of file {i}")).unwrap();
            FileDescriptor {
                id: format!("f{i}"),
                name,
                path,
                size: 20,
                mime_type: "application/pdf".into(),
                media_type: MediaType::Document,
                timestamp: i as i64,
            }
        })
        .collect();
    ChannelState::from_descriptors(CHANNEL_ID, CHANNEL_NAME, descriptors).unwrap()
}

type UploadHook = Box<dyn Fn(&str) + Send + Sync>;

#[derive(Default)]
struct BlobInner {
    container_calls: usize,
    attempts: Vec<String>,
    uploads: Vec<String>,
    resumable: Vec<String>,
    failures: HashMap<String, VecDeque<BackendError>>,
}

#[derive(Default)]
pub struct FakeBlobStore {
    inner: Mutex<BlobInner>,
    on_upload: Mutex<Option<UploadHook>>,
}

impl FakeBlobStore {
    pub fn fail_next(&self, name: &str, err: BackendError) {
        self.fail_times(name, err, 1);
    }

    pub fn fail_times(&self, name: &str, err: BackendError, times: usize) {
        let mut inner = self.inner.lock().unwrap();
        let queue = inner.failures.entry(name.to_string()).or_default();
        for _ in 0..times {
            queue.push_back(err.clone());
        }
    }

    /// Runs after every successful upload with the blob name.
    pub fn on_upload(&self, hook: impl Fn(&str) + Send + Sync + 'static) {
        *self.on_upload.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn container_calls(&self) -> usize {
        self.inner.lock().unwrap().container_calls
    }

    pub fn attempted_names(&self) -> Vec<String> {
        self.inner.lock().unwrap().attempts.clone()
    }

    pub fn uploaded_names(&self) -> Vec<String> {
        self.inner.lock().unwrap().uploads.clone()
    }

    pub fn resumable_names(&self) -> Vec<String> {
        self.inner.lock().unwrap().resumable.clone()
    }

    fn record(
        &self,
        metadata: &BlobMetadata,
        size: u64,
        resumable: bool,
    ) -> Result<RemoteBlob, BackendError> {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.attempts.push(metadata.name.clone());
            if let Some(err) = inner
                .failures
                .get_mut(&metadata.name)
                .and_then(VecDeque::pop_front)
            {
                return Err(err);
            }
            inner.uploads.push(metadata.name.clone());
            if resumable {
                inner.resumable.push(metadata.name.clone());
            }
        }
        if let Some(hook) = self.on_upload.lock().unwrap().as_ref() {
            hook(&metadata.name);
        }
        Ok(RemoteBlob {
            id: format!("blob:{}", metadata.name),
            name: metadata.name.clone(),
            size,
            mime_type: metadata.mime_type.clone(),
            created_time: None,
            web_link: Some(format!("https://blob.test/{}", metadata.name)),
        })
    }
}

#[async_trait]
impl BlobStore for FakeBlobStore {
    async fn create(
        &self,
        metadata: &BlobMetadata,
        bytes: Vec<u8>,
    ) -> Result<RemoteBlob, BackendError> {
        self.record(metadata, bytes.len() as u64, false)
    }

    async fn create_resumable(
        &self,
        metadata: &BlobMetadata,
        _source: &Path,
        total_bytes: u64,
        progress: ProgressFn,
    ) -> Result<RemoteBlob, BackendError> {
        let blob = self.record(metadata, total_bytes, true)?;
        progress(total_bytes, total_bytes);
        Ok(blob)
    }

    async fn create_container(
        &self,
        name: &str,
        _parent_id: Option<&str>,
    ) -> Result<String, BackendError> {
        self.inner.lock().unwrap().container_calls += 1;
        Ok(format!("folder:{name}"))
    }
}

#[derive(Default)]
struct LibraryInner {
    container_calls: usize,
    tokens: Vec<String>,
    members: Vec<String>,
    batch_sizes: Vec<usize>,
    failing_memberships: usize,
}

#[derive(Default)]
pub struct FakeMediaLibrary {
    inner: Mutex<LibraryInner>,
}

impl FakeMediaLibrary {
    pub fn container_calls(&self) -> usize {
        self.inner.lock().unwrap().container_calls
    }

    pub fn uploaded_tokens(&self) -> Vec<String> {
        self.inner.lock().unwrap().tokens.clone()
    }

    pub fn album_members(&self) -> Vec<String> {
        self.inner.lock().unwrap().members.clone()
    }

    pub fn membership_batch_sizes(&self) -> Vec<usize> {
        self.inner.lock().unwrap().batch_sizes.clone()
    }

    /// The next `times` membership calls fail with a 503.
    pub fn fail_membership(&self, times: usize) {
        self.inner.lock().unwrap().failing_memberships = times;
    }
}

#[async_trait]
impl MediaLibrary for FakeMediaLibrary {
    async fn upload_bytes(
        &self,
        _bytes: Vec<u8>,
        file_name: &str,
        _mime_type: &str,
    ) -> Result<String, BackendError> {
        let token = format!("token:{file_name}");
        self.inner.lock().unwrap().tokens.push(token.clone());
        Ok(token)
    }

    async fn create_item(
        &self,
        _upload_token: &str,
        metadata: &MediaItemMetadata,
    ) -> Result<MediaItem, BackendError> {
        Ok(MediaItem {
            id: format!("item:{}", metadata.file_name),
            filename: metadata.file_name.clone(),
            product_url: None,
        })
    }

    async fn create_container(&self, name: &str) -> Result<String, BackendError> {
        self.inner.lock().unwrap().container_calls += 1;
        Ok(format!("album:{name}"))
    }

    async fn add_items_to_container(
        &self,
        _container_id: &str,
        item_ids: &[String],
    ) -> Result<Vec<MembershipResult>, BackendError> {
        let mut inner = self.inner.lock().unwrap();
        inner.batch_sizes.push(item_ids.len());
        if inner.failing_memberships > 0 {
            inner.failing_memberships -= 1;
            return Err(BackendError::http(503, "album unavailable"));
        }
        inner.members.extend(item_ids.iter().cloned());
        Ok(item_ids
            .iter()
            .map(|id| MembershipResult {
                item_id: id.clone(),
                added: true,
                message: None,
            })
            .collect())
    }
}

#[derive(Default)]
struct StoreInner {
    rows: HashMap<String, Vec<PersistedRow>>,
    progress: HashMap<String, ProgressRecord>,
    clear_calls: usize,
    upsert_calls: usize,
    progress_saves: usize,
    failing_upserts: usize,
    fail_clear: bool,
    upserted: Vec<(String, UploadStatus)>,
}

/// Row store kept in memory, with failure injection.
#[derive(Default)]
pub struct MemoryRowStore {
    inner: Mutex<StoreInner>,
}

impl MemoryRowStore {
    pub fn rows(&self, channel_id: &str) -> Vec<PersistedRow> {
        self.inner
            .lock()
            .unwrap()
            .rows
            .get(channel_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn row(&self, channel_id: &str, file_id: &str) -> Option<PersistedRow> {
        self.rows(channel_id)
            .into_iter()
            .find(|row| row.file_id == file_id)
    }

    pub fn progress(&self, channel_id: &str) -> Option<ProgressRecord> {
        self.inner.lock().unwrap().progress.get(channel_id).cloned()
    }

    pub fn clear_calls(&self) -> usize {
        self.inner.lock().unwrap().clear_calls
    }

    pub fn upsert_calls(&self) -> usize {
        self.inner.lock().unwrap().upsert_calls
    }

    pub fn progress_saves(&self) -> usize {
        self.inner.lock().unwrap().progress_saves
    }

    /// Statuses passed to `upsert_by_key`, in call order.
    pub fn upserted(&self) -> Vec<(String, UploadStatus)> {
        self.inner.lock().unwrap().upserted.clone()
    }

    pub fn fail_upserts(&self, count: usize) {
        self.inner.lock().unwrap().failing_upserts = count;
    }

    pub fn fail_clear(&self, fail: bool) {
        self.inner.lock().unwrap().fail_clear = fail;
    }
}

#[async_trait]
impl RowStore for MemoryRowStore {
    async fn load_rows(&self, channel_id: &str) -> Result<Vec<PersistedRow>, StoreError> {
        Ok(self.rows(channel_id))
    }

    async fn get_by_key(
        &self,
        channel_id: &str,
        file_id: &str,
    ) -> Result<Option<PersistedRow>, StoreError> {
        Ok(self.row(channel_id, file_id))
    }

    async fn upsert_by_key(&self, channel_id: &str, row: &PersistedRow) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.upsert_calls += 1;
        if inner.failing_upserts > 0 {
            inner.failing_upserts -= 1;
            return Err(StoreError::Unavailable("injected upsert failure".into()));
        }
        inner.upserted.push((row.file_id.clone(), row.status));
        let rows = inner.rows.entry(channel_id.to_string()).or_default();
        match rows.iter_mut().find(|existing| existing.file_id == row.file_id) {
            Some(existing) => *existing = row.clone(),
            None => rows.push(row.clone()),
        }
        Ok(())
    }

    async fn append_rows(&self, channel_id: &str, rows: &[PersistedRow]) -> Result<(), StoreError> {
        self.inner
            .lock()
            .unwrap()
            .rows
            .entry(channel_id.to_string())
            .or_default()
            .extend(rows.iter().cloned());
        Ok(())
    }

    async fn clear_all(&self, channel_id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.clear_calls += 1;
        if inner.fail_clear {
            return Err(StoreError::Unavailable("injected clear failure".into()));
        }
        inner.rows.remove(channel_id);
        Ok(())
    }

    async fn load_progress(&self, channel_id: &str) -> Result<Option<ProgressRecord>, StoreError> {
        Ok(self.progress(channel_id))
    }

    async fn save_progress(&self, record: &ProgressRecord) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.progress_saves += 1;
        inner
            .progress
            .insert(record.channel_id.clone(), record.clone());
        Ok(())
    }
}
