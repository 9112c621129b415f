use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::model::{
    ChannelState, ModelError, PersistedRow, ProgressRecord, TrackedFile, UploadStatus,
};

pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid row: {0}")]
    InvalidRow(#[from] ModelError),
    #[error("data directory is unavailable")]
    MissingDataDir,
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Key-value view of the externally editable tabular store. Rows are keyed
/// by file id within a channel; only orchestrator-owned columns pass through.
#[async_trait]
pub trait RowStore: Send + Sync {
    async fn load_rows(&self, channel_id: &str) -> Result<Vec<PersistedRow>, StoreError>;

    async fn get_by_key(
        &self,
        channel_id: &str,
        file_id: &str,
    ) -> Result<Option<PersistedRow>, StoreError>;

    async fn upsert_by_key(&self, channel_id: &str, row: &PersistedRow) -> Result<(), StoreError>;

    async fn append_rows(&self, channel_id: &str, rows: &[PersistedRow]) -> Result<(), StoreError>;

    /// Clears the tracked range of a channel. Columns owned by people are
    /// not part of that range.
    async fn clear_all(&self, channel_id: &str) -> Result<(), StoreError>;

    async fn load_progress(&self, channel_id: &str) -> Result<Option<ProgressRecord>, StoreError>;

    async fn save_progress(&self, record: &ProgressRecord) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub matched: usize,
    pub restored_uploads: usize,
    pub carried: usize,
}

/// Folds one persisted row into a freshly built local file.
///
/// Local values win when they differ from the analysis default; default
/// columns take the persisted value. A persisted `uploaded` is never
/// downgraded. Returns true when the persisted row restored an upload.
pub fn merge_row(local: &mut TrackedFile, persisted: &PersistedRow) -> bool {
    let mut restored = false;
    if persisted.status == UploadStatus::Uploaded && local.status != UploadStatus::Uploaded {
        local.status = UploadStatus::Uploaded;
        local.upload_error = None;
        if persisted.upload_date.is_some() {
            local.upload_date = persisted.upload_date.clone();
        }
        if persisted.remote_link.is_some() {
            local.remote_link = persisted.remote_link.clone();
        }
        restored = true;
    } else if local.status == UploadStatus::Pending {
        local.status = persisted.status;
    }

    if local.upload_date.is_none() {
        local.upload_date = persisted.upload_date.clone();
    }
    if local.upload_error.is_none() && local.status != UploadStatus::Uploaded {
        local.upload_error = persisted.upload_error.clone();
    }
    if local.attempts == 0 {
        local.attempts = persisted.attempts;
    }
    if local.content_hash.is_none() {
        local.content_hash = persisted.content_hash.clone();
    }
    if local.remote_link.is_none() {
        local.remote_link = persisted.remote_link.clone();
    }
    if !local.deleted_from_source {
        local.deleted_from_source = persisted.deleted_from_source;
    }
    restored
}

/// Rate limit for progress checkpoints; first and last are forced through.
#[derive(Debug, Clone)]
pub struct ProgressCheckpointer {
    interval: Duration,
    last: Option<Instant>,
}

impl ProgressCheckpointer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    pub fn due(&mut self, force: bool, now: Instant) -> bool {
        let due = force
            || self
                .last
                .is_none_or(|last| now.saturating_duration_since(last) >= self.interval);
        if due {
            self.last = Some(now);
        }
        due
    }
}

pub struct StateReconciler {
    store: Arc<dyn RowStore>,
    checkpointer: ProgressCheckpointer,
}

impl StateReconciler {
    pub fn new(store: Arc<dyn RowStore>) -> Self {
        Self::with_progress_interval(store, DEFAULT_PROGRESS_INTERVAL)
    }

    pub fn with_progress_interval(store: Arc<dyn RowStore>, interval: Duration) -> Self {
        Self {
            store,
            checkpointer: ProgressCheckpointer::new(interval),
        }
    }

    pub fn store(&self) -> &Arc<dyn RowStore> {
        &self.store
    }

    /// Read path: merges persisted rows and the cached containers into the
    /// channel. Rows for files the scanner no longer reports are carried.
    pub async fn load_and_merge(
        &self,
        channel: &mut ChannelState,
    ) -> Result<MergeReport, StoreError> {
        let rows = self.store.load_rows(&channel.id).await?;
        let mut by_id: HashMap<String, PersistedRow> = HashMap::with_capacity(rows.len());
        let mut row_order = Vec::with_capacity(rows.len());
        for row in rows {
            row_order.push(row.file_id.clone());
            by_id.insert(row.file_id.clone(), row);
        }

        let mut report = MergeReport::default();
        for file in &mut channel.files {
            if let Some(row) = by_id.remove(file.id()) {
                report.matched += 1;
                if merge_row(file, &row) {
                    report.restored_uploads += 1;
                }
            }
        }
        channel.carried = row_order
            .into_iter()
            .filter_map(|id| by_id.remove(&id))
            .map(|mut row| {
                row.deleted_from_source = true;
                row
            })
            .collect();
        report.carried = channel.carried.len();

        if let Some(progress) = self.store.load_progress(&channel.id).await? {
            if channel.containers.album.is_none() {
                channel.containers.album = progress.containers.album;
            }
            if channel.containers.folder.is_none() {
                channel.containers.folder = progress.containers.folder;
            }
        }
        Ok(report)
    }

    /// Full-snapshot replace. Only for bulk recomputation and shutdown.
    pub async fn flush_all(&self, channel: &ChannelState) -> Result<(), StoreError> {
        let rows = channel.snapshot_rows();
        self.store.clear_all(&channel.id).await?;
        self.store.append_rows(&channel.id, &rows).await?;
        debug!(channel = %channel.id, rows = rows.len(), "snapshot written");
        Ok(())
    }

    /// Single-row write after a transfer, retried once. Returns false when
    /// persistence is lagging behind memory.
    pub async fn flush_file(&self, channel_id: &str, file: &TrackedFile) -> bool {
        let row = file.to_row();
        for attempt in 0..2 {
            match self.store.upsert_by_key(channel_id, &row).await {
                Ok(()) => return true,
                Err(err) if attempt == 0 => {
                    warn!(
                        channel = channel_id,
                        file = %file.name(),
                        error = %err,
                        "row checkpoint failed, retrying"
                    );
                }
                Err(err) => {
                    warn!(
                        channel = channel_id,
                        file = %file.name(),
                        error = %err,
                        "row checkpoint failed, state kept in memory"
                    );
                }
            }
        }
        false
    }

    pub async fn checkpoint_progress(&mut self, record: &ProgressRecord, force: bool) -> bool {
        if !self.checkpointer.due(force, Instant::now()) {
            return false;
        }
        match self.store.save_progress(record).await {
            Ok(()) => true,
            Err(err) => {
                warn!(channel = %record.channel_id, error = %err, "progress checkpoint failed");
                false
            }
        }
    }
}
