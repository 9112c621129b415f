use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("duplicate file id {id} in channel {channel}")]
    DuplicateFileId { channel: String, id: String },
    #[error("invalid upload status: {0}")]
    InvalidStatus(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Image,
    Video,
    Audio,
    Document,
    Sticker,
    #[serde(other)]
    Other,
}

/// One file as produced by the external scanner. Never mutated here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDescriptor {
    pub id: String,
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
    pub mime_type: String,
    pub media_type: MediaType,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UploadStatus {
    Pending,
    Uploaded,
    Failed,
    Skipped,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStatus::Pending => "pending",
            UploadStatus::Uploaded => "uploaded",
            UploadStatus::Failed => "failed",
            UploadStatus::Skipped => "skipped",
        }
    }

    pub fn parse(value: &str) -> Result<Self, ModelError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" | "" => Ok(UploadStatus::Pending),
            "uploaded" => Ok(UploadStatus::Uploaded),
            "failed" => Ok(UploadStatus::Failed),
            "skipped" => Ok(UploadStatus::Skipped),
            other => Err(ModelError::InvalidStatus(other.to_string())),
        }
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedFile {
    pub descriptor: FileDescriptor,
    pub status: UploadStatus,
    pub upload_date: Option<String>,
    pub upload_error: Option<String>,
    pub attempts: u32,
    pub remote_link: Option<String>,
    pub content_hash: Option<String>,
    pub deleted_from_source: bool,
}

impl TrackedFile {
    pub fn new(descriptor: FileDescriptor) -> Self {
        Self {
            descriptor,
            status: UploadStatus::Pending,
            upload_date: None,
            upload_error: None,
            attempts: 0,
            remote_link: None,
            content_hash: None,
            deleted_from_source: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn is_eligible(&self, skip_failed: bool) -> bool {
        match self.status {
            UploadStatus::Pending => true,
            UploadStatus::Failed => !skip_failed,
            UploadStatus::Uploaded | UploadStatus::Skipped => false,
        }
    }

    pub fn mark_uploaded(&mut self, remote_link: Option<String>) {
        self.status = UploadStatus::Uploaded;
        self.upload_date = Some(now_rfc3339());
        self.upload_error = None;
        if remote_link.is_some() {
            self.remote_link = remote_link;
        }
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = UploadStatus::Failed;
        self.upload_date = Some(now_rfc3339());
        self.upload_error = Some(error.into());
    }

    pub fn mark_skipped(&mut self, reason: impl Into<String>) {
        self.status = UploadStatus::Skipped;
        self.upload_error = Some(reason.into());
    }

    pub fn to_row(&self) -> PersistedRow {
        PersistedRow {
            file_id: self.descriptor.id.clone(),
            file_name: self.descriptor.name.clone(),
            status: self.status,
            upload_date: self.upload_date.clone(),
            upload_error: self.upload_error.clone(),
            attempts: self.attempts,
            content_hash: self.content_hash.clone(),
            remote_link: self.remote_link.clone(),
            deleted_from_source: self.deleted_from_source,
        }
    }
}

/// Orchestrator-owned columns of one row in the tabular store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedRow {
    pub file_id: String,
    pub file_name: String,
    pub status: UploadStatus,
    pub upload_date: Option<String>,
    pub upload_error: Option<String>,
    pub attempts: u32,
    pub content_hash: Option<String>,
    pub remote_link: Option<String>,
    pub deleted_from_source: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    pub id: String,
    pub name: String,
}

/// Remote containers created for a channel, one per destination kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelContainers {
    pub album: Option<Container>,
    pub folder: Option<Container>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub pending: usize,
    pub uploaded: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl StatusCounts {
    pub fn total(&self) -> usize {
        self.pending + self.uploaded + self.failed + self.skipped
    }
}

#[derive(Debug, Clone)]
pub struct ChannelState {
    pub id: String,
    pub name: String,
    pub containers: ChannelContainers,
    /// Chronological, one entry per file id.
    pub files: Vec<TrackedFile>,
    /// Persisted rows whose file the scanner no longer reports.
    pub carried: Vec<PersistedRow>,
}

impl ChannelState {
    pub fn from_descriptors(
        id: impl Into<String>,
        name: impl Into<String>,
        descriptors: Vec<FileDescriptor>,
    ) -> Result<Self, ModelError> {
        let id = id.into();
        let mut seen = HashSet::with_capacity(descriptors.len());
        let mut files = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            if !seen.insert(descriptor.id.clone()) {
                return Err(ModelError::DuplicateFileId {
                    channel: id,
                    id: descriptor.id,
                });
            }
            files.push(TrackedFile::new(descriptor));
        }
        Ok(Self {
            id,
            name: name.into(),
            containers: ChannelContainers::default(),
            files,
            carried: Vec::new(),
        })
    }

    pub fn counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for file in &self.files {
            match file.status {
                UploadStatus::Pending => counts.pending += 1,
                UploadStatus::Uploaded => counts.uploaded += 1,
                UploadStatus::Failed => counts.failed += 1,
                UploadStatus::Skipped => counts.skipped += 1,
            }
        }
        counts
    }

    /// Every row a full-snapshot write must contain, scanned files first.
    pub fn snapshot_rows(&self) -> Vec<PersistedRow> {
        self.files
            .iter()
            .map(TrackedFile::to_row)
            .chain(self.carried.iter().cloned())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressState {
    Active,
    Completed,
    Interrupted,
}

impl ProgressState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProgressState::Active => "active",
            ProgressState::Completed => "completed",
            ProgressState::Interrupted => "interrupted",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "completed" => ProgressState::Completed,
            "interrupted" => ProgressState::Interrupted,
            _ => ProgressState::Active,
        }
    }
}

/// Per-channel progress checkpoint, kept apart from the per-file rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressRecord {
    pub channel_id: String,
    pub channel_name: String,
    pub counts: StatusCounts,
    pub last_file: Option<String>,
    pub state: ProgressState,
    pub containers: ChannelContainers,
    pub updated_at: i64,
}

impl ProgressRecord {
    pub fn from_channel(
        channel: &ChannelState,
        state: ProgressState,
        last_file: Option<String>,
    ) -> Self {
        Self {
            channel_id: channel.id.clone(),
            channel_name: channel.name.clone(),
            counts: channel.counts(),
            last_file,
            state,
            containers: channel.containers.clone(),
            updated_at: now_unix(),
        }
    }
}

pub fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

pub fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| now_unix().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(id: &str) -> FileDescriptor {
        FileDescriptor {
            id: id.into(),
            name: format!("{id}.jpg"),
            path: PathBuf::from(format!("/tmp/{id}.jpg")),
            size: 1,
            mime_type: "image/jpeg".into(),
            media_type: MediaType::Image,
            timestamp: 0,
        }
    }

    #[test]
    fn channel_rejects_duplicate_ids() {
        let err = ChannelState::from_descriptors(
            "c1",
            "Family",
            vec![descriptor("a"), descriptor("b"), descriptor("a")],
        )
        .unwrap_err();
        assert!(matches!(err, ModelError::DuplicateFileId { ref id, .. } if id == "a"));
    }

    #[test]
    fn eligibility_respects_skip_failed() {
        let mut file = TrackedFile::new(descriptor("a"));
        assert!(file.is_eligible(true));
        file.mark_failed("boom");
        assert!(file.is_eligible(false));
        assert!(!file.is_eligible(true));
        file.mark_uploaded(Some("link".into()));
        assert!(!file.is_eligible(false));
        assert_eq!(file.upload_error, None);
    }

    #[test]
    fn status_parse_accepts_blank_as_pending() {
        assert_eq!(UploadStatus::parse("").unwrap(), UploadStatus::Pending);
        assert_eq!(
            UploadStatus::parse(" Uploaded ").unwrap(),
            UploadStatus::Uploaded
        );
        assert!(UploadStatus::parse("done").is_err());
    }

    #[test]
    fn media_type_falls_back_to_other() {
        let parsed: MediaType = serde_json::from_str("\"gif\"").unwrap();
        assert_eq!(parsed, MediaType::Other);
        let parsed: MediaType = serde_json::from_str("\"video\"").unwrap();
        assert_eq!(parsed, MediaType::Video);
    }

    #[test]
    fn snapshot_rows_include_carried_rows() {
        let mut channel =
            ChannelState::from_descriptors("c1", "Family", vec![descriptor("a")]).unwrap();
        let mut gone = TrackedFile::new(descriptor("gone")).to_row();
        gone.deleted_from_source = true;
        channel.carried.push(gone);
        let ids: Vec<_> = channel
            .snapshot_rows()
            .into_iter()
            .map(|row| row.file_id)
            .collect();
        assert_eq!(ids, vec!["a".to_string(), "gone".to_string()]);
    }
}
