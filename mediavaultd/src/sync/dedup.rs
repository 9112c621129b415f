use std::collections::HashMap;
use std::io;
use std::path::Path;

use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

use crate::model::{TrackedFile, UploadStatus};

const HASH_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DedupReport {
    pub hashed: usize,
    pub duplicates: usize,
    pub missing: usize,
    pub errors: usize,
}

/// Streams the file through SHA-256 and returns the lowercase hex digest.
pub async fn hash_file(path: &Path) -> io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_CHUNK_SIZE];
    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Keeps one copy per content hash and marks the other pending or failed
/// copies as skipped. Running it again on the same list changes nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct DuplicateDetector;

impl DuplicateDetector {
    pub fn new() -> Self {
        Self
    }

    pub async fn run(&self, files: &mut [TrackedFile]) -> DedupReport {
        let mut report = DedupReport::default();
        self.fill_hashes(files, &mut report).await;
        report.duplicates = mark_duplicates(files);
        if report.duplicates > 0 || report.errors > 0 {
            info!(
                hashed = report.hashed,
                duplicates = report.duplicates,
                missing = report.missing,
                errors = report.errors,
                "duplicate scan finished"
            );
        }
        report
    }

    async fn fill_hashes(&self, files: &mut [TrackedFile], report: &mut DedupReport) {
        for file in files.iter_mut() {
            let path = file.descriptor.path.clone();
            match tokio::fs::try_exists(&path).await {
                Ok(true) => file.deleted_from_source = false,
                Ok(false) => {
                    file.deleted_from_source = true;
                    report.missing += 1;
                    continue;
                }
                Err(err) => {
                    warn!(file = %file.name(), error = %err, "cannot check source file");
                    report.errors += 1;
                    continue;
                }
            }
            if file.content_hash.is_some() {
                continue;
            }
            match hash_file(&path).await {
                Ok(hash) => {
                    debug!(file = %file.name(), %hash, "hashed");
                    file.content_hash = Some(hash);
                    report.hashed += 1;
                }
                Err(err) => {
                    warn!(file = %file.name(), error = %err, "hashing failed, leaving file as is");
                    report.errors += 1;
                }
            }
        }
    }
}

/// Returns how many files changed to skipped.
fn mark_duplicates(files: &mut [TrackedFile]) -> usize {
    let mut groups: HashMap<String, Vec<usize>> = HashMap::new();
    let mut order = Vec::new();
    for (index, file) in files.iter().enumerate() {
        let Some(hash) = file.content_hash.clone() else {
            continue;
        };
        let group = groups.entry(hash.clone()).or_default();
        if group.is_empty() {
            order.push(hash);
        }
        group.push(index);
    }

    let mut changed = 0;
    for hash in order {
        let members = &groups[&hash];
        if members.len() < 2 {
            continue;
        }
        let keeper = pick_keeper(files, members);
        let keeper_name = files[keeper].name().to_string();
        for &index in members {
            // Uploaded copies keep their marker even when another copy is the keeper.
            if index == keeper
                || matches!(
                    files[index].status,
                    UploadStatus::Skipped | UploadStatus::Uploaded
                )
            {
                continue;
            }
            files[index].mark_skipped(format!("Duplicate of {keeper_name}"));
            changed += 1;
        }
    }
    changed
}

/// First uploaded copy, else the first copy still on disk and not skipped.
fn pick_keeper(files: &[TrackedFile], members: &[usize]) -> usize {
    let uploaded = members
        .iter()
        .copied()
        .find(|&index| files[index].status == UploadStatus::Uploaded);
    let present = || {
        members.iter().copied().find(|&index| {
            let file = &files[index];
            file.status != UploadStatus::Skipped && !file.deleted_from_source
        })
    };
    uploaded.or_else(present).unwrap_or(members[0])
}
