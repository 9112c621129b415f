use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::model::{ChannelState, FileDescriptor, ModelError};

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read manifest {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid manifest: {0}")]
    Parse(#[from] serde_json::Error),
    #[error(transparent)]
    Model(#[from] ModelError),
}

#[derive(Debug, Clone, Deserialize)]
pub struct ManifestChannel {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub files: Vec<FileDescriptor>,
}

/// File list produced by the scanner, one entry per chat.
#[derive(Debug, Clone, Deserialize)]
pub struct Manifest {
    pub channels: Vec<ManifestChannel>,
}

impl Manifest {
    pub fn from_json(raw: &str) -> Result<Self, ManifestError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Reads the manifest; relative file paths resolve against its directory.
    pub async fn load(path: &Path) -> Result<Self, ManifestError> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ManifestError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        let mut manifest = Self::from_json(&raw)?;
        if let Some(base) = path.parent() {
            manifest.resolve_paths(base);
        }
        Ok(manifest)
    }

    pub fn resolve_paths(&mut self, base: &Path) {
        for file in self.channels.iter_mut().flat_map(|c| c.files.iter_mut()) {
            if file.path.is_relative() {
                file.path = base.join(&file.path);
            }
        }
    }

    pub fn into_channels(self) -> Result<Vec<ChannelState>, ManifestError> {
        self.channels
            .into_iter()
            .map(|channel| {
                ChannelState::from_descriptors(channel.id, channel.name, channel.files)
                    .map_err(ManifestError::from)
            })
            .collect()
    }
}
