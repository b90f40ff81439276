//! Topic/channel metadata snapshot
//!
//! The node records which non-ephemeral topics and channels exist, and
//! whether they are paused, so they can be rebuilt before any pump starts on
//! the next run. The file is JSON and is always replaced atomically: written
//! to a uniquely named temp file, fsynced, then renamed over the old one.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::utils::BrokerError;

pub const METADATA_FILE: &str = "popsubd.dat";

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Metadata {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub topics: Vec<TopicMetadata>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TopicMetadata {
    pub name: String,
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub channels: Vec<ChannelMetadata>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ChannelMetadata {
    pub name: String,
    #[serde(default)]
    pub paused: bool,
}

pub fn metadata_file(data_path: &Path) -> PathBuf {
    data_path.join(METADATA_FILE)
}

/// Read the snapshot at `path`. A missing or empty file is a fresh start.
pub fn read_metadata(path: &Path) -> Result<Option<Metadata>, BrokerError> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(BrokerError::Metadata(format!(
                "failed to read metadata from {} - {e}",
                path.display()
            )));
        }
    };
    if data.is_empty() {
        return Ok(None);
    }

    serde_json::from_slice(&data).map(Some).map_err(|e| {
        BrokerError::Metadata(format!(
            "failed to parse metadata in {} - {e}",
            path.display()
        ))
    })
}

/// Atomically replace the snapshot at `path`.
pub fn write_metadata(path: &Path, metadata: &Metadata) -> Result<(), BrokerError> {
    let data = serde_json::to_vec(metadata)
        .map_err(|e| BrokerError::Metadata(format!("failed to serialize metadata - {e}")))?;

    let tmp = PathBuf::from(format!("{}.{}.tmp", path.display(), Uuid::new_v4()));
    if let Err(e) = write_sync_file(&tmp, &data) {
        let _ = fs::remove_file(&tmp);
        return Err(BrokerError::Metadata(format!(
            "failed to write {} - {e}",
            tmp.display()
        )));
    }

    fs::rename(&tmp, path).map_err(|e| {
        BrokerError::Metadata(format!(
            "failed to rename {} to {} - {e}",
            tmp.display(),
            path.display()
        ))
    })
}

fn write_sync_file(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut f = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    f.write_all(data)?;
    f.sync_all()
}
