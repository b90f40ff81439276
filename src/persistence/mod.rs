//! The `persistence` module provides the storage that sits behind topics and
//! channels.
//!
//! - [`BackendQueue`] is the spill queue contract. When a topic's or channel's
//!   bounded memory buffer is full, messages are written here instead and read
//!   back by the same consumers later.
//! - [`SledQueue`] implements it on top of `sled`, one tree per topic or
//!   topic/channel pair in a node-wide database.
//! - [`EphemeralQueue`] is the non-persistent, bounded, drop-oldest stand-in
//!   used by `#ephemeral` topics and channels.
//! - [`metadata`] reads and atomically rewrites the snapshot of which topics
//!   and channels exist (and whether they are paused) across restarts.

pub mod ephemeral;
pub mod metadata;
pub mod sled_store;

use async_trait::async_trait;
use thiserror::Error;

pub use ephemeral::EphemeralQueue;
pub use sled_store::SledQueue;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store error: {0}")]
    Store(#[from] sled::Error),

    #[error("backend '{0}' is closed")]
    Closed(String),
}

/// Secondary message storage for a topic or channel.
///
/// Implementations are ordered per writer. Nothing above this trait inspects
/// how records are stored.
#[async_trait]
pub trait BackendQueue: Send + Sync {
    /// Append one encoded record.
    fn put(&self, data: &[u8]) -> Result<(), BackendError>;

    /// Wait for the next record.
    ///
    /// Behaves like an unbuffered handoff: a record leaves the queue only when
    /// this future resolves, so dropping it inside a `select!` loses nothing.
    /// Returns `None` once the queue has been closed or deleted.
    async fn read(&self) -> Option<Vec<u8>>;

    /// Number of pending records.
    fn depth(&self) -> i64;

    /// Discard all pending records.
    fn empty(&self) -> Result<(), BackendError>;

    /// Discard all pending records and release the storage.
    fn delete(&self) -> Result<(), BackendError>;

    /// Flush and release without discarding anything.
    fn close(&self) -> Result<(), BackendError>;
}

/// Backend names include the topic so channel names only need to be unique
/// within their topic.
pub fn backend_name(topic: &str, channel: &str) -> String {
    format!("{topic}:{channel}")
}
