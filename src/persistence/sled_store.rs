//! Spill queue backed by `sled`
//!
//! Each queue is one tree inside the node's database. Keys are ids from
//! `Db::generate_id`, written big-endian, so iteration order is write order
//! and `pop_min` always yields the oldest record.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use sled::{Db, Tree};
use tokio::sync::Notify;
use tracing::{debug, error};

use super::{BackendError, BackendQueue};

const READ_RETRY_BACKOFF: Duration = Duration::from_millis(100);

pub struct SledQueue {
    name: String,
    db: Db,
    tree: Tree,
    depth: AtomicI64,
    closed: AtomicBool,
    notify: Notify,
}

impl SledQueue {
    /// Open (or create) the tree called `name`. Records left over from a
    /// previous run are counted and will be read first.
    pub fn open(db: &Db, name: &str) -> Result<Self, BackendError> {
        let tree = db.open_tree(name)?;
        let depth = tree.len() as i64;
        if depth > 0 {
            debug!(backend = %name, depth, "recovered pending records");
        }
        Ok(Self {
            name: name.to_string(),
            db: db.clone(),
            tree,
            depth: AtomicI64::new(depth),
            closed: AtomicBool::new(false),
            notify: Notify::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn shut(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }
}

#[async_trait]
impl BackendQueue for SledQueue {
    fn put(&self, data: &[u8]) -> Result<(), BackendError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BackendError::Closed(self.name.clone()));
        }
        let key = self.db.generate_id()?;
        self.tree.insert(key.to_be_bytes(), data)?;
        self.depth.fetch_add(1, Ordering::AcqRel);
        self.notify.notify_one();
        Ok(())
    }

    async fn read(&self) -> Option<Vec<u8>> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.closed.load(Ordering::Acquire) {
                return None;
            }

            match self.tree.pop_min() {
                Ok(Some((_, value))) => {
                    if self.depth.fetch_sub(1, Ordering::AcqRel) > 1 {
                        // more records behind this one, wake the next reader
                        self.notify.notify_one();
                    }
                    return Some(value.to_vec());
                }
                Ok(None) => {}
                Err(e) => {
                    error!(backend = %self.name, error = %e, "failed to read from backend");
                    tokio::time::sleep(READ_RETRY_BACKOFF).await;
                    continue;
                }
            }

            notified.await;
        }
    }

    fn depth(&self) -> i64 {
        self.depth.load(Ordering::Acquire)
    }

    fn empty(&self) -> Result<(), BackendError> {
        self.tree.clear()?;
        self.depth.store(0, Ordering::Release);
        Ok(())
    }

    fn delete(&self) -> Result<(), BackendError> {
        self.shut();
        self.tree.clear()?;
        self.depth.store(0, Ordering::Release);
        self.db.drop_tree(self.name.as_bytes())?;
        Ok(())
    }

    fn close(&self) -> Result<(), BackendError> {
        self.shut();
        self.tree.flush()?;
        Ok(())
    }
}

impl std::fmt::Debug for SledQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledQueue")
            .field("name", &self.name)
            .field("depth", &self.depth())
            .finish()
    }
}
