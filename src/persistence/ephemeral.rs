//! In-memory stand-in for ephemeral topics and channels.
//!
//! Nothing here survives a restart. When full, the oldest record is dropped
//! to make room for the new one.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

use super::{BackendError, BackendQueue};

#[derive(Debug)]
pub struct EphemeralQueue {
    name: String,
    capacity: usize,
    items: Mutex<VecDeque<Vec<u8>>>,
    closed: AtomicBool,
    notify: Notify,
}

impl EphemeralQueue {
    pub fn new(name: &str, capacity: usize) -> Self {
        Self {
            name: name.to_string(),
            capacity,
            items: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    fn shut(&self) {
        self.closed.store(true, Ordering::Release);
        self.items.lock().clear();
        self.notify.notify_waiters();
    }
}

#[async_trait]
impl BackendQueue for EphemeralQueue {
    fn put(&self, data: &[u8]) -> Result<(), BackendError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BackendError::Closed(self.name.clone()));
        }
        if self.capacity == 0 {
            debug!(backend = %self.name, "no ephemeral capacity, dropping record");
            return Ok(());
        }
        {
            let mut items = self.items.lock();
            if items.len() >= self.capacity {
                items.pop_front();
                debug!(backend = %self.name, "ephemeral queue full, dropped oldest record");
            }
            items.push_back(data.to_vec());
        }
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

            let (item, more) = {
                let mut items = self.items.lock();
                let item = items.pop_front();
                (item, !items.is_empty())
            };
            if let Some(item) = item {
                if more {
                    self.notify.notify_one();
                }
                return Some(item);
            }

            notified.await;
        }
    }

    fn depth(&self) -> i64 {
        self.items.lock().len() as i64
    }

    fn empty(&self) -> Result<(), BackendError> {
        self.items.lock().clear();
        Ok(())
    }

    fn delete(&self) -> Result<(), BackendError> {
        self.shut();
        Ok(())
    }

    fn close(&self) -> Result<(), BackendError> {
        self.shut();
        Ok(())
    }
}
