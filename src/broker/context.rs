//! State shared by the node and every topic and channel it owns.
//!
//! Replaces process-wide globals: settings, node health, the metadata event
//! stream and the backend store are all reached through one `Arc<Context>`
//! handed down at construction time.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::warn;

use crate::config::Settings;
use crate::persistence::{BackendError, BackendQueue, EphemeralQueue, SledQueue};

/// Emitted whenever a topic or channel is created or deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetadataEvent {
    /// False for ephemeral topics/channels, which are never recorded.
    pub persist: bool,
    /// The node was restoring metadata when the change happened.
    pub loading: bool,
}

/// Last backend write outcome. Degraded health is observable, not fatal.
#[derive(Debug, Default)]
pub struct Health {
    err: RwLock<Option<String>>,
}

impl Health {
    pub fn set(&self, err: Option<String>) {
        *self.err.write() = err;
    }

    pub fn error(&self) -> Option<String> {
        self.err.read().clone()
    }

    pub fn is_healthy(&self) -> bool {
        self.err.read().is_none()
    }

    /// "OK", or "NOK - <last error>".
    pub fn status(&self) -> String {
        match self.error() {
            Some(err) => format!("NOK - {err}"),
            None => "OK".to_string(),
        }
    }
}

pub struct Context {
    settings: Settings,
    health: Health,
    loading: AtomicBool,
    events: mpsc::UnboundedSender<MetadataEvent>,
    store: sled::Db,
}

impl Context {
    pub fn new(
        settings: Settings,
        store: sled::Db,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<MetadataEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let ctx = Arc::new(Self {
            settings,
            health: Health::default(),
            loading: AtomicBool::new(false),
            events,
            store,
        });
        (ctx, rx)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn health(&self) -> &Health {
        &self.health
    }

    pub fn store(&self) -> &sled::Db {
        &self.store
    }

    pub fn is_loading(&self) -> bool {
        self.loading.load(Ordering::Acquire)
    }

    pub(crate) fn set_loading(&self, loading: bool) {
        self.loading.store(loading, Ordering::Release);
    }

    /// Record the outcome of a backend spill. A failed write degrades health
    /// until the next successful one; the node keeps serving either way.
    pub(crate) fn record_backend_write(&self, result: &Result<(), BackendError>) {
        self.health.set(result.as_ref().err().map(|e| e.to_string()));
    }

    /// Announce a topic/channel creation or deletion.
    pub(crate) fn notify(&self, persist: bool) {
        let event = MetadataEvent {
            persist,
            loading: self.is_loading(),
        };
        // nobody listening means the node is gone; nothing to persist
        let _ = self.events.send(event);
    }

    pub(crate) fn open_backend(
        &self,
        name: &str,
        ephemeral: bool,
    ) -> Result<Box<dyn BackendQueue>, BackendError> {
        if ephemeral {
            return Ok(Box::new(EphemeralQueue::new(
                name,
                self.settings.queue.ephemeral_queue_size,
            )));
        }
        match SledQueue::open(&self.store, name) {
            Ok(queue) => Ok(Box::new(queue)),
            Err(e) => {
                warn!(backend = %name, error = %e, "failed to open backend");
                Err(e)
            }
        }
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("store", &"sled::Db")
            .field("health", &self.health.status())
            .finish()
    }
}
