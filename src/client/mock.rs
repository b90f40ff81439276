//! Recording consumer used by broker tests.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use super::{ClientId, ClientStats, Consumer};

#[derive(Debug, Default)]
pub(crate) struct RecordingConsumer {
    pub id: ClientId,
    pub paused: AtomicBool,
    pub closed: AtomicBool,
    pub timeouts: AtomicU64,
    pub empties: AtomicU64,
}

impl RecordingConsumer {
    pub fn new(id: ClientId) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    pub fn timeouts(&self) -> u64 {
        self.timeouts.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Consumer for RecordingConsumer {
    fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    fn unpause(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    fn close(&self) -> std::io::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn timed_out_message(&self) {
        self.timeouts.fetch_add(1, Ordering::SeqCst);
    }

    fn stats(&self, _topic: &str) -> ClientStats {
        ClientStats {
            client_id: self.id,
            remote_address: "127.0.0.1:0".to_string(),
            paused: self.is_paused(),
            ..Default::default()
        }
    }

    fn empty(&self) {
        self.empties.fetch_add(1, Ordering::SeqCst);
    }
}
