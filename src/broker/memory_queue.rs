//! Bounded in-memory message buffer.
//!
//! The first stop for every put on a topic or channel. Inserts never block:
//! when the buffer is full the caller gets the message back and spills it to
//! the backend instead.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use super::message::Message;
use crate::persistence::BackendQueue;

#[derive(Debug)]
pub struct MemoryQueue {
    capacity: usize,
    items: Mutex<VecDeque<Arc<Message>>>,
    notify: Notify,
}

impl MemoryQueue {
    /// A capacity of 0 means every message goes straight to the backend.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            items: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            notify: Notify::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    pub fn try_push(&self, msg: Arc<Message>) -> Result<(), Arc<Message>> {
        {
            let mut items = self.items.lock();
            if items.len() >= self.capacity {
                return Err(msg);
            }
            items.push_back(msg);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Wait for the next message. Cancel-safe: a message is only taken out
    /// when this future resolves.
    pub async fn pop(&self) -> Arc<Message> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (msg, more) = {
                let mut items = self.items.lock();
                let msg = items.pop_front();
                (msg, !items.is_empty())
            };
            if let Some(msg) = msg {
                if more {
                    self.notify.notify_one();
                }
                return msg;
            }

            notified.await;
        }
    }

    pub fn drain(&self) -> Vec<Arc<Message>> {
        self.items.lock().drain(..).collect()
    }
}

/// Where the next message came from.
pub(crate) enum Received {
    Memory(Arc<Message>),
    /// Raw backend record, or `None` once the backend is closed.
    Backend(Option<Vec<u8>>),
}

/// Wait on both sources of a topic or channel. Neither is preferred, so
/// there is no ordering between buffered and spilled messages.
pub(crate) async fn next_from(memory: &MemoryQueue, backend: &dyn BackendQueue) -> Received {
    tokio::select! {
        msg = memory.pop() => Received::Memory(msg),
        data = backend.read() => Received::Backend(data),
    }
}
