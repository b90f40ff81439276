//! A channel is one subscriber group of a topic.
//!
//! Every message the topic accepts is copied into each of its channels.
//! Inside a channel a message moves between four places: the memory buffer
//! or backend (ready), the in-flight set (delivered, awaiting an ack), and
//! the deferred set (scheduled for later). The in-flight and deferred sets
//! are each a map for lookup by ID plus a priority queue keyed by deadline,
//! guarded by their own lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::context::Context;
use super::memory_queue::{MemoryQueue, Received, next_from};
use super::message::{Message, MessageId, duration_nanos, now_nanos};
use super::names;
use super::pqueue::PriorityQueue;
use super::quantile::{LatencySketch, QuantileResult};
use super::stats::ChannelStats;
use super::topic::Topic;
use crate::client::{ClientId, Consumer};
use crate::persistence::{BackendQueue, backend_name};
use crate::utils::{BrokerError, TrackedSet};

/// Messages tracked by ID and ordered by deadline.
#[derive(Debug)]
struct Tracked {
    set: TrackedSet,
    messages: HashMap<MessageId, Arc<Message>>,
    queue: PriorityQueue<Arc<Message>>,
}

impl Tracked {
    fn new(set: TrackedSet, capacity: usize) -> Self {
        Self {
            set,
            messages: HashMap::new(),
            queue: PriorityQueue::with_capacity(capacity),
        }
    }

    fn insert(&mut self, msg: Arc<Message>, deadline: i64) -> Result<(), BrokerError> {
        if self.messages.contains_key(&msg.id) {
            return Err(BrokerError::AlreadyTracked {
                id: msg.id,
                set: self.set,
            });
        }
        msg.set_priority(deadline);
        self.messages.insert(msg.id, msg.clone());
        self.queue.push(msg);
        Ok(())
    }

    /// Look up an in-flight message on behalf of `client_id`.
    fn owned(&self, client_id: ClientId, id: MessageId) -> Result<&Arc<Message>, BrokerError> {
        let msg = self.messages.get(&id).ok_or(BrokerError::NotTracked { id, set: self.set })?;
        if msg.client_id() != client_id {
            return Err(BrokerError::NotOwned { id, client_id });
        }
        Ok(msg)
    }

    fn take_owned(
        &mut self,
        client_id: ClientId,
        id: MessageId,
    ) -> Result<Arc<Message>, BrokerError> {
        self.owned(client_id, id)?;
        let msg = self
            .messages
            .remove(&id)
            .ok_or(BrokerError::NotTracked { id, set: self.set })?;
        self.unqueue(&msg);
        Ok(msg)
    }

    fn unqueue(&mut self, msg: &Arc<Message>) {
        let index = msg.index();
        if index >= 0 && (index as usize) < self.queue.len() {
            self.queue.remove(index as usize);
        }
    }

    /// Pop the earliest entry if its deadline is `<= now`.
    fn expire(&mut self, now: i64) -> Option<Arc<Message>> {
        let msg = self.queue.peek_and_shift(now)?;
        self.messages.remove(&msg.id);
        Some(msg)
    }

    fn drain(&mut self) -> Vec<Arc<Message>> {
        self.messages.clear();
        self.queue.drain()
    }

    fn len(&self) -> usize {
        self.messages.len()
    }
}

pub struct Channel {
    topic_name: String,
    name: String,
    ctx: Arc<Context>,
    owner: Weak<Topic>,

    memory: MemoryQueue,
    backend: Box<dyn BackendQueue>,

    in_flight: Mutex<Tracked>,
    deferred: Mutex<Tracked>,
    clients: RwLock<HashMap<ClientId, Arc<dyn Consumer>>>,

    // puts hold it shared, exit holds it exclusively while flipping the flag
    exit_lock: RwLock<()>,
    exit_flag: AtomicBool,
    exit: CancellationToken,
    paused: AtomicBool,
    ephemeral: bool,
    delete_requested: AtomicBool,

    message_count: AtomicU64,
    requeue_count: AtomicU64,
    timeout_count: AtomicU64,

    e2e_latency: Option<LatencySketch>,
}

impl Channel {
    pub(crate) fn new(
        topic_name: &str,
        name: &str,
        ctx: Arc<Context>,
        owner: Weak<Topic>,
    ) -> Result<Arc<Self>, BrokerError> {
        let ephemeral = names::is_ephemeral(name);
        let backend = ctx.open_backend(&backend_name(topic_name, name), ephemeral)?;

        let mem_queue_size = ctx.settings().queue.mem_queue_size;
        let pq_size = (mem_queue_size / 10).max(1);
        let latency = &ctx.settings().latency;
        let e2e_latency = latency
            .enabled()
            .then(|| LatencySketch::new(latency.window_time(), latency.percentiles.clone()));

        let channel = Arc::new(Self {
            topic_name: topic_name.to_string(),
            name: name.to_string(),
            memory: MemoryQueue::new(mem_queue_size),
            backend,
            in_flight: Mutex::new(Tracked::new(TrackedSet::InFlight, pq_size)),
            deferred: Mutex::new(Tracked::new(TrackedSet::Deferred, pq_size)),
            clients: RwLock::new(HashMap::new()),
            exit_lock: RwLock::new(()),
            exit_flag: AtomicBool::new(false),
            exit: CancellationToken::new(),
            paused: AtomicBool::new(false),
            ephemeral,
            delete_requested: AtomicBool::new(false),
            message_count: AtomicU64::new(0),
            requeue_count: AtomicU64::new(0),
            timeout_count: AtomicU64::new(0),
            e2e_latency,
            ctx,
            owner,
        });

        channel.ctx.notify(!ephemeral);
        Ok(channel)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn topic_name(&self) -> &str {
        &self.topic_name
    }

    pub fn is_ephemeral(&self) -> bool {
        self.ephemeral
    }

    pub fn exiting(&self) -> bool {
        self.exit_flag.load(Ordering::Acquire)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Ready messages: memory buffer plus backend.
    pub fn depth(&self) -> i64 {
        self.memory.len() as i64 + self.backend.depth()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }

    pub fn deferred_count(&self) -> usize {
        self.deferred.lock().len()
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().len()
    }

    pub fn message_count(&self) -> u64 {
        self.message_count.load(Ordering::Relaxed)
    }

    pub fn requeue_count(&self) -> u64 {
        self.requeue_count.load(Ordering::Relaxed)
    }

    pub fn timeout_count(&self) -> u64 {
        self.timeout_count.load(Ordering::Relaxed)
    }

    pub(crate) fn e2e_latency(&self) -> Option<&LatencySketch> {
        self.e2e_latency.as_ref()
    }

    pub fn put_message(&self, msg: Arc<Message>) -> Result<(), BrokerError> {
        let _guard = self.exit_lock.read();
        if self.exiting() {
            return Err(BrokerError::Exiting);
        }
        self.put(msg)?;
        self.message_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Accept a message that must not be visible before `delay` elapses.
    pub fn put_message_deferred(
        &self,
        msg: Arc<Message>,
        delay: Duration,
    ) -> Result<(), BrokerError> {
        self.message_count.fetch_add(1, Ordering::Relaxed);
        self.start_deferred_timeout(msg, delay)
    }

    fn put(&self, msg: Arc<Message>) -> Result<(), BrokerError> {
        let Err(msg) = self.memory.try_push(msg) else {
            return Ok(());
        };
        let result = self.backend.put(&msg.encode());
        self.ctx.record_backend_write(&result);
        if let Err(e) = result {
            error!(
                topic = %self.topic_name,
                channel = %self.name,
                error = %e,
                "failed to write message to backend"
            );
            return Err(BrokerError::BackendWriteFailed(e));
        }
        Ok(())
    }

    /// Record that `client_id` now holds `msg` and must ack it within
    /// `timeout`.
    pub fn start_in_flight_timeout(
        &self,
        msg: Arc<Message>,
        client_id: ClientId,
        timeout: Duration,
    ) -> Result<(), BrokerError> {
        let now = now_nanos();
        let mut in_flight = self.in_flight.lock();
        if in_flight.messages.contains_key(&msg.id) {
            return Err(BrokerError::AlreadyTracked {
                id: msg.id,
                set: TrackedSet::InFlight,
            });
        }
        msg.set_client_id(client_id);
        msg.set_delivery_ts(now);
        in_flight.insert(msg, now.saturating_add(duration_nanos(timeout)))
    }

    fn start_deferred_timeout(&self, msg: Arc<Message>, delay: Duration) -> Result<(), BrokerError> {
        let deadline = now_nanos().saturating_add(duration_nanos(delay));
        self.deferred.lock().insert(msg, deadline)
    }

    /// Acknowledge successful processing.
    pub fn finish_message(&self, client_id: ClientId, id: MessageId) -> Result<(), BrokerError> {
        let msg = self.in_flight.lock().take_owned(client_id, id)?;
        if let Some(e2e) = &self.e2e_latency {
            e2e.insert(msg.timestamp);
        }
        Ok(())
    }

    /// Push the deadline out to now + `extension`, never past the first
    /// delivery plus the configured maximum.
    pub fn touch_message(
        &self,
        client_id: ClientId,
        id: MessageId,
        extension: Duration,
    ) -> Result<(), BrokerError> {
        let max_timeout = duration_nanos(self.ctx.settings().queue.max_msg_timeout());

        let mut in_flight = self.in_flight.lock();
        let msg = in_flight.owned(client_id, id)?.clone();
        in_flight.unqueue(&msg);

        let limit = msg.delivery_ts().saturating_add(max_timeout);
        let deadline = now_nanos().saturating_add(duration_nanos(extension)).min(limit);
        msg.set_priority(deadline);
        in_flight.queue.push(msg);
        Ok(())
    }

    /// Hand an in-flight message back. A zero `timeout` makes it ready
    /// immediately; anything else defers it.
    pub fn requeue_message(
        &self,
        client_id: ClientId,
        id: MessageId,
        timeout: Duration,
    ) -> Result<(), BrokerError> {
        let msg = self.in_flight.lock().take_owned(client_id, id)?;
        self.requeue_count.fetch_add(1, Ordering::Relaxed);

        if timeout.is_zero() {
            let _guard = self.exit_lock.read();
            if self.exiting() {
                return Err(BrokerError::Exiting);
            }
            return self.put(msg);
        }

        self.start_deferred_timeout(msg, timeout)
    }

    pub fn add_client(
        &self,
        client_id: ClientId,
        consumer: Arc<dyn Consumer>,
    ) -> Result<(), BrokerError> {
        let _guard = self.exit_lock.read();
        if self.exiting() {
            return Err(BrokerError::Exiting);
        }

        let mut clients = self.clients.write();
        if clients.contains_key(&client_id) {
            return Ok(());
        }
        let limit = self.ctx.settings().queue.max_channel_consumers;
        if limit > 0 && clients.len() >= limit {
            return Err(BrokerError::ConsumerLimitExceeded {
                topic: self.topic_name.clone(),
                channel: self.name.clone(),
                limit,
            });
        }
        clients.insert(client_id, consumer);
        Ok(())
    }

    /// Unregister a consumer. Ignored once the channel is exiting.
    pub fn remove_client(&self, client_id: ClientId) {
        let _guard = self.exit_lock.read();
        if self.exiting() {
            return;
        }

        let remaining = {
            let mut clients = self.clients.write();
            if clients.remove(&client_id).is_none() {
                return;
            }
            clients.len()
        };

        if remaining == 0 && self.ephemeral {
            self.request_delete();
        }
    }

    /// Ask the owning topic to delete this channel. Fires at most once.
    fn request_delete(&self) {
        if self
            .delete_requested
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let Some(topic) = self.owner.upgrade() else {
            return;
        };
        let name = self.name.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = topic.delete_existing_channel(&name).await {
                        warn!(topic = %topic.name(), channel = %name, error = %e, "failed to delete ephemeral channel");
                    }
                });
            }
            Err(_) => {
                warn!(topic = %self.topic_name, channel = %self.name, "no runtime to delete ephemeral channel");
            }
        }
    }

    pub fn pause(&self) {
        self.set_paused(true);
    }

    pub fn unpause(&self) {
        self.set_paused(false);
    }

    fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Release);

        let clients: Vec<Arc<dyn Consumer>> = self.clients.read().values().cloned().collect();
        for client in clients {
            if paused {
                client.pause();
            } else {
                client.unpause();
            }
        }
    }

    /// Wait for the next ready message, from memory or the backend.
    ///
    /// Returns `None` once the channel is exiting.
    pub async fn next_message(&self) -> Option<Arc<Message>> {
        loop {
            let received = tokio::select! {
                biased;
                _ = self.exit.cancelled() => return None,
                received = next_from(&self.memory, &*self.backend) => received,
            };

            match received {
                Received::Memory(msg) => return Some(msg),
                Received::Backend(Some(data)) => match Message::decode(&data) {
                    Ok(msg) => return Some(Arc::new(msg)),
                    Err(e) => {
                        error!(topic = %self.topic_name, channel = %self.name, error = %e, "failed to decode message");
                    }
                },
                Received::Backend(None) => return None,
            }
        }
    }

    /// Discard everything queued, in flight and deferred.
    pub fn empty(&self) -> Result<(), BrokerError> {
        self.in_flight.lock().drain();
        self.deferred.lock().drain();

        let clients: Vec<Arc<dyn Consumer>> = self.clients.read().values().cloned().collect();
        for client in clients {
            client.empty();
        }

        self.memory.drain();
        self.backend.empty()?;
        Ok(())
    }

    /// Disconnect every consumer and discard all state and storage.
    pub fn delete(&self) -> Result<(), BrokerError> {
        self.exit(true)
    }

    /// Disconnect every consumer and persist all pending state to the backend.
    pub fn close(&self) -> Result<(), BrokerError> {
        self.exit(false)
    }

    fn exit(&self, deleted: bool) -> Result<(), BrokerError> {
        {
            let _guard = self.exit_lock.write();
            if self.exit_flag.swap(true, Ordering::AcqRel) {
                return Err(BrokerError::Exiting);
            }
        }
        self.exit.cancel();

        if deleted {
            info!(topic = %self.topic_name, channel = %self.name, "deleting channel");
            self.ctx.notify(!self.ephemeral);
        } else {
            info!(topic = %self.topic_name, channel = %self.name, "closing channel");
        }

        let clients: Vec<Arc<dyn Consumer>> = self.clients.read().values().cloned().collect();
        for client in clients {
            if let Err(e) = client.close() {
                warn!(topic = %self.topic_name, channel = %self.name, error = %e, "failed to close client");
            }
        }

        if deleted {
            self.empty()?;
            self.backend.delete()?;
            return Ok(());
        }

        self.flush();
        self.backend.close()?;
        Ok(())
    }

    /// Write memory, in-flight and deferred messages to the backend.
    fn flush(&self) {
        let memory = self.memory.drain();
        let in_flight = self.in_flight.lock().drain();
        let deferred = self.deferred.lock().drain();

        if !memory.is_empty() || !in_flight.is_empty() || !deferred.is_empty() {
            info!(
                topic = %self.topic_name,
                channel = %self.name,
                memory = memory.len(),
                in_flight = in_flight.len(),
                deferred = deferred.len(),
                "flushing messages to backend"
            );
        }

        for msg in memory.iter().chain(&in_flight).chain(&deferred) {
            if let Err(e) = self.backend.put(&msg.encode()) {
                error!(topic = %self.topic_name, channel = %self.name, error = %e, "failed to flush message");
            }
        }
    }

    /// Requeue every in-flight message whose deadline is `<= now`.
    /// Returns whether anything expired.
    pub fn process_in_flight_queue(&self, now: i64) -> bool {
        let _guard = self.exit_lock.read();
        if self.exiting() {
            return false;
        }

        let mut dirty = false;
        while let Some(msg) = self.expire(&self.in_flight, now) {
            dirty = true;

            let client = self.clients.read().get(&msg.client_id()).cloned();
            if let Some(client) = client {
                client.timed_out_message();
            }
            self.timeout_count.fetch_add(1, Ordering::Relaxed);
            debug!(topic = %self.topic_name, channel = %self.name, id = %msg.id, "message timed out");

            if let Err(e) = self.put(msg) {
                warn!(topic = %self.topic_name, channel = %self.name, error = %e, "failed to requeue timed out message");
            }
        }
        dirty
    }

    /// Make every deferred message whose deadline is `<= now` ready.
    /// Returns whether anything was due.
    pub fn process_deferred_queue(&self, now: i64) -> bool {
        let _guard = self.exit_lock.read();
        if self.exiting() {
            return false;
        }

        let mut dirty = false;
        while let Some(msg) = self.expire(&self.deferred, now) {
            dirty = true;
            if let Err(e) = self.put(msg) {
                warn!(topic = %self.topic_name, channel = %self.name, error = %e, "failed to requeue deferred message");
            }
        }
        dirty
    }

    // the lock is released before the caller touches clients or the backend
    fn expire(&self, set: &Mutex<Tracked>, now: i64) -> Option<Arc<Message>> {
        set.lock().expire(now)
    }

    pub fn e2e_processing_latency(&self) -> QuantileResult {
        self.e2e_latency
            .as_ref()
            .map(LatencySketch::result)
            .unwrap_or_default()
    }

    pub fn stats(&self) -> ChannelStats {
        let clients: Vec<Arc<dyn Consumer>> = self.clients.read().values().cloned().collect();
        let mut client_stats: Vec<_> = clients
            .iter()
            .map(|c| c.stats(&self.topic_name))
            .collect();
        client_stats.sort_by_key(|s| s.client_id);

        ChannelStats {
            channel_name: self.name.clone(),
            depth: self.depth(),
            backend_depth: self.backend.depth(),
            in_flight_count: self.in_flight_count(),
            deferred_count: self.deferred_count(),
            message_count: self.message_count(),
            requeue_count: self.requeue_count(),
            timeout_count: self.timeout_count(),
            client_count: client_stats.len(),
            clients: client_stats,
            paused: self.is_paused(),
            e2e_processing_latency: self.e2e_processing_latency(),
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("topic", &self.topic_name)
            .field("name", &self.name)
            .field("ephemeral", &self.ephemeral)
            .field("exiting", &self.exiting())
            .finish()
    }
}
