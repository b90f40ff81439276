//! A topic is a named publish point.
//!
//! Producers put messages into the topic's memory buffer (spilling to its
//! backend when full). A single pump task per topic takes each message and
//! hands one instance to every channel: the first channel gets the original,
//! the rest get copies, because each channel tracks delivery state on its own
//! instance.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::channel::Channel;
use super::context::Context;
use super::guid::GuidFactory;
use super::memory_queue::{MemoryQueue, Received, next_from};
use super::message::{Message, MessageId};
use super::names;
use super::node::Node;
use super::quantile::{LatencySketch, QuantileResult};
use super::stats::TopicStats;
use crate::persistence::BackendQueue;
use crate::utils::BrokerError;

/// Control messages for the pump.
#[derive(Debug)]
enum PumpSignal {
    Start,
    /// The channel set changed; the sender is acked once the pump has
    /// picked up the new set.
    ChannelsChanged(oneshot::Sender<()>),
    PauseChanged,
}

pub struct Topic {
    name: String,
    ctx: Arc<Context>,
    owner: Weak<Node>,

    channels: RwLock<HashMap<String, Arc<Channel>>>,
    memory: MemoryQueue,
    backend: Box<dyn BackendQueue>,
    guid: Mutex<GuidFactory>,

    signals: mpsc::UnboundedSender<PumpSignal>,
    pump: Mutex<Option<JoinHandle<()>>>,

    exit_lock: RwLock<()>,
    exit_flag: AtomicBool,
    exit: CancellationToken,
    started: AtomicBool,
    paused: AtomicBool,
    ephemeral: bool,
    delete_requested: AtomicBool,

    message_count: AtomicU64,
    message_bytes: AtomicU64,
}

impl Topic {
    /// Create the topic and spawn its pump. The pump stays idle until
    /// [`Topic::start`] is called.
    pub(crate) fn new(
        name: &str,
        ctx: Arc<Context>,
        owner: Weak<Node>,
    ) -> Result<Arc<Self>, BrokerError> {
        let ephemeral = names::is_ephemeral(name);
        let backend = ctx.open_backend(name, ephemeral)?;
        let mem_queue_size = ctx.settings().queue.mem_queue_size;
        let node_id = ctx.settings().node.node_id;
        let (signals, signal_rx) = mpsc::unbounded_channel();

        let topic = Arc::new(Self {
            name: name.to_string(),
            channels: RwLock::new(HashMap::new()),
            memory: MemoryQueue::new(mem_queue_size),
            backend,
            guid: Mutex::new(GuidFactory::new(node_id)),
            signals,
            pump: Mutex::new(None),
            exit_lock: RwLock::new(()),
            exit_flag: AtomicBool::new(false),
            exit: CancellationToken::new(),
            started: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            ephemeral,
            delete_requested: AtomicBool::new(false),
            message_count: AtomicU64::new(0),
            message_bytes: AtomicU64::new(0),
            ctx,
            owner,
        });

        let handle = tokio::spawn(Arc::clone(&topic).message_pump(signal_rx));
        *topic.pump.lock() = Some(handle);

        topic.ctx.notify(!ephemeral);
        Ok(topic)
    }

    pub fn name(&self) -> &str {
        &self.name
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

    pub fn depth(&self) -> i64 {
        self.memory.len() as i64 + self.backend.depth()
    }

    pub fn message_count(&self) -> u64 {
        self.message_count.load(Ordering::Relaxed)
    }

    pub fn message_bytes(&self) -> u64 {
        self.message_bytes.load(Ordering::Relaxed)
    }

    /// Let the pump begin delivering. Later calls are no-ops.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.signals.send(PumpSignal::Start);
    }

    /// Next message ID for this topic. Retries until the generator yields.
    pub fn generate_id(&self) -> MessageId {
        let mut failures: u64 = 0;
        loop {
            let result = self.guid.lock().new_guid();
            match result {
                Ok(id) => return id,
                Err(e) => {
                    failures += 1;
                    if failures % 10_000 == 0 {
                        error!(topic = %self.name, error = %e, failures, "failed to generate message id");
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }
            }
        }
    }

    pub fn put_message(&self, msg: Message) -> Result<(), BrokerError> {
        let _guard = self.exit_lock.read();
        if self.exiting() {
            return Err(BrokerError::Exiting);
        }
        self.check_size(&msg)?;

        let size = msg.body.len() as u64;
        self.put(Arc::new(msg))?;
        self.message_count.fetch_add(1, Ordering::Relaxed);
        self.message_bytes.fetch_add(size, Ordering::Relaxed);
        Ok(())
    }

    /// Put each message in order. Not atomic: on failure the messages before
    /// the failing one stay accepted and are counted.
    pub fn put_messages(&self, msgs: Vec<Message>) -> Result<(), BrokerError> {
        let _guard = self.exit_lock.read();
        if self.exiting() {
            return Err(BrokerError::Exiting);
        }

        let mut accepted: u64 = 0;
        let mut bytes: u64 = 0;
        let mut result = Ok(());
        for msg in msgs {
            let size = msg.body.len() as u64;
            if let Err(e) = self.check_size(&msg).and_then(|_| self.put(Arc::new(msg))) {
                result = Err(e);
                break;
            }
            accepted += 1;
            bytes += size;
        }

        self.message_count.fetch_add(accepted, Ordering::Relaxed);
        self.message_bytes.fetch_add(bytes, Ordering::Relaxed);
        result
    }

    fn check_size(&self, msg: &Message) -> Result<(), BrokerError> {
        let max = self.ctx.settings().queue.max_msg_size;
        if msg.body.len() > max {
            return Err(BrokerError::MessageTooLarge {
                size: msg.body.len(),
                max,
            });
        }
        Ok(())
    }

    fn put(&self, msg: Arc<Message>) -> Result<(), BrokerError> {
        let Err(msg) = self.memory.try_push(msg) else {
            return Ok(());
        };
        let result = self.backend.put(&msg.encode());
        self.ctx.record_backend_write(&result);
        if let Err(e) = result {
            error!(topic = %self.name, error = %e, "failed to write message to backend");
            return Err(BrokerError::BackendWriteFailed(e));
        }
        Ok(())
    }

    /// Get or create a channel. A new channel is subscribed to the pump
    /// before this returns.
    pub async fn get_channel(self: &Arc<Self>, name: &str) -> Result<Arc<Channel>, BrokerError> {
        if !names::is_valid_channel_name(name) {
            return Err(BrokerError::InvalidName {
                kind: "channel",
                name: name.to_string(),
            });
        }
        if self.exiting() {
            return Err(BrokerError::Exiting);
        }

        let channel = {
            let mut channels = self.channels.write();
            if let Some(channel) = channels.get(name) {
                return Ok(channel.clone());
            }
            let channel = Channel::new(&self.name, name, self.ctx.clone(), Arc::downgrade(self))?;
            channels.insert(name.to_string(), channel.clone());
            channel
        };
        info!(topic = %self.name, channel = %name, "channel created");

        self.refresh_pump().await;
        Ok(channel)
    }

    pub fn get_existing_channel(&self, name: &str) -> Result<Arc<Channel>, BrokerError> {
        self.channels
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| BrokerError::ChannelNotFound(name.to_string()))
    }

    pub fn channels(&self) -> Vec<Arc<Channel>> {
        self.channels.read().values().cloned().collect()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.read().len()
    }

    /// Delete a channel and drop it from the topic. An ephemeral topic left
    /// without channels then deletes itself.
    pub async fn delete_existing_channel(&self, name: &str) -> Result<(), BrokerError> {
        let channel = self.get_existing_channel(name)?;
        info!(topic = %self.name, channel = %name, "deleting channel");

        // delete before unlisting so no new consumer can attach in between
        if let Err(e) = channel.delete() {
            warn!(topic = %self.name, channel = %name, error = %e, "failed to delete channel");
        }

        let remaining = {
            let mut channels = self.channels.write();
            channels.remove(name);
            channels.len()
        };

        self.refresh_pump().await;

        if remaining == 0 && self.ephemeral {
            self.request_delete();
        }
        Ok(())
    }

    fn request_delete(&self) {
        if self
            .delete_requested
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let Some(node) = self.owner.upgrade() else {
            return;
        };
        let name = self.name.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = node.delete_existing_topic(&name).await {
                        warn!(topic = %name, error = %e, "failed to delete ephemeral topic");
                    }
                });
            }
            Err(_) => warn!(topic = %self.name, "no runtime to delete ephemeral topic"),
        }
    }

    async fn refresh_pump(&self) {
        let (ack, acked) = oneshot::channel();
        if self.signals.send(PumpSignal::ChannelsChanged(ack)).is_err() {
            return;
        }
        // a dropped ack means the pump is gone
        let _ = acked.await;
    }

    /// Stop the pump from taking new messages. Channel state is untouched.
    pub fn pause(&self) {
        self.set_paused(true);
    }

    pub fn unpause(&self) {
        self.set_paused(false);
    }

    fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Release);
        let _ = self.signals.send(PumpSignal::PauseChanged);
    }

    async fn message_pump(self: Arc<Self>, mut signals: mpsc::UnboundedReceiver<PumpSignal>) {
        // nothing is delivered before start, so a topic restored from
        // metadata gets all of its channels first
        loop {
            tokio::select! {
                biased;
                _ = self.exit.cancelled() => return,
                signal = signals.recv() => match signal {
                    Some(PumpSignal::Start) => break,
                    Some(PumpSignal::ChannelsChanged(ack)) => {
                        let _ = ack.send(());
                    }
                    Some(PumpSignal::PauseChanged) => {}
                    None => return,
                },
            }
        }

        let mut channels = self.channels();
        let mut active = !channels.is_empty() && !self.is_paused();
        debug!(topic = %self.name, channels = channels.len(), "pump started");

        loop {
            let received = tokio::select! {
                biased;
                _ = self.exit.cancelled() => break,
                signal = signals.recv() => {
                    match signal {
                        Some(PumpSignal::ChannelsChanged(ack)) => {
                            channels = self.channels();
                            let _ = ack.send(());
                        }
                        Some(PumpSignal::Start | PumpSignal::PauseChanged) => {}
                        None => break,
                    }
                    active = !channels.is_empty() && !self.is_paused();
                    continue;
                }
                received = next_from(&self.memory, &*self.backend), if active => received,
            };

            let msg = match received {
                Received::Memory(msg) => msg,
                Received::Backend(Some(data)) => match Message::decode(&data) {
                    Ok(msg) => Arc::new(msg),
                    Err(e) => {
                        error!(topic = %self.name, error = %e, "failed to decode message");
                        continue;
                    }
                },
                Received::Backend(None) => break,
            };

            self.fan_out(&channels, msg);
        }

        info!(topic = %self.name, "pump exiting");
    }

    fn fan_out(&self, channels: &[Arc<Channel>], msg: Arc<Message>) {
        let Some((first, rest)) = channels.split_first() else {
            return;
        };
        for channel in rest {
            self.deliver(channel, Arc::new(msg.duplicate()));
        }
        self.deliver(first, msg);
    }

    fn deliver(&self, channel: &Channel, msg: Arc<Message>) {
        let id = msg.id;
        let deferred = msg.deferred();
        let result = if deferred.is_zero() {
            channel.put_message(msg)
        } else {
            channel.put_message_deferred(msg, deferred)
        };
        if let Err(e) = result {
            error!(topic = %self.name, channel = %channel.name(), id = %id, error = %e, "failed to put message to channel");
        }
    }

    /// Discard everything buffered in the topic itself.
    pub fn empty(&self) -> Result<(), BrokerError> {
        self.memory.drain();
        self.backend.empty()?;
        Ok(())
    }

    /// Stop the pump, delete every channel and discard all storage.
    pub async fn delete(&self) -> Result<(), BrokerError> {
        self.exit(true).await
    }

    /// Stop the pump, close every channel and persist what is buffered.
    pub async fn close(&self) -> Result<(), BrokerError> {
        self.exit(false).await
    }

    async fn exit(&self, deleted: bool) -> Result<(), BrokerError> {
        {
            let _guard = self.exit_lock.write();
            if self.exit_flag.swap(true, Ordering::AcqRel) {
                return Err(BrokerError::Exiting);
            }
        }

        if deleted {
            info!(topic = %self.name, "deleting topic");
            self.ctx.notify(!self.ephemeral);
        } else {
            info!(topic = %self.name, "closing topic");
        }

        self.exit.cancel();
        let pump = self.pump.lock().take();
        if let Some(pump) = pump {
            if let Err(e) = pump.await {
                error!(topic = %self.name, error = %e, "pump task failed");
            }
        }

        if deleted {
            let channels: Vec<Arc<Channel>> =
                self.channels.write().drain().map(|(_, c)| c).collect();
            for channel in channels {
                if let Err(e) = channel.delete() {
                    warn!(topic = %self.name, channel = %channel.name(), error = %e, "failed to delete channel");
                }
            }
            self.empty()?;
            self.backend.delete()?;
            return Ok(());
        }

        for channel in self.channels() {
            if let Err(e) = channel.close() {
                error!(topic = %self.name, channel = %channel.name(), error = %e, "failed to close channel");
            }
        }
        self.flush();
        self.backend.close()?;
        Ok(())
    }

    fn flush(&self) {
        let pending = self.memory.drain();
        if pending.is_empty() {
            return;
        }
        info!(topic = %self.name, count = pending.len(), "flushing messages to backend");
        for msg in pending {
            if let Err(e) = self.backend.put(&msg.encode()) {
                error!(topic = %self.name, id = %msg.id, error = %e, "failed to flush message");
            }
        }
    }

    /// End-to-end latency across all channels.
    pub fn aggregate_e2e_latency(&self) -> QuantileResult {
        let latency = &self.ctx.settings().latency;
        if !latency.enabled() {
            return QuantileResult::default();
        }
        let merged = LatencySketch::new(latency.window_time(), latency.percentiles.clone());
        for channel in self.channels() {
            if let Some(sketch) = channel.e2e_latency() {
                merged.merge(sketch);
            }
        }
        merged.result()
    }

    /// Snapshot of the topic and its channels, optionally limited to one
    /// channel.
    pub fn stats(&self, channel: Option<&str>) -> TopicStats {
        let mut channels: Vec<_> = self
            .channels()
            .iter()
            .filter(|c| channel.is_none_or(|name| c.name() == name))
            .map(|c| c.stats())
            .collect();
        channels.sort_by(|a, b| a.channel_name.cmp(&b.channel_name));

        TopicStats {
            topic_name: self.name.clone(),
            channels,
            depth: self.depth(),
            backend_depth: self.backend.depth(),
            message_count: self.message_count(),
            message_bytes: self.message_bytes(),
            paused: self.is_paused(),
            e2e_processing_latency: self.aggregate_e2e_latency(),
        }
    }
}

impl std::fmt::Debug for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Topic")
            .field("name", &self.name)
            .field("ephemeral", &self.ephemeral)
            .field("exiting", &self.exiting())
            .finish()
    }
}
