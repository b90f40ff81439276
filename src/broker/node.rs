//! The node owns every topic and the background tasks that serve them.
//!
//! It is the entry point for the protocol layer: topics are looked up (or
//! created) by name here, and the node persists the set of topics and
//! channels so they survive restarts.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::channel::Channel;
use super::context::{Context, MetadataEvent};
use super::names;
use super::scanner::QueueScanner;
use super::stats::TopicStats;
use super::topic::Topic;
use crate::client::ClientId;
use crate::config::Settings;
use crate::persistence::BackendError;
use crate::persistence::metadata::{
    ChannelMetadata, Metadata, TopicMetadata, metadata_file, read_metadata, write_metadata,
};
use crate::utils::BrokerError;

const QUEUES_DIR: &str = "queues";

pub struct Node {
    ctx: Arc<Context>,
    data_path: PathBuf,
    topics: RwLock<HashMap<String, Arc<Topic>>>,
    client_id_seq: AtomicI64,

    events: Mutex<Option<mpsc::UnboundedReceiver<MetadataEvent>>>,
    persist_lock: Mutex<()>,
    exit: CancellationToken,
    exiting: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    /// Validate `settings`, prepare the data directory and open the store.
    pub fn new(settings: Settings) -> Result<Arc<Self>, BrokerError> {
        settings.validate()?;

        let data_path = PathBuf::from(&settings.node.data_path);
        std::fs::create_dir_all(&data_path).map_err(BackendError::from)?;
        let store = sled::open(data_path.join(QUEUES_DIR)).map_err(BackendError::from)?;

        let (ctx, events) = Context::new(settings, store);
        info!(data_path = %data_path.display(), node_id = ctx.settings().node.node_id, "node created");

        Ok(Arc::new(Self {
            ctx,
            data_path,
            topics: RwLock::new(HashMap::new()),
            client_id_seq: AtomicI64::new(0),
            events: Mutex::new(Some(events)),
            persist_lock: Mutex::new(()),
            exit: CancellationToken::new(),
            exiting: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }))
    }

    pub fn settings(&self) -> &Settings {
        self.ctx.settings()
    }

    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    pub fn next_client_id(&self) -> ClientId {
        self.client_id_seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn set_health(&self, err: Option<String>) {
        self.ctx.health().set(err);
    }

    pub fn is_healthy(&self) -> bool {
        self.ctx.health().is_healthy()
    }

    /// "OK", or "NOK - <last error>".
    pub fn get_health(&self) -> String {
        self.ctx.health().status()
    }

    /// Get or create a topic. New topics start delivering immediately unless
    /// metadata is still being loaded.
    pub fn get_topic(self: &Arc<Self>, name: &str) -> Result<Arc<Topic>, BrokerError> {
        if !names::is_valid_topic_name(name) {
            return Err(BrokerError::InvalidName {
                kind: "topic",
                name: name.to_string(),
            });
        }
        if let Some(topic) = self.topics.read().get(name) {
            return Ok(topic.clone());
        }
        if self.exiting.load(Ordering::Acquire) {
            return Err(BrokerError::Exiting);
        }

        let topic = {
            let mut topics = self.topics.write();
            if let Some(topic) = topics.get(name) {
                return Ok(topic.clone());
            }
            let topic = Topic::new(name, self.ctx.clone(), Arc::downgrade(self))?;
            topics.insert(name.to_string(), topic.clone());
            topic
        };
        info!(topic = %name, "topic created");

        if !self.ctx.is_loading() {
            topic.start();
        }
        Ok(topic)
    }

    pub fn get_existing_topic(&self, name: &str) -> Result<Arc<Topic>, BrokerError> {
        self.topics
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| BrokerError::TopicNotFound(name.to_string()))
    }

    /// Delete a topic, its channels and all of their storage.
    pub async fn delete_existing_topic(&self, name: &str) -> Result<(), BrokerError> {
        let topic = self.get_existing_topic(name)?;

        // delete first so nothing new lands in a topic that is going away
        let result = topic.delete().await;
        if let Err(e) = &result {
            warn!(topic = %name, error = %e, "failed to delete topic");
        }

        self.topics.write().remove(name);
        result
    }

    pub fn topics(&self) -> Vec<Arc<Topic>> {
        self.topics.read().values().cloned().collect()
    }

    /// Every channel of every topic.
    pub fn channels(&self) -> Vec<Arc<Channel>> {
        self.topics().iter().flat_map(|t| t.channels()).collect()
    }

    /// Recreate the topics and channels recorded by the last run.
    ///
    /// Invalid names are skipped with a warning. Topics are started only once
    /// all of their channels exist.
    pub async fn load_metadata(self: &Arc<Self>) -> Result<(), BrokerError> {
        self.ctx.set_loading(true);
        let result = self.restore_metadata().await;
        self.ctx.set_loading(false);
        result
    }

    async fn restore_metadata(self: &Arc<Self>) -> Result<(), BrokerError> {
        let path = metadata_file(&self.data_path);
        let Some(metadata) = read_metadata(&path)? else {
            return Ok(());
        };

        for t in metadata.topics {
            if !names::is_valid_topic_name(&t.name) {
                warn!(topic = %t.name, "skipping creation of invalid topic");
                continue;
            }
            let topic = self.get_topic(&t.name)?;
            if t.paused {
                topic.pause();
            }

            for c in t.channels {
                if !names::is_valid_channel_name(&c.name) {
                    warn!(topic = %t.name, channel = %c.name, "skipping creation of invalid channel");
                    continue;
                }
                let channel = topic.get_channel(&c.name).await?;
                if c.paused {
                    channel.pause();
                }
            }
            topic.start();
        }
        Ok(())
    }

    /// Atomically write the set of non-ephemeral topics and channels.
    /// Anything already being deleted is left out.
    pub fn persist_metadata(&self) -> Result<(), BrokerError> {
        let _guard = self.persist_lock.lock();

        let mut topics: Vec<TopicMetadata> = self
            .topics()
            .iter()
            .filter(|t| !t.is_ephemeral() && !t.exiting())
            .map(|t| {
                let mut channels: Vec<ChannelMetadata> = t
                    .channels()
                    .iter()
                    .filter(|c| !c.is_ephemeral() && !c.exiting())
                    .map(|c| ChannelMetadata {
                        name: c.name().to_string(),
                        paused: c.is_paused(),
                    })
                    .collect();
                channels.sort_by(|a, b| a.name.cmp(&b.name));
                TopicMetadata {
                    name: t.name().to_string(),
                    paused: t.is_paused(),
                    channels,
                }
            })
            .collect();
        topics.sort_by(|a, b| a.name.cmp(&b.name));

        let path = metadata_file(&self.data_path);
        info!(path = %path.display(), topics = topics.len(), "persisting topic/channel metadata");
        write_metadata(
            &path,
            &Metadata {
                version: env!("CARGO_PKG_VERSION").to_string(),
                topics,
            },
        )
    }

    /// Spawn the queue scanner and the metadata persister.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();

        let node = Arc::downgrade(self);
        let scanner = QueueScanner::new(
            self.ctx.settings().scanner.clone(),
            move || node.upgrade().map(|n| n.channels()).unwrap_or_default(),
            self.exit.child_token(),
        );
        tasks.push(tokio::spawn(scanner.run()));

        if let Some(events) = self.events.lock().take() {
            tasks.push(tokio::spawn(metadata_loop(
                Arc::downgrade(self),
                events,
                self.exit.child_token(),
            )));
        }
    }

    /// Persist metadata, close every topic and stop the background tasks.
    pub async fn exit(&self) {
        if self.exiting.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("node exiting");

        if let Err(e) = self.persist_metadata() {
            error!(error = %e, "failed to persist metadata");
        }

        for topic in self.topics() {
            if let Err(e) = topic.close().await {
                error!(topic = %topic.name(), error = %e, "failed to close topic");
            }
        }

        self.exit.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                error!(error = %e, "background task failed");
            }
        }

        if let Err(e) = self.ctx.store().flush() {
            error!(error = %e, "failed to flush store");
        }
        info!("node exited");
    }

    /// Stats for every topic, or only `topic` (and within it only `channel`).
    pub fn stats(&self, topic: Option<&str>, channel: Option<&str>) -> Vec<TopicStats> {
        let mut stats: Vec<TopicStats> = self
            .topics()
            .iter()
            .filter(|t| topic.is_none_or(|name| t.name() == name))
            .map(|t| t.stats(channel))
            .collect();
        stats.sort_by(|a, b| a.topic_name.cmp(&b.topic_name));
        stats
    }
}

async fn metadata_loop(
    node: Weak<Node>,
    mut events: mpsc::UnboundedReceiver<MetadataEvent>,
    exit: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = exit.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        if !event.persist || event.loading {
            continue;
        }
        let Some(node) = node.upgrade() else {
            break;
        };
        if let Err(e) = node.persist_metadata() {
            error!(error = %e, "failed to persist metadata");
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("data_path", &self.data_path)
            .field("topics", &self.topics.read().len())
            .finish()
    }
}
