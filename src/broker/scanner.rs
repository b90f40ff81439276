//! Queue scanner: expires in-flight and deferred messages across channels.
//!
//! One coordinator task wakes every scan interval, samples a handful of
//! channels at random from a cached list, and hands them to a pool of
//! workers. If enough of the sampled channels had work, it samples again
//! straight away instead of waiting for the next tick. The channel list and
//! the pool size are refreshed on a slower interval.

use std::sync::Arc;

use rand::seq::index;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::channel::Channel;
use super::message::now_nanos;
use crate::config::ScannerSettings;

/// Workers wanted for `channel_count` channels: a quarter of them, rounded
/// up, within `[1, max]`.
pub fn ideal_pool_size(channel_count: usize, max: usize) -> usize {
    channel_count.div_ceil(4).clamp(1, max.max(1))
}

type WorkQueue = Arc<Mutex<mpsc::Receiver<Arc<Channel>>>>;

pub struct QueueScanner<F> {
    settings: ScannerSettings,
    list_channels: F,
    exit: CancellationToken,

    work_tx: mpsc::Sender<Arc<Channel>>,
    work_rx: WorkQueue,
    response_tx: mpsc::Sender<bool>,
    response_rx: mpsc::Receiver<bool>,

    // one close token per running worker
    workers: Vec<CancellationToken>,
    tasks: JoinSet<()>,
}

impl<F> QueueScanner<F>
where
    F: Fn() -> Vec<Arc<Channel>> + Send + Sync + 'static,
{
    pub fn new(settings: ScannerSettings, list_channels: F, exit: CancellationToken) -> Self {
        let capacity = settings.selection_count.max(1);
        let (work_tx, work_rx) = mpsc::channel(capacity);
        let (response_tx, response_rx) = mpsc::channel(capacity);
        Self {
            settings,
            list_channels,
            exit,
            work_tx,
            work_rx: Arc::new(Mutex::new(work_rx)),
            response_tx,
            response_rx,
            workers: Vec::new(),
            tasks: JoinSet::new(),
        }
    }

    pub fn pool_size(&self) -> usize {
        self.workers.len()
    }

    /// Run until the exit token fires, then stop every worker.
    pub async fn run(mut self) {
        let mut work_ticker = interval_at(
            Instant::now() + self.settings.interval(),
            self.settings.interval(),
        );
        work_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut refresh_ticker = interval_at(
            Instant::now() + self.settings.refresh_interval(),
            self.settings.refresh_interval(),
        );
        refresh_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut channels = (self.list_channels)();
        self.resize_pool(channels.len());

        loop {
            tokio::select! {
                biased;
                _ = self.exit.cancelled() => break,
                _ = refresh_ticker.tick() => {
                    channels = (self.list_channels)();
                    self.resize_pool(channels.len());
                    continue;
                }
                _ = work_ticker.tick() => {
                    if channels.is_empty() {
                        continue;
                    }
                }
            }

            if !self.scan(&channels).await {
                break;
            }
        }

        self.shutdown().await;
    }

    /// Sample and process until the dirty fraction drops to the threshold.
    /// Returns false if the scanner is exiting.
    async fn scan(&mut self, channels: &[Arc<Channel>]) -> bool {
        let num = self.settings.selection_count.min(channels.len());
        loop {
            let picks = index::sample(&mut rand::rng(), channels.len(), num).into_vec();
            for i in picks {
                if self.work_tx.send(channels[i].clone()).await.is_err() {
                    return false;
                }
            }

            let mut dirty = 0;
            for _ in 0..num {
                tokio::select! {
                    biased;
                    _ = self.exit.cancelled() => return false,
                    response = self.response_rx.recv() => match response {
                        Some(true) => dirty += 1,
                        Some(false) => {}
                        None => return false,
                    },
                }
            }

            if dirty as f64 / num as f64 <= self.settings.dirty_percent {
                return true;
            }
        }
    }

    /// Grow or shrink the worker pool to fit `channel_count`.
    pub fn resize_pool(&mut self, channel_count: usize) {
        let ideal = ideal_pool_size(channel_count, self.settings.worker_pool_max);
        if ideal == self.workers.len() {
            return;
        }

        while self.workers.len() > ideal {
            if let Some(close) = self.workers.pop() {
                close.cancel();
            }
        }
        while self.workers.len() < ideal {
            let close = self.exit.child_token();
            self.tasks.spawn(worker(
                self.work_rx.clone(),
                self.response_tx.clone(),
                close.clone(),
            ));
            self.workers.push(close);
        }
        debug!(pool_size = ideal, channels = channel_count, "resized queue scan pool");
    }

    async fn shutdown(mut self) {
        for close in self.workers.drain(..) {
            close.cancel();
        }
        while self.tasks.join_next().await.is_some() {}
        info!("queue scanner exiting");
    }
}

async fn worker(work: WorkQueue, responses: mpsc::Sender<bool>, close: CancellationToken) {
    loop {
        let channel = tokio::select! {
            biased;
            _ = close.cancelled() => return,
            channel = async { work.lock().await.recv().await } => match channel {
                Some(channel) => channel,
                None => return,
            },
        };

        let now = now_nanos();
        let mut dirty = channel.process_in_flight_queue(now);
        dirty |= channel.process_deferred_queue(now);

        if responses.send(dirty).await.is_err() {
            return;
        }
    }
}
