use std::time::Duration;

use serde::Deserialize;

use crate::broker::guid::MAX_NODE_ID;
use crate::utils::BrokerError;

/// Top-level configuration settings for the node.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Settings {
    pub node: NodeSettings,
    pub queue: QueueSettings,
    pub scanner: ScannerSettings,
    pub latency: LatencySettings,
    pub log: LogSettings,
}

/// Identity and on-disk location of the node.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct NodeSettings {
    pub data_path: String,
    /// Mixed into every message ID; must be below 1024.
    pub node_id: i64,
}

/// Buffering and delivery limits shared by every topic and channel.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct QueueSettings {
    pub mem_queue_size: usize,
    pub ephemeral_queue_size: usize,
    pub max_msg_size: usize,
    pub msg_timeout_ms: u64,
    pub max_msg_timeout_ms: u64,
    /// 0 disables the limit.
    pub max_channel_consumers: usize,
}

/// Timeout/deferred queue scanning.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ScannerSettings {
    pub interval_ms: u64,
    pub refresh_interval_ms: u64,
    pub selection_count: usize,
    pub worker_pool_max: usize,
    pub dirty_percent: f64,
}

/// End-to-end processing latency tracking. Empty `percentiles` disables it.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct LatencySettings {
    pub window_time_ms: u64,
    pub percentiles: Vec<f64>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct LogSettings {
    pub level: String,
}

impl QueueSettings {
    pub fn msg_timeout(&self) -> Duration {
        Duration::from_millis(self.msg_timeout_ms)
    }

    pub fn max_msg_timeout(&self) -> Duration {
        Duration::from_millis(self.max_msg_timeout_ms)
    }
}

impl ScannerSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }
}

impl LatencySettings {
    pub fn window_time(&self) -> Duration {
        Duration::from_millis(self.window_time_ms)
    }

    pub fn enabled(&self) -> bool {
        !self.percentiles.is_empty()
    }
}

impl Settings {
    /// Reject values the broker cannot run with.
    pub fn validate(&self) -> Result<(), BrokerError> {
        if self.node.node_id < 0 || self.node.node_id >= MAX_NODE_ID {
            return Err(BrokerError::Config(format!(
                "node_id must be [0,{MAX_NODE_ID})"
            )));
        }
        if self.node.data_path.is_empty() {
            return Err(BrokerError::Config("data_path must not be empty".into()));
        }
        if self.queue.msg_timeout().is_zero()
            || self.queue.msg_timeout() > self.queue.max_msg_timeout()
        {
            return Err(BrokerError::Config(
                "msg_timeout must be greater than zero and at most max_msg_timeout".into(),
            ));
        }
        if self.scanner.interval_ms == 0 || self.scanner.refresh_interval_ms == 0 {
            return Err(BrokerError::Config(
                "scanner intervals must be greater than zero".into(),
            ));
        }
        if self.scanner.selection_count == 0 || self.scanner.worker_pool_max == 0 {
            return Err(BrokerError::Config(
                "scanner selection_count and worker_pool_max must be at least 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.scanner.dirty_percent) {
            return Err(BrokerError::Config("dirty_percent must be [0,1]".into()));
        }
        if let Some(bad) = self
            .latency
            .percentiles
            .iter()
            .find(|p| **p <= 0.0 || **p > 1.0)
        {
            return Err(BrokerError::Config(format!(
                "invalid E2E processing latency percentile: {bad}"
            )));
        }
        Ok(())
    }
}

/// Partial configuration settings loaded from files or environment.
///
/// Any subset of settings may be given. Missing values are filled in
/// from `Settings::default()`.
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub node: Option<PartialNodeSettings>,
    pub queue: Option<PartialQueueSettings>,
    pub scanner: Option<PartialScannerSettings>,
    pub latency: Option<PartialLatencySettings>,
    pub log: Option<PartialLogSettings>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialNodeSettings {
    pub data_path: Option<String>,
    pub node_id: Option<i64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialQueueSettings {
    pub mem_queue_size: Option<usize>,
    pub ephemeral_queue_size: Option<usize>,
    pub max_msg_size: Option<usize>,
    pub msg_timeout_ms: Option<u64>,
    pub max_msg_timeout_ms: Option<u64>,
    pub max_channel_consumers: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialScannerSettings {
    pub interval_ms: Option<u64>,
    pub refresh_interval_ms: Option<u64>,
    pub selection_count: Option<usize>,
    pub worker_pool_max: Option<usize>,
    pub dirty_percent: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialLatencySettings {
    pub window_time_ms: Option<u64>,
    pub percentiles: Option<Vec<f64>>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialLogSettings {
    pub level: Option<String>,
}

impl PartialSettings {
    /// Overlay whatever was specified onto `default`.
    pub fn merge(self, default: Settings) -> Settings {
        let node = self.node.unwrap_or_default();
        let queue = self.queue.unwrap_or_default();
        let scanner = self.scanner.unwrap_or_default();
        let latency = self.latency.unwrap_or_default();
        let log = self.log.unwrap_or_default();

        Settings {
            node: NodeSettings {
                data_path: node.data_path.unwrap_or(default.node.data_path),
                node_id: node.node_id.unwrap_or(default.node.node_id),
            },
            queue: QueueSettings {
                mem_queue_size: queue.mem_queue_size.unwrap_or(default.queue.mem_queue_size),
                ephemeral_queue_size: queue
                    .ephemeral_queue_size
                    .unwrap_or(default.queue.ephemeral_queue_size),
                max_msg_size: queue.max_msg_size.unwrap_or(default.queue.max_msg_size),
                msg_timeout_ms: queue.msg_timeout_ms.unwrap_or(default.queue.msg_timeout_ms),
                max_msg_timeout_ms: queue
                    .max_msg_timeout_ms
                    .unwrap_or(default.queue.max_msg_timeout_ms),
                max_channel_consumers: queue
                    .max_channel_consumers
                    .unwrap_or(default.queue.max_channel_consumers),
            },
            scanner: ScannerSettings {
                interval_ms: scanner.interval_ms.unwrap_or(default.scanner.interval_ms),
                refresh_interval_ms: scanner
                    .refresh_interval_ms
                    .unwrap_or(default.scanner.refresh_interval_ms),
                selection_count: scanner
                    .selection_count
                    .unwrap_or(default.scanner.selection_count),
                worker_pool_max: scanner
                    .worker_pool_max
                    .unwrap_or(default.scanner.worker_pool_max),
                dirty_percent: scanner.dirty_percent.unwrap_or(default.scanner.dirty_percent),
            },
            latency: LatencySettings {
                window_time_ms: latency
                    .window_time_ms
                    .unwrap_or(default.latency.window_time_ms),
                percentiles: latency.percentiles.unwrap_or(default.latency.percentiles),
            },
            log: LogSettings {
                level: log.level.unwrap_or(default.log.level),
            },
        }
    }
}

/// Provides default values for `Settings`.
impl Default for Settings {
    fn default() -> Self {
        Self {
            node: NodeSettings {
                data_path: "data".to_string(),
                node_id: 0,
            },
            queue: QueueSettings {
                mem_queue_size: 10_000,
                ephemeral_queue_size: 1_000,
                max_msg_size: 1024 * 1024,
                msg_timeout_ms: 60_000,
                max_msg_timeout_ms: 15 * 60_000,
                max_channel_consumers: 0,
            },
            scanner: ScannerSettings {
                interval_ms: 100,
                refresh_interval_ms: 5_000,
                selection_count: 20,
                worker_pool_max: 4,
                dirty_percent: 0.25,
            },
            latency: LatencySettings {
                window_time_ms: 10 * 60_000,
                percentiles: Vec::new(),
            },
            log: LogSettings {
                level: "info".to_string(),
            },
        }
    }
}
