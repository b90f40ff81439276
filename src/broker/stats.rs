//! Point-in-time snapshots of topic and channel state.

use serde::Serialize;

use super::quantile::QuantileResult;
use crate::client::ClientStats;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChannelStats {
    pub channel_name: String,
    pub depth: i64,
    pub backend_depth: i64,
    pub in_flight_count: usize,
    pub deferred_count: usize,
    pub message_count: u64,
    pub requeue_count: u64,
    pub timeout_count: u64,
    pub client_count: usize,
    pub clients: Vec<ClientStats>,
    pub paused: bool,
    pub e2e_processing_latency: QuantileResult,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TopicStats {
    pub topic_name: String,
    pub channels: Vec<ChannelStats>,
    pub depth: i64,
    pub backend_depth: i64,
    pub message_count: u64,
    pub message_bytes: u64,
    pub paused: bool,
    pub e2e_processing_latency: QuantileResult,
}
