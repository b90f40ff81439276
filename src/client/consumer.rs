use serde::Serialize;

/// Unique identifier of a connected consumer, assigned by the node.
pub type ClientId = i64;

/// Capabilities a channel needs from a connected consumer.
///
/// Implemented by the protocol layer for each connection. A channel calls
/// these without knowing anything about the connection behind them, and never
/// while holding its in-flight or deferred locks.
pub trait Consumer: Send + Sync {
    /// Stop receiving new deliveries.
    fn pause(&self);

    /// Resume receiving new deliveries.
    fn unpause(&self);

    /// Forcibly disconnect.
    fn close(&self) -> std::io::Result<()>;

    /// One of this consumer's in-flight messages expired.
    fn timed_out_message(&self);

    /// Snapshot of the consumer's delivery counters for `topic`.
    fn stats(&self, topic: &str) -> ClientStats;

    /// Drop any locally buffered delivery state (the channel was emptied).
    fn empty(&self);
}

/// Delivery counters reported by a consumer.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ClientStats {
    pub client_id: ClientId,
    pub remote_address: String,
    pub ready_count: i64,
    pub in_flight_count: i64,
    pub message_count: u64,
    pub finish_count: u64,
    pub requeue_count: u64,
    pub paused: bool,
}
