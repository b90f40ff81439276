//! The `broker` module is the message routing core.
//!
//! - [`Node`] owns the topics and runs the background tasks.
//! - [`Topic`] accepts published messages and fans them out to its channels.
//! - [`Channel`] tracks what each subscriber group has been sent, what is
//!   awaiting acknowledgement and what is scheduled for later.
//! - [`QueueScanner`] expires in-flight and deferred messages across all
//!   channels with a self-sizing worker pool.

pub mod channel;
pub mod context;
pub mod guid;
pub mod memory_queue;
pub mod message;
pub mod names;
pub mod node;
pub mod pqueue;
pub mod quantile;
pub mod scanner;
pub mod stats;
pub mod topic;

pub use channel::Channel;
pub use context::{Context, Health, MetadataEvent};
pub use message::{Message, MessageId};
pub use node::Node;
pub use scanner::QueueScanner;
pub use stats::{ChannelStats, TopicStats};
pub use topic::Topic;

#[cfg(test)]
mod tests;
