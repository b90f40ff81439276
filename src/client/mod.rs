//! The `client` module defines how the broker core sees a connected consumer.
//!
//! Connection handling lives outside this crate. The protocol layer wraps each
//! subscribed connection in a type implementing [`Consumer`] and registers it
//! with a channel, which then drives pause/unpause, timeout notifications and
//! forced disconnects through that trait alone.

pub mod consumer;
pub use consumer::{ClientId, ClientStats, Consumer};

#[cfg(test)]
pub(crate) mod mock;
