//! The `error` module defines the error types shared across `popsubd`.
//!
//! Every mutating operation on a topic, channel or node returns a
//! `Result<_, BrokerError>`. Backend failures are wrapped so callers can tell
//! a degraded store apart from a protocol violation.

use std::fmt;

use thiserror::Error;

use crate::broker::message::MessageId;
use crate::client::ClientId;
use crate::persistence::BackendError;

/// Which per-channel tracking set an ID was looked up in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackedSet {
    InFlight,
    Deferred,
}

impl fmt::Display for TrackedSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackedSet::InFlight => write!(f, "in flight"),
            TrackedSet::Deferred => write!(f, "deferred"),
        }
    }
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("exiting")]
    Exiting,

    #[error("ID {id} already {set}")]
    AlreadyTracked { id: MessageId, set: TrackedSet },

    #[error("ID {id} not {set}")]
    NotTracked { id: MessageId, set: TrackedSet },

    #[error("client {client_id} does not own message {id}")]
    NotOwned { id: MessageId, client_id: ClientId },

    #[error("consumers for {topic}:{channel} exceeds limit of {limit}")]
    ConsumerLimitExceeded {
        topic: String,
        channel: String,
        limit: usize,
    },

    #[error("invalid {kind} name '{name}'")]
    InvalidName { kind: &'static str, name: String },

    #[error("message too large ({size} > {max} bytes)")]
    MessageTooLarge { size: usize, max: usize },

    #[error("failed to write message to backend - {0}")]
    BackendWriteFailed(#[source] BackendError),

    #[error("topic '{0}' does not exist")]
    TopicNotFound(String),

    #[error("channel '{0}' does not exist")]
    ChannelNotFound(String),

    #[error("metadata error: {0}")]
    Metadata(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
}
