//! Per-topic message ID generation.
//!
//! Snowflake layout in a u64: 42 bits of milliseconds since a fixed epoch,
//! 10 bits of node id, 12 bits of per-millisecond sequence. The id is
//! rendered as 16 lowercase hex digits so it is fixed-width on the wire.

use thiserror::Error;

use super::message::{MSG_ID_LENGTH, MessageId};

const NODE_ID_BITS: u64 = 10;
const SEQUENCE_BITS: u64 = 12;
const NODE_ID_SHIFT: u64 = SEQUENCE_BITS;
const TIMESTAMP_SHIFT: u64 = SEQUENCE_BITS + NODE_ID_BITS;
const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;

/// 2010-11-04T01:42:54.657Z
const TWEPOCH_MS: i64 = 1_288_834_974_657;

pub const MAX_NODE_ID: i64 = 1 << NODE_ID_BITS;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GuidError {
    #[error("time has gone backwards")]
    TimeBackwards,
    #[error("sequence expired")]
    SequenceExpired,
}

#[derive(Debug)]
pub struct GuidFactory {
    node_id: u64,
    sequence: u64,
    last_timestamp: i64,
}

impl GuidFactory {
    pub fn new(node_id: i64) -> Self {
        Self {
            node_id: (node_id as u64) & ((1 << NODE_ID_BITS) - 1),
            sequence: 0,
            last_timestamp: 0,
        }
    }

    pub fn new_guid(&mut self) -> Result<MessageId, GuidError> {
        self.new_guid_at(chrono::Utc::now().timestamp_millis())
    }

    fn new_guid_at(&mut self, ts: i64) -> Result<MessageId, GuidError> {
        if ts < self.last_timestamp {
            return Err(GuidError::TimeBackwards);
        }

        if ts == self.last_timestamp {
            // stays exhausted until the clock moves on
            let next = (self.sequence + 1) & SEQUENCE_MASK;
            if next == 0 {
                return Err(GuidError::SequenceExpired);
            }
            self.sequence = next;
        } else {
            self.sequence = 0;
        }
        self.last_timestamp = ts;

        let raw = (((ts - TWEPOCH_MS) as u64) << TIMESTAMP_SHIFT)
            | (self.node_id << NODE_ID_SHIFT)
            | self.sequence;
        Ok(hex_id(raw))
    }
}

fn hex_id(raw: u64) -> MessageId {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = [0u8; MSG_ID_LENGTH];
    for (i, byte) in raw.to_be_bytes().iter().enumerate() {
        out[i * 2] = HEX[(byte >> 4) as usize];
        out[i * 2 + 1] = HEX[(byte & 0x0f) as usize];
    }
    MessageId(out)
}
