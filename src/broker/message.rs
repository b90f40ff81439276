//! Message definitions for the broker
//!
//! A `Message` is created once per publish and then copied once per extra
//! channel by the topic pump. While a channel tracks it (in flight or
//! deferred), the channel owns its delivery bookkeeping: `priority`, heap
//! `index`, owning client and delivery timestamp. Those fields are atomics so
//! the same `Arc<Message>` can sit in a channel's map, its heap and a
//! consumer's send buffer at once; they are only written while the owning
//! channel holds the lock of the set the message is in.
//!
//! Backend record layout (big-endian):
//!
//! ```text
//! [ timestamp: i64 ][ attempts: u16 ][ id: 16 bytes ][ body ... ]
//! ```

use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicIsize, AtomicU16, Ordering};
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::client::ClientId;

pub const MSG_ID_LENGTH: usize = 16;
pub const MIN_VALID_MSG_LENGTH: usize = MSG_ID_LENGTH + 8 + 2;

/// Fixed-width message identity: 16 ASCII hex digits.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub [u8; MSG_ID_LENGTH]);

impl MessageId {
    pub fn as_bytes(&self) -> &[u8; MSG_ID_LENGTH] {
        &self.0
    }
}

impl From<[u8; MSG_ID_LENGTH]> for MessageId {
    fn from(raw: [u8; MSG_ID_LENGTH]) -> Self {
        Self(raw)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({self})")
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("invalid message buffer size ({len})")]
    TooShort { len: usize },
}

/// Current wall-clock time in nanoseconds since the Unix epoch.
pub fn now_nanos() -> i64 {
    chrono::Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or(i64::MAX)
}

pub(crate) fn duration_nanos(d: Duration) -> i64 {
    i64::try_from(d.as_nanos()).unwrap_or(i64::MAX)
}

#[derive(Debug)]
pub struct Message {
    pub id: MessageId,
    pub body: Bytes,
    /// Creation time, nanoseconds since the Unix epoch.
    pub timestamp: i64,
    attempts: AtomicU16,
    deferred: Duration,

    // delivery bookkeeping, see module docs
    priority: AtomicI64,
    index: AtomicIsize,
    client_id: AtomicI64,
    delivery_ts: AtomicI64,
}

impl Message {
    pub fn new(id: MessageId, body: impl Into<Bytes>) -> Self {
        Self::with_timestamp(id, body.into(), now_nanos())
    }

    fn with_timestamp(id: MessageId, body: Bytes, timestamp: i64) -> Self {
        Self {
            id,
            body,
            timestamp,
            attempts: AtomicU16::new(0),
            deferred: Duration::ZERO,
            priority: AtomicI64::new(0),
            index: AtomicIsize::new(-1),
            client_id: AtomicI64::new(0),
            delivery_ts: AtomicI64::new(0),
        }
    }

    /// Mark the message for deferred delivery: channels receive it into
    /// their deferred queue and expose it only after `delay`.
    pub fn deferred_by(mut self, delay: Duration) -> Self {
        self.deferred = delay;
        self
    }

    pub fn deferred(&self) -> Duration {
        self.deferred
    }

    /// A fresh instance for another channel. Identity, payload, timestamp and
    /// deferral are shared; delivery bookkeeping starts clean.
    pub fn duplicate(&self) -> Self {
        let mut copy = Self::with_timestamp(self.id, self.body.clone(), self.timestamp);
        copy.deferred = self.deferred;
        copy
    }

    pub fn attempts(&self) -> u16 {
        self.attempts.load(Ordering::Relaxed)
    }

    /// Called by the delivery layer each time the message is sent out.
    pub fn increment_attempts(&self) -> u16 {
        self.attempts.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    /// Absolute deadline (nanoseconds) in whichever queue currently holds it.
    pub fn priority(&self) -> i64 {
        self.priority.load(Ordering::Relaxed)
    }

    pub(crate) fn set_priority(&self, priority: i64) {
        self.priority.store(priority, Ordering::Relaxed);
    }

    /// Current heap slot, or -1 when not in any heap.
    pub fn index(&self) -> isize {
        self.index.load(Ordering::Relaxed)
    }

    pub(crate) fn set_index(&self, index: isize) {
        self.index.store(index, Ordering::Relaxed);
    }

    /// Owning client; meaningful only while in flight.
    pub fn client_id(&self) -> ClientId {
        self.client_id.load(Ordering::Relaxed)
    }

    pub(crate) fn set_client_id(&self, client_id: ClientId) {
        self.client_id.store(client_id, Ordering::Relaxed);
    }

    /// When the current delivery started; meaningful only while in flight.
    pub fn delivery_ts(&self) -> i64 {
        self.delivery_ts.load(Ordering::Relaxed)
    }

    pub(crate) fn set_delivery_ts(&self, ts: i64) {
        self.delivery_ts.store(ts, Ordering::Relaxed);
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(MIN_VALID_MSG_LENGTH + self.body.len());
        buf.put_i64(self.timestamp);
        buf.put_u16(self.attempts());
        buf.put_slice(&self.id.0);
        buf.put_slice(&self.body);
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < MIN_VALID_MSG_LENGTH {
            return Err(DecodeError::TooShort { len: data.len() });
        }

        let (ts, rest) = data.split_at(8);
        let (attempts, rest) = rest.split_at(2);
        let (id, body) = rest.split_at(MSG_ID_LENGTH);

        let mut raw_id = [0u8; MSG_ID_LENGTH];
        raw_id.copy_from_slice(id);

        let msg = Self::with_timestamp(
            MessageId(raw_id),
            Bytes::copy_from_slice(body),
            i64::from_be_bytes([ts[0], ts[1], ts[2], ts[3], ts[4], ts[5], ts[6], ts[7]]),
        );
        msg.attempts
            .store(u16::from_be_bytes([attempts[0], attempts[1]]), Ordering::Relaxed);
        Ok(msg)
    }
}
