//! Identity types shared by every collaborator of a queue process.
//!
//! Channels, delivery ids and transactions are represented as newtypes
//! rather than bare integers/strings so the compiler catches a delivery id
//! being passed where a channel id is expected.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identifies a channel (a connection's multiplex stream). Assigned by
/// whatever owns connections; the queue only ever compares and hashes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u64);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch-{}", self.0)
    }
}

/// Client-chosen label binding a consumer registration to acks and cancels.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConsumerTag(pub String);

impl fmt::Display for ConsumerTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-queue monotonic id attached to each dispatched message (I6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeliveryId(pub u64);

impl fmt::Display for DeliveryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A named scope batching publishes and acks that commit or roll back
/// atomically. Chosen by the client, shared across every queue the
/// transaction touches.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TxnId(pub String);

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn-{}", self.0)
    }
}

/// Generates strictly increasing [`DeliveryId`]s, starting at 1 (I6).
#[derive(Debug, Default)]
pub struct DeliveryIdGenerator(AtomicU64);

impl DeliveryIdGenerator {
    pub fn new() -> Self {
        Self(AtomicU64::new(1))
    }

    /// Returns the next id and advances the counter. Used exactly once per
    /// delivery attempt (push or basic-get), per I6.
    pub fn next(&self) -> DeliveryId {
        DeliveryId(self.0.fetch_add(1, Ordering::SeqCst))
    }
}

/// Convenience generator for [`ChannelId`]s, used by test harnesses and the
/// demo binary to mint distinct channels. The core never calls this itself.
#[derive(Debug, Default)]
pub struct ChannelIdGenerator(AtomicU64);

impl ChannelIdGenerator {
    pub fn new() -> Self {
        Self(AtomicU64::new(1))
    }

    pub fn next(&self) -> ChannelId {
        ChannelId(self.0.fetch_add(1, Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivery_ids_strictly_increase() {
        let gen = DeliveryIdGenerator::new();
        let a = gen.next();
        let b = gen.next();
        let c = gen.next();
        assert!(a.0 < b.0 && b.0 < c.0);
    }
}
