//! The data model of §3: per-queue identity, ownership and per-channel
//! bookkeeping. These are plain records; the behavior that maintains the
//! invariants lives in [`crate::state`].

use std::collections::HashMap;
use std::sync::Arc;

use bq_common::{Channel, ChannelId, ConsumerTag, DeliveryId, Limiter, Message, TxnId};

/// Identity and declare-time policy for a queue (§3 `QueueDescriptor`).
#[derive(Debug, Clone)]
pub struct QueueDescriptor {
    pub name: String,
    pub durable: bool,
    pub auto_delete: bool,
    pub arguments: HashMap<String, String>,
}

impl QueueDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: false,
            auto_delete: false,
            arguments: HashMap::new(),
        }
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = auto_delete;
        self
    }
}

/// Connection-level exclusivity lock over the queue's existence (§3
/// `Owner`, §9 "Exclusive vs exclusive-consumer"). Implies auto-delete on
/// owner death regardless of `auto_delete` policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Owner {
    pub channel_id: ChannelId,
}

/// Single-consumer dispatch discipline within an already-declared queue
/// (§3 `ExclusiveConsumer`, §9). Distinct from [`Owner`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExclusiveConsumer {
    pub channel_id: ChannelId,
    pub tag: ConsumerTag,
}

/// One registered consumer (§3 `ConsumerRecord`).
#[derive(Debug, Clone)]
pub struct ConsumerRecord {
    pub tag: ConsumerTag,
    pub ack_required: bool,
}

/// Composite key identifying one consumer registration within a queue:
/// the same channel may register several tags.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConsumerKey {
    pub channel_id: ChannelId,
    pub tag: ConsumerTag,
}

/// Per-channel state, keyed by [`ChannelId`] (§3 `ChannelRecord`). Lives
/// for as long as the channel has ever touched this queue.
pub struct ChannelRecord {
    /// Handle back to the channel, used for `deliver`/`consumer_cancelled`
    /// callbacks. Set on the channel's first consumer registration.
    pub channel: Arc<dyn Channel>,
    pub consumer_count: u32,
    pub limiter: Option<Arc<dyn Limiter>>,
    pub unacked: HashMap<DeliveryId, Message>,
    pub is_limit_active: bool,
    pub current_txn: Option<TxnId>,
    pub unsent_message_count: u32,
}

impl ChannelRecord {
    pub fn new(channel: Arc<dyn Channel>) -> Self {
        Self {
            channel,
            consumer_count: 0,
            limiter: None,
            unacked: HashMap::new(),
            is_limit_active: false,
            current_txn: None,
            unsent_message_count: 0,
        }
    }

    /// I4: a channel is blocked iff its limit is active or it is at/over
    /// the per-channel unsent cap.
    pub fn is_blocked(&self, unsent_limit: u32) -> bool {
        self.is_limit_active || self.unsent_message_count >= unsent_limit
    }
}

/// An open transaction touching this queue (§3 `TxnRecord`). Exists from
/// the first publish/ack recorded under it until commit or rollback (I7).
pub struct TxnRecord {
    pub origin_channel: ChannelId,
    pub is_persistent: bool,
    pub pending_publishes: Vec<Message>,
    pub pending_ack_batches: Vec<Vec<DeliveryId>>,
}

impl TxnRecord {
    pub fn new(origin_channel: ChannelId) -> Self {
        Self {
            origin_channel,
            is_persistent: false,
            pending_publishes: Vec::new(),
            pending_ack_batches: Vec::new(),
        }
    }
}

/// A buffered message awaiting dispatch, with its redelivery flag (§3
/// `MessageBuffer` entries).
#[derive(Debug, Clone)]
pub struct Buffered {
    pub message: Message,
    pub redelivered: bool,
}
