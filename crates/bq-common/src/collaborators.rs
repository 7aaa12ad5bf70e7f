//! Trait boundaries for the components §2 treats as external collaborators:
//! Channel, Limiter and Persister. Wire framing, routing and the on-disk
//! layout behind these traits are out of scope for this workspace; only the
//! interfaces the queue core calls are specified here.

use async_trait::async_trait;

use crate::ids::{ConsumerTag, DeliveryId};
use crate::message::{Message, PersistenceKey};
use crate::ids::TxnId;

/// A single push to a consumer, with at-most-once delivery semantics.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub queue_name: String,
    pub delivery_id: DeliveryId,
    pub redelivered: bool,
    pub message: Message,
}

/// The queue-side contract a Channel exposes (§6 "To Channel").
#[async_trait]
pub trait Channel: Send + Sync {
    /// Push a message to this channel for the named consumer tag.
    async fn deliver(&self, tag: &ConsumerTag, delivery: Delivery);

    /// Notify the channel that one of its consumers was cancelled by the
    /// queue (e.g. as part of exclusive-consumer churn). Channels cancelled
    /// by their own request do not need this notification.
    async fn consumer_cancelled(&self, tag: ConsumerTag);
}

/// Per-channel credit arbiter (§2, §4.2). One `Limiter` instance is handed
/// to the queue when a channel's first consumer registers; the queue never
/// needs to know which channel a `Limiter` belongs to, since it only ever
/// calls the instance stored in that channel's `ChannelRecord`.
#[async_trait]
pub trait Limiter: Send + Sync {
    /// May this channel accept one more delivery?
    async fn can_send(&self, ack_required: bool) -> bool;

    /// Called when the channel registers its first consumer on a queue.
    async fn register(&self);

    /// Called when the channel's consumer count on a queue reaches zero.
    async fn unregister(&self);

    /// Informs the limiter that `count` consumer-tagged deliveries were
    /// just acked, so it may replenish credit (§4.3 step 3). Basic-get
    /// acks never reach here, since they carry no consumer tag.
    async fn notify_ack(&self, count: u32);
}

/// A unit of persisted work, as handed to the [`Persister`] (§6 item
/// shapes).
#[derive(Debug, Clone)]
pub enum PersistItem {
    Publish {
        message: Message,
        queue: String,
        key: PersistenceKey,
    },
    Ack {
        queue: String,
        key: PersistenceKey,
    },
    Deliver {
        queue: String,
        key: PersistenceKey,
    },
}

/// Identifies one transaction's slice of work on one queue — the unit the
/// Persister commits or rolls back atomically (§6, §9 "Txn coordination
/// across queues").
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TxnScope {
    pub txn_id: TxnId,
    pub queue_name: String,
}

/// The append-only write-ahead log this workspace treats the persister as
/// (§1, §6 "To Persister"). Durable layout is out of scope; only these four
/// operations are specified.
#[async_trait]
pub trait Persister: Send + Sync {
    /// Non-transactional batch.
    async fn dirty_work(&self, items: Vec<PersistItem>);

    /// Append items to an open transaction.
    async fn extend_transaction(&self, scope: TxnScope, items: Vec<PersistItem>);

    /// Commit a transaction. Errors are fatal to the owning queue (§7
    /// `persister-commit-failure`).
    async fn commit_transaction(&self, scope: TxnScope) -> Result<(), String>;

    /// Roll back a transaction. Infallible from the queue's perspective.
    async fn rollback_transaction(&self, scope: TxnScope);
}
