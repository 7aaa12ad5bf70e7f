//! The mailbox alphabet a [`crate::process::QueueProcess`] accepts (§4.1).
//! Every public operation on [`crate::process::QueueHandle`] lowers to one
//! of these and is processed strictly in arrival order.

use std::convert::Infallible;
use std::sync::Arc;

use bq_common::{Channel, ChannelId, ConsumerTag, DeliveryId, Limiter, Message, QueueOpError, TxnId};
use tokio::sync::oneshot;

/// Outcome of `basic-get` (§4.1.3).
#[derive(Debug)]
pub enum GetResult {
    Empty,
    Message {
        message: Message,
        delivery_id: DeliveryId,
        remaining: u64,
    },
}

/// Outcome of a mandatory `deliver`, reported only when the caller asked
/// for it (§4.1.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Routed,
    Queued,
}

pub(crate) type Reply<T> = oneshot::Sender<T>;

pub(crate) enum Command {
    RegisterConsumer {
        channel_id: ChannelId,
        channel: Arc<dyn Channel>,
        liveness: oneshot::Receiver<Infallible>,
        limiter: Option<Arc<dyn Limiter>>,
        tag: ConsumerTag,
        ack_required: bool,
        exclusive: bool,
        reply: Reply<Result<(), QueueOpError>>,
    },
    CancelConsumer {
        channel_id: ChannelId,
        tag: ConsumerTag,
        reply: Reply<()>,
    },
    Claim {
        channel_id: ChannelId,
        liveness: oneshot::Receiver<Infallible>,
        reply: Reply<Result<(), QueueOpError>>,
    },
    Deliver {
        txn: Option<TxnId>,
        channel_id: ChannelId,
        message: Message,
        reply: Option<Reply<RouteOutcome>>,
    },
    DeliverImmediately {
        txn: Option<TxnId>,
        channel_id: ChannelId,
        message: Message,
        reply: Reply<bool>,
    },
    BasicGet {
        channel_id: ChannelId,
        channel: Arc<dyn Channel>,
        ack_required: bool,
        reply: Reply<GetResult>,
    },
    Ack {
        txn: Option<TxnId>,
        channel_id: ChannelId,
        delivery_ids: Vec<DeliveryId>,
        reply: Reply<Result<(), QueueOpError>>,
    },
    Reject {
        channel_id: ChannelId,
        delivery_ids: Vec<DeliveryId>,
        requeue: bool,
        reply: Reply<Result<(), QueueOpError>>,
    },
    Requeue {
        channel_id: ChannelId,
        delivery_ids: Vec<DeliveryId>,
        reply: Reply<Result<(), QueueOpError>>,
    },
    Redeliver {
        messages: Vec<Message>,
    },
    Commit {
        txn: TxnId,
        reply: Reply<Result<(), QueueOpError>>,
    },
    Rollback {
        txn: TxnId,
    },
    Delete {
        if_unused: bool,
        if_empty: bool,
        reply: Reply<Result<u64, QueueOpError>>,
    },
    Purge {
        reply: Reply<u64>,
    },
    NotifyChannelDown {
        channel_id: ChannelId,
    },
    NotifyOwnerDown,
    /// Explicit unblock signal from a channel's Limiter (§4.2.1
    /// `notify-sent`), fire-and-forget like ack/reject/requeue.
    NotifySent {
        channel_id: ChannelId,
    },
    /// Supervisor-initiated shutdown (§2 "Supervisor: ... calls terminate
    /// on shutdown"), distinct from the state machine's internal
    /// `terminating` transitions triggered by protocol operations.
    Terminate {
        reply: Reply<()>,
    },
}
