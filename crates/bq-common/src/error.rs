use thiserror::Error;

/// The error taxonomy a `QueueProcess` returns to a caller for
/// operations classified as operational failures in §7: bad client input,
/// reported synchronously, leaving queue state untouched.
///
/// `channel-died` and `owner-died` from the spec's taxonomy are not
/// represented here — they are recovered or handled as end-of-life
/// transitions internally and never surface to a caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueOpError {
    #[error("queue is owned by another connection")]
    QueueOwnedByAnotherConnection,

    #[error("exclusive consume unavailable")]
    ExclusiveConsumeUnavailable,

    #[error("queue is not empty")]
    NotEmpty,

    #[error("queue is in use")]
    InUse,

    #[error("queue is locked by another claimant")]
    Locked,

    #[error("unknown delivery tag: {0}")]
    UnknownDeliveryTag(u64),

    #[error("persister commit failed: {0}")]
    PersisterCommitFailure(String),

    #[error("queue process is terminating")]
    Terminating,
}

/// Cross-cutting errors for the ambient stack (persistence wiring,
/// configuration, supervisor glue) that sit above a single queue
/// operation.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error(transparent)]
    Queue(#[from] QueueOpError),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("queue process mailbox closed")]
    MailboxClosed,
}

pub type Result<T> = std::result::Result<T, BrokerError>;
