//! The per-queue dispatch core: `QueueProcess`, its mailbox command set,
//! channel/consumer bookkeeping, transaction tracking, flow control, and
//! the `Supervisor` that starts/restarts/terminates queue processes.

mod command;
mod consumer_queue;
mod metrics;
mod process;
mod record;
mod state;
mod supervisor;

pub use bq_common::{
    BrokerError, Channel, ChannelId, ConsumerTag, Delivery, DeliveryId, Limiter, Message,
    PersistItem, Persister, QueueConfig, QueueOpError, TxnId, TxnScope,
};
pub use command::{GetResult, RouteOutcome};
pub use process::{LivenessToken, QueueHandle, QueueProcess};
pub use record::QueueDescriptor;
pub use supervisor::Supervisor;
