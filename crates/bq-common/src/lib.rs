//! Shared types for the broker-queue workspace: ids, the `Message` type,
//! the Channel/Limiter/Persister collaborator traits, the §7 error
//! taxonomy, queue configuration and structured logging setup.

pub mod collaborators;
pub mod config;
pub mod error;
pub mod ids;
pub mod logging;
pub mod message;

pub use collaborators::{Channel, Delivery, Limiter, PersistItem, Persister, TxnScope};
pub use config::QueueConfig;
pub use error::{BrokerError, QueueOpError, Result};
pub use ids::{ChannelId, ChannelIdGenerator, ConsumerTag, DeliveryId, DeliveryIdGenerator, TxnId};
pub use message::{Message, PersistenceKey};
