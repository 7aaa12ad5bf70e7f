use bytes::Bytes;

/// Opaque identifier tying a durable message to persister records. The
/// queue never interprets it; it only threads it through to the
/// [`crate::Persister`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PersistenceKey(pub String);

/// A message flowing through a queue. Payload framing, headers and routing
/// metadata are the wire codec's concern (out of scope here); the core only
/// needs an id for logging and an optional persistence key.
#[derive(Debug, Clone)]
pub struct Message {
    pub id: uuid::Uuid,
    pub payload: Bytes,
    pub persistence_key: Option<PersistenceKey>,
}

impl Message {
    /// A transient (non-persistent) message.
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            payload: payload.into(),
            persistence_key: None,
        }
    }

    /// A message carrying a persistence key, so publish/ack/delivery are
    /// recorded with the [`crate::Persister`] per the queue's persist
    /// policy.
    pub fn persistent(payload: impl Into<Bytes>, key: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            payload: payload.into(),
            persistence_key: Some(PersistenceKey(key.into())),
        }
    }

    pub fn is_persistent(&self) -> bool {
        self.persistence_key.is_some()
    }
}
