//! Starts, restarts and terminates `QueueProcess`es (§2 "Supervisor").
//!
//! Mirrors the registry shape of `fc-router`'s `QueueManager`/`ProcessPool`
//! pairing: a `DashMap` keyed by name holding live handles, with start-or-
//! reuse semantics so callers never have to coordinate who declares a
//! queue first.

use std::sync::Arc;

use bq_common::{BrokerError, Persister, QueueConfig};
use dashmap::DashMap;
use tracing::{info, warn};

use crate::process::{QueueHandle, QueueProcess};
use crate::record::QueueDescriptor;

/// Registry of live `QueueProcess`es, one per declared queue name.
pub struct Supervisor {
    persister: Arc<dyn Persister>,
    config: QueueConfig,
    queues: DashMap<String, QueueHandle>,
}

impl Supervisor {
    pub fn new(persister: Arc<dyn Persister>, config: QueueConfig) -> Self {
        Self {
            persister,
            config,
            queues: DashMap::new(),
        }
    }

    /// Returns the existing process for `descriptor.name`, or spawns a
    /// fresh one (§3 "Lifecycle": created on first successful declare).
    pub fn declare(&self, descriptor: QueueDescriptor) -> QueueHandle {
        if let Some(existing) = self.queues.get(&descriptor.name) {
            if !existing.is_dead() {
                return existing.clone();
            }
            warn!(queue = %descriptor.name, "queue process found dead, restarting");
        }
        let name = descriptor.name.clone();
        let handle = QueueProcess::spawn(descriptor, self.persister.clone(), self.config);
        info!(queue = %name, "queue process started");
        self.queues.insert(name, handle.clone());
        handle
    }

    pub fn get(&self, name: &str) -> Option<QueueHandle> {
        self.queues.get(name).map(|h| h.clone())
    }

    /// Terminates one queue and removes it from the registry (§2
    /// "calls terminate on shutdown", §4.1.5 `delete`).
    pub async fn terminate(&self, name: &str) -> Result<(), BrokerError> {
        let Some((_, handle)) = self.queues.remove(name) else {
            return Ok(());
        };
        handle.terminate().await
    }

    /// Terminates every running queue, used for process-wide shutdown.
    pub async fn terminate_all(&self) {
        let names: Vec<String> = self.queues.iter().map(|e| e.key().clone()).collect();
        for name in names {
            if let Err(err) = self.terminate(&name).await {
                warn!(queue = %name, error = %err, "error terminating queue during shutdown");
            }
        }
    }

    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }
}
