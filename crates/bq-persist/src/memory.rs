//! Non-durable `Persister` for tests and the dev binary's default mode.
//! Keeps pending transactional items in a side table keyed by `TxnScope`
//! and folds them into the committed log on commit.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use bq_common::{PersistItem, Persister, TxnScope};

#[derive(Default)]
pub struct MemoryPersister {
    committed: Mutex<Vec<PersistItem>>,
    pending: Mutex<HashMap<TxnScope, Vec<PersistItem>>>,
}

impl MemoryPersister {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything durably committed so far, oldest first.
    pub fn committed_items(&self) -> Vec<PersistItem> {
        self.committed.lock().clone()
    }
}

#[async_trait]
impl Persister for MemoryPersister {
    async fn dirty_work(&self, items: Vec<PersistItem>) {
        self.committed.lock().extend(items);
    }

    async fn extend_transaction(&self, scope: TxnScope, items: Vec<PersistItem>) {
        self.pending.lock().entry(scope).or_default().extend(items);
    }

    async fn commit_transaction(&self, scope: TxnScope) -> Result<(), String> {
        if let Some(items) = self.pending.lock().remove(&scope) {
            self.committed.lock().extend(items);
        }
        Ok(())
    }

    async fn rollback_transaction(&self, scope: TxnScope) {
        self.pending.lock().remove(&scope);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bq_common::{Message, PersistenceKey, TxnId};

    fn item(payload: &str, key: &str) -> PersistItem {
        PersistItem::Publish {
            message: Message::persistent(payload, key),
            queue: "q".to_string(),
            key: PersistenceKey(key.to_string()),
        }
    }

    #[tokio::test]
    async fn committed_items_are_visible_immediately() {
        let persister = MemoryPersister::new();
        persister.dirty_work(vec![item("m1", "k1")]).await;
        assert_eq!(persister.committed_items().len(), 1);
    }

    #[tokio::test]
    async fn pending_items_only_surface_after_commit() {
        let persister = MemoryPersister::new();
        let scope = TxnScope { txn_id: TxnId("t1".to_string()), queue_name: "q".to_string() };

        persister.extend_transaction(scope.clone(), vec![item("m1", "k1")]).await;
        assert!(persister.committed_items().is_empty());

        persister.commit_transaction(scope).await.unwrap();
        assert_eq!(persister.committed_items().len(), 1);
    }

    #[tokio::test]
    async fn rollback_discards_pending_items() {
        let persister = MemoryPersister::new();
        let scope = TxnScope { txn_id: TxnId("t1".to_string()), queue_name: "q".to_string() };

        persister.extend_transaction(scope.clone(), vec![item("m1", "k1")]).await;
        persister.rollback_transaction(scope).await;

        assert!(persister.committed_items().is_empty());
    }
}
