//! SQLite write-ahead log. Mirrors `fc-queue`'s `SqliteQueue`: one table,
//! plain `sqlx::query` calls, no ORM layer.
//!
//! Transactional items are written with their `txn_id` set (pending) and
//! only take effect once `commit_transaction` clears it; `rollback_transaction`
//! just deletes the pending rows.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Pool, Row, Sqlite};
use tracing::{debug, warn};

use bq_common::{PersistItem, Persister, TxnScope};

pub struct SqlitePersister {
    pool: Pool<Sqlite>,
}

impl SqlitePersister {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    pub async fn init_schema(&self) -> crate::error::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS wal_entries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                queue_name TEXT NOT NULL,
                persist_key TEXT NOT NULL,
                kind TEXT NOT NULL,
                payload BLOB,
                txn_id TEXT,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_wal_committed_publish
            ON wal_entries (queue_name, persist_key)
            WHERE txn_id IS NULL AND kind = 'publish'
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn apply_publish(&self, queue: &str, key: &str, payload: &[u8], txn_id: Option<&str>) -> crate::error::Result<()> {
        sqlx::query(
            "INSERT INTO wal_entries (queue_name, persist_key, kind, payload, txn_id, created_at) \
             VALUES (?, ?, 'publish', ?, ?, ?)",
        )
        .bind(queue)
        .bind(key)
        .bind(payload)
        .bind(txn_id)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn apply_ack(&self, queue: &str, key: &str, txn_id: Option<&str>) -> crate::error::Result<()> {
        match txn_id {
            None => {
                sqlx::query(
                    "DELETE FROM wal_entries WHERE queue_name = ? AND persist_key = ? AND kind = 'publish' AND txn_id IS NULL",
                )
                .bind(queue)
                .bind(key)
                .execute(&self.pool)
                .await?;
            }
            Some(txn) => {
                sqlx::query(
                    "INSERT INTO wal_entries (queue_name, persist_key, kind, payload, txn_id, created_at) \
                     VALUES (?, ?, 'ack', NULL, ?, ?)",
                )
                .bind(queue)
                .bind(key)
                .bind(txn)
                .bind(Utc::now().timestamp())
                .execute(&self.pool)
                .await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Persister for SqlitePersister {
    async fn dirty_work(&self, items: Vec<PersistItem>) {
        for item in items {
            let result = match item {
                PersistItem::Publish { message, queue, key } => {
                    self.apply_publish(&queue, &key.0, &message.payload, None).await
                }
                PersistItem::Ack { queue, key } => self.apply_ack(&queue, &key.0, None).await,
                PersistItem::Deliver { queue, key } => {
                    debug!(queue = %queue, key = %key.0, "delivery recorded, no durable effect");
                    Ok(())
                }
            };
            if let Err(err) = result {
                warn!(error = %err, "failed to persist non-transactional WAL item");
            }
        }
    }

    async fn extend_transaction(&self, scope: TxnScope, items: Vec<PersistItem>) {
        for item in items {
            let result = match item {
                PersistItem::Publish { message, queue, key } => {
                    self.apply_publish(&queue, &key.0, &message.payload, Some(&scope.txn_id.0)).await
                }
                PersistItem::Ack { queue, key } => self.apply_ack(&queue, &key.0, Some(&scope.txn_id.0)).await,
                PersistItem::Deliver { .. } => Ok(()),
            };
            if let Err(err) = result {
                warn!(error = %err, txn = %scope.txn_id, "failed to stage transactional WAL item");
            }
        }
    }

    async fn commit_transaction(&self, scope: TxnScope) -> Result<(), String> {
        let mut tx = self.pool.begin().await.map_err(|e| e.to_string())?;

        sqlx::query("UPDATE wal_entries SET txn_id = NULL WHERE txn_id = ? AND kind = 'publish'")
            .bind(&scope.txn_id.0)
            .execute(&mut *tx)
            .await
            .map_err(|e| e.to_string())?;

        let acked_keys = sqlx::query("SELECT persist_key FROM wal_entries WHERE txn_id = ? AND kind = 'ack'")
            .bind(&scope.txn_id.0)
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| e.to_string())?;

        for row in acked_keys {
            let key: String = row.get("persist_key");
            sqlx::query(
                "DELETE FROM wal_entries WHERE queue_name = ? AND persist_key = ? AND kind = 'publish' AND txn_id IS NULL",
            )
            .bind(&scope.queue_name)
            .bind(&key)
            .execute(&mut *tx)
            .await
            .map_err(|e| e.to_string())?;
        }

        sqlx::query("DELETE FROM wal_entries WHERE txn_id = ? AND kind = 'ack'")
            .bind(&scope.txn_id.0)
            .execute(&mut *tx)
            .await
            .map_err(|e| e.to_string())?;

        tx.commit().await.map_err(|e| e.to_string())?;
        debug!(txn = %scope.txn_id, queue = %scope.queue_name, "transaction committed to WAL");
        Ok(())
    }

    async fn rollback_transaction(&self, scope: TxnScope) {
        if let Err(err) = sqlx::query("DELETE FROM wal_entries WHERE txn_id = ?")
            .bind(&scope.txn_id.0)
            .execute(&self.pool)
            .await
        {
            warn!(error = %err, txn = %scope.txn_id, "failed to discard rolled-back WAL rows");
        }
    }
}
