//! Transaction log, collocated with the triple store for atomicity.
//!
//! Every transaction (local or remote) is recorded here with its status;
//! the log drives replay of unsynced work after restart and rollback on
//! server rejection.

use sqlx::sqlite::SqlitePool;
use sqlx::{Row, SqliteConnection};
use tracing::{debug, warn};

use crate::domain::{is_valid_entity_id, Transaction, TxStatus};
use crate::error::Result;

/// Log of transaction records inside the store's database file.
#[derive(Debug, Clone)]
pub struct TransactionLog {
    pool: SqlitePool,
}

impl TransactionLog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the backing table. Safe to call multiple times.
    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS transactions (
                id TEXT PRIMARY KEY,
                timestamp INTEGER NOT NULL,
                status TEXT NOT NULL CHECK(status IN ('pending','committed','synced','failed')),
                synced INTEGER NOT NULL DEFAULT 0,
                serialized TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_transactions_timestamp ON transactions(timestamp)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// True when the transaction id is already recorded. Runs inside the
    /// caller's database transaction so the apply path stays atomic.
    pub async fn exists(&self, conn: &mut SqliteConnection, tx_id: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM transactions WHERE id = ?")
            .bind(tx_id)
            .fetch_optional(&mut *conn)
            .await?;
        Ok(row.is_some())
    }

    /// Record a transaction with the given status, inside the caller's
    /// database transaction.
    pub async fn record(
        &self,
        conn: &mut SqliteConnection,
        tx: &Transaction,
        status: TxStatus,
    ) -> Result<()> {
        let serialized = serde_json::to_string(tx)?;
        sqlx::query(
            r#"
            INSERT INTO transactions (id, timestamp, status, synced, serialized)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&tx.id)
        .bind(tx.timestamp_ms)
        .bind(status.as_str())
        .bind(status == TxStatus::Synced)
        .bind(serialized)
        .execute(&mut *conn)
        .await?;

        debug!(tx_id = %tx.id, status = %status, ops = tx.operations.len(), "recorded transaction");
        Ok(())
    }

    /// Point lookup; the `status` column is authoritative over the
    /// serialized payload.
    pub async fn get(&self, tx_id: &str) -> Result<Option<Transaction>> {
        let row = sqlx::query("SELECT status, serialized FROM transactions WHERE id = ?")
            .bind(tx_id)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let status: String = row.get("status");
        let serialized: String = row.get("serialized");
        let mut tx: Transaction = serde_json::from_str(&serialized)?;
        if let Some(status) = TxStatus::parse(&status) {
            tx.status = status;
        }
        Ok(Some(tx))
    }

    /// Current status of a transaction, if recorded.
    pub async fn status(&self, tx_id: &str) -> Result<Option<TxStatus>> {
        let row = sqlx::query("SELECT status FROM transactions WHERE id = ?")
            .bind(tx_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.and_then(|r| TxStatus::parse(&r.get::<String, _>("status"))))
    }

    /// Update the status columns. Inside a DB transaction when the caller
    /// provides one; standalone otherwise via [`set_status`].
    pub async fn set_status_in(
        &self,
        conn: &mut SqliteConnection,
        tx_id: &str,
        status: TxStatus,
    ) -> Result<()> {
        sqlx::query("UPDATE transactions SET status = ?, synced = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(status == TxStatus::Synced)
            .bind(tx_id)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    pub async fn set_status(&self, tx_id: &str, status: TxStatus) -> Result<()> {
        sqlx::query("UPDATE transactions SET status = ?, synced = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(status == TxStatus::Synced)
            .bind(tx_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// All non-synced, non-failed transactions in timestamp order.
    ///
    /// Records whose payload no longer deserializes are marked failed and
    /// excluded so they are never replayed.
    pub async fn pending(&self) -> Result<Vec<Transaction>> {
        let rows = sqlx::query(
            r#"
            SELECT id, status, serialized
            FROM transactions
            WHERE status IN ('pending', 'committed')
            ORDER BY timestamp ASC, id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        let mut corrupted: Vec<String> = Vec::new();

        for row in rows {
            let id: String = row.get("id");
            let status: String = row.get("status");
            let serialized: String = row.get("serialized");

            match serde_json::from_str::<Transaction>(&serialized) {
                Ok(mut tx) => {
                    let unparseable_id = tx
                        .operations
                        .iter()
                        .flat_map(|op| op.referenced_ids())
                        .find(|id| !is_valid_entity_id(id));
                    if let Some(bad) = unparseable_id {
                        warn!(tx_id = %id, entity_id = %bad, "unparseable entity id in record, marking failed");
                        corrupted.push(id);
                        continue;
                    }
                    if let Some(status) = TxStatus::parse(&status) {
                        tx.status = status;
                    }
                    out.push(tx);
                }
                Err(e) => {
                    warn!(tx_id = %id, error = %e, "corrupted transaction record, marking failed");
                    corrupted.push(id);
                }
            }
        }

        for id in corrupted {
            self.set_status(&id, TxStatus::Failed).await?;
        }

        Ok(out)
    }
}
