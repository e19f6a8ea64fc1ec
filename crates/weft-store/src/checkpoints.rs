//! Perspective checkpoints: how far each read model has replayed.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::{classify_db_error, StoreError};

/// One row of the checkpoint table.
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    /// Perspective the checkpoint belongs to.
    pub perspective_name: String,
    /// Highest event `seq_id` the perspective has applied.
    pub last_seq_id: i64,
    /// When the checkpoint last advanced.
    pub last_updated_at: DateTime<Utc>,
}

/// Reads and advances perspective checkpoints.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    pool: SqlitePool,
}

impl CheckpointStore {
    /// Build a checkpoint store over `pool`.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// The last applied `seq_id` for `perspective_name`; 0 when the
    /// perspective has never checkpointed.
    pub async fn load(&self, perspective_name: &str) -> Result<i64, StoreError> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT last_seq_id FROM perspective_checkpoints WHERE perspective_name = ?",
        )
        .bind(perspective_name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.0).unwrap_or(0))
    }

    /// Advance the checkpoint to `seq_id`. Monotone: a smaller or equal
    /// value than the stored one is ignored.
    pub async fn advance(&self, perspective_name: &str, seq_id: i64) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO perspective_checkpoints (perspective_name, last_seq_id, last_updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT (perspective_name) DO UPDATE SET
                last_seq_id = excluded.last_seq_id,
                last_updated_at = excluded.last_updated_at
            WHERE excluded.last_seq_id > perspective_checkpoints.last_seq_id
            "#,
        )
        .bind(perspective_name)
        .bind(seq_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(classify_db_error)?;
        Ok(())
    }

    /// Every checkpoint, for operator inspection.
    pub async fn all(&self) -> Result<Vec<Checkpoint>, StoreError> {
        let rows: Vec<(String, i64, DateTime<Utc>)> = sqlx::query_as(
            "SELECT perspective_name, last_seq_id, last_updated_at \
             FROM perspective_checkpoints ORDER BY perspective_name ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(perspective_name, last_seq_id, last_updated_at)| Checkpoint {
                perspective_name,
                last_seq_id,
                last_updated_at,
            })
            .collect())
    }
}
