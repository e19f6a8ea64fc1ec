//! Append-only per-stream event log with optimistic concurrency.
//!
//! Versions within a stream are contiguous from 1 and unique; the global
//! `seq_id` orders records across all streams for perspective replay.

use chrono::Utc;
use sqlx::{Row, SqlitePool};

use weft_types::{EventRecord, NewEvent, StreamId};

use crate::{classify_db_error, is_unique_violation, StoreError};

/// The append-only event log.
#[derive(Debug, Clone)]
pub struct EventStore {
    pool: SqlitePool,
}

impl EventStore {
    /// Build an event store over `pool`.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Append `event` to `stream_id`, returning the new version.
    ///
    /// When `expected_prior_version` is given and does not equal the stream's
    /// current maximum version, nothing is written and
    /// [`StoreError::OptimisticConcurrency`] is returned. The same error is
    /// returned when a concurrent writer takes the version first.
    pub async fn append(
        &self,
        stream_id: StreamId,
        expected_prior_version: Option<i64>,
        event: NewEvent,
    ) -> Result<i64, StoreError> {
        let mut tx = self.pool.begin().await.map_err(classify_db_error)?;
        let stream = stream_id.to_string();

        let current: (i64,) = sqlx::query_as(
            "SELECT COALESCE(MAX(version), 0) FROM event_store WHERE stream_id = ?",
        )
        .bind(&stream)
        .fetch_one(&mut *tx)
        .await
        .map_err(classify_db_error)?;

        if let Some(expected) = expected_prior_version {
            if expected != current.0 {
                return Err(StoreError::OptimisticConcurrency { stream_id });
            }
        }

        let version = current.0 + 1;
        let inserted = sqlx::query(
            r#"
            INSERT INTO event_store (event_id, stream_id, version, type, payload, metadata, scope, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(event.event_id.to_string())
        .bind(&stream)
        .bind(version)
        .bind(&event.type_tag)
        .bind(&event.payload)
        .bind(event.metadata.as_ref().map(|m| m.to_string()))
        .bind(&event.scope)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {
                tx.commit().await.map_err(classify_db_error)?;
                Ok(version)
            }
            Err(error) if is_unique_violation(&error) => {
                Err(StoreError::OptimisticConcurrency { stream_id })
            }
            Err(error) => Err(classify_db_error(error)),
        }
    }

    /// The current maximum version of `stream_id`; 0 for an empty stream.
    pub async fn stream_version(&self, stream_id: StreamId) -> Result<i64, StoreError> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COALESCE(MAX(version), 0) FROM event_store WHERE stream_id = ?",
        )
        .bind(stream_id.to_string())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    /// Read `stream_id` ordered by version, from `from_version` inclusive
    /// up to `to_version` inclusive when given.
    pub async fn read_stream(
        &self,
        stream_id: StreamId,
        from_version: i64,
        to_version: Option<i64>,
    ) -> Result<Vec<EventRecord>, StoreError> {
        let upper = to_version.unwrap_or(i64::MAX);
        let rows = sqlx::query(
            r#"
            SELECT seq_id, event_id, stream_id, version, type, payload, metadata, scope, created_at
            FROM event_store
            WHERE stream_id = ? AND version >= ? AND version <= ?
            ORDER BY version ASC
            "#,
        )
        .bind(stream_id.to_string())
        .bind(from_version)
        .bind(upper)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_record).collect()
    }

    /// Read records with `seq_id > after_seq_id` in global order, filtered to
    /// `types` when non-empty, up to `limit` records.
    pub async fn read_since(
        &self,
        after_seq_id: i64,
        types: &[String],
        limit: i64,
    ) -> Result<Vec<EventRecord>, StoreError> {
        let rows = if types.is_empty() {
            sqlx::query(
                r#"
                SELECT seq_id, event_id, stream_id, version, type, payload, metadata, scope, created_at
                FROM event_store
                WHERE seq_id > ?
                ORDER BY seq_id ASC
                LIMIT ?
                "#,
            )
            .bind(after_seq_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        } else {
            let placeholders = vec!["?"; types.len()].join(", ");
            let sql = format!(
                r#"
                SELECT seq_id, event_id, stream_id, version, type, payload, metadata, scope, created_at
                FROM event_store
                WHERE seq_id > ? AND type IN ({placeholders})
                ORDER BY seq_id ASC
                LIMIT ?
                "#,
            );
            let mut query = sqlx::query(&sql).bind(after_seq_id);
            for type_tag in types {
                query = query.bind(type_tag);
            }
            query.bind(limit).fetch_all(&self.pool).await?
        };

        rows.into_iter().map(row_to_record).collect()
    }
}

fn row_to_record(row: sqlx::sqlite::SqliteRow) -> Result<EventRecord, StoreError> {
    let event_id: String = row.get("event_id");
    let stream_id: String = row.get("stream_id");
    let metadata: Option<String> = row.get("metadata");
    Ok(EventRecord {
        seq_id: row.get("seq_id"),
        event_id: event_id
            .parse()
            .map_err(|_| StoreError::Fatal(format!("corrupt event id: {event_id:?}")))?,
        stream_id: stream_id
            .parse()
            .map_err(|_| StoreError::Fatal(format!("corrupt stream id: {stream_id:?}")))?,
        version: row.get("version"),
        type_tag: row.get("type"),
        payload: row.get("payload"),
        metadata: metadata
            .map(|text| {
                serde_json::from_str(&text)
                    .map_err(|e| StoreError::Fatal(format!("corrupt event metadata: {e}")))
            })
            .transpose()?,
        scope: row.get("scope"),
        created_at: row.get("created_at"),
    })
}
