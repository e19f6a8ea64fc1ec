//! Operator surface over the durable tables.
//!
//! Failed rows stay in place with their error and failure reason so an
//! operator can inspect them and decide; retrying clears the lease and puts
//! the row back on the pending pool. None of this runs inside the batch
//! protocol; it is the manual path beside it.

use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use tracing::info;

use weft_types::{FailureReason, MessageId, StatusFlags};

use crate::{classify_db_error, StoreError};

/// Which durable table an admin operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkTable {
    /// The outbound publish table.
    Outbox,
    /// The inbound dispatch table.
    Inbox,
}

impl WorkTable {
    fn name(&self) -> &'static str {
        match self {
            Self::Outbox => "outbox",
            Self::Inbox => "inbox",
        }
    }

    fn created_column(&self) -> &'static str {
        match self {
            Self::Outbox => "created_at",
            Self::Inbox => "received_at",
        }
    }
}

/// One failed row, as shown to an operator.
#[derive(Debug, Clone, PartialEq)]
pub struct FailedMessage {
    /// Row identifier.
    pub message_id: MessageId,
    /// Payload type tag.
    pub type_tag: String,
    /// Milestones the row reached before failing.
    pub status_flags: StatusFlags,
    /// Attempts so far.
    pub attempts: i64,
    /// Recorded error text.
    pub error: Option<String>,
    /// Classified failure cause.
    pub failure_reason: FailureReason,
    /// When the row was first stored.
    pub created_at: DateTime<Utc>,
}

/// Backlog figures for one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingStats {
    /// Rows waiting to be claimed or in flight.
    pub pending: i64,
    /// Age in seconds of the oldest such row; 0 when none are pending.
    pub oldest_age_seconds: i64,
}

/// Inspect-and-retry operations for operators.
#[derive(Debug, Clone)]
pub struct AdminStore {
    pool: SqlitePool,
}

impl AdminStore {
    /// Build an admin handle over `pool`.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Failed rows of `table`, oldest first, up to `limit`.
    pub async fn failed_messages(
        &self,
        table: WorkTable,
        limit: i64,
    ) -> Result<Vec<FailedMessage>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT message_id, type, status_flags, attempts, error, failure_reason, {created} \
             FROM {table} WHERE status = 'Failed' ORDER BY {created} ASC LIMIT ?",
            created = table.created_column(),
            table = table.name(),
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let message_id: String = row.get("message_id");
                Ok(FailedMessage {
                    message_id: message_id.parse().map_err(|_| {
                        StoreError::Fatal(format!("corrupt message id: {message_id:?}"))
                    })?,
                    type_tag: row.get("type"),
                    status_flags: StatusFlags(row.get::<i64, _>("status_flags") as u32),
                    attempts: row.get("attempts"),
                    error: row.get("error"),
                    failure_reason: FailureReason::from_i32(
                        row.get::<i64, _>("failure_reason") as i32
                    ),
                    created_at: row.get(table.created_column()),
                })
            })
            .collect()
    }

    /// Put one failed row back on the pending pool.
    ///
    /// Clears the lease and the backoff schedule; the next eligible cycle
    /// claims it like any other pending row. Returns whether a row changed.
    pub async fn retry_message(
        &self,
        table: WorkTable,
        message_id: MessageId,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(&format!(
            "UPDATE {} SET status = 'Pending', instance_id = NULL, lease_expiry = NULL, \
             scheduled_for = NULL, error = NULL \
             WHERE message_id = ? AND status = 'Failed'",
            table.name()
        ))
        .bind(message_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(classify_db_error)?;

        let retried = result.rows_affected() == 1;
        if retried {
            info!(%message_id, table = table.name(), "failed row returned to pending");
        }
        Ok(retried)
    }

    /// Put every failed row stored since `since` back on the pending pool.
    /// Returns how many rows changed.
    pub async fn retry_failed_since(
        &self,
        table: WorkTable,
        since: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(&format!(
            "UPDATE {table} SET status = 'Pending', instance_id = NULL, lease_expiry = NULL, \
             scheduled_for = NULL, error = NULL \
             WHERE status = 'Failed' AND {created} >= ?",
            table = table.name(),
            created = table.created_column(),
        ))
        .bind(since)
        .execute(&self.pool)
        .await
        .map_err(classify_db_error)?;

        if result.rows_affected() > 0 {
            info!(
                table = table.name(),
                count = result.rows_affected(),
                "failed rows returned to pending"
            );
        }
        Ok(result.rows_affected())
    }

    /// Backlog count and oldest-row age for `table`.
    pub async fn pending_stats(&self, table: WorkTable) -> Result<PendingStats, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT COUNT(*) AS pending, MIN({created}) AS oldest \
             FROM {table} WHERE status IN ('Pending', 'Publishing', 'Processing')",
            table = table.name(),
            created = table.created_column(),
        ))
        .fetch_one(&self.pool)
        .await?;

        let pending: i64 = row.get("pending");
        let oldest: Option<DateTime<Utc>> = row.get("oldest");
        let oldest_age_seconds = oldest
            .map(|t| Utc::now().signed_duration_since(t).num_seconds().max(0))
            .unwrap_or(0);
        Ok(PendingStats {
            pending,
            oldest_age_seconds,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CoordinatorConfig, WeftStore};
    use weft_types::{
        InstanceDescriptor, InstanceId, NewInboxMessage, WorkBatchRequest, WorkFailure,
    };

    fn descriptor() -> InstanceDescriptor {
        InstanceDescriptor {
            instance_id: InstanceId::generate(),
            service_name: "svc".into(),
            host_name: "host".into(),
            process_id: 1,
            metadata: None,
        }
    }

    async fn store_with_failed_row() -> (WeftStore, MessageId) {
        let store = WeftStore::in_memory().await.unwrap();
        let coordinator = store.coordinator(CoordinatorConfig::default());
        let instance = descriptor();

        let message_id = MessageId::generate();
        let mut first = WorkBatchRequest::empty(instance.clone());
        first.new_inbox.push(NewInboxMessage {
            message_id,
            handler_name: "h".into(),
            type_tag: "E".into(),
            payload: vec![1],
            metadata: None,
            scope: None,
            stream_id: None,
            is_event: false,
        });
        coordinator.process_work_batch(&first).await.unwrap();

        let mut second = WorkBatchRequest::empty(instance);
        second.inbox_failures.push(WorkFailure {
            message_id,
            reached: StatusFlags::STORED,
            reason: FailureReason::ValidationFailed,
            error: "rejected".into(),
        });
        coordinator.process_work_batch(&second).await.unwrap();
        (store, message_id)
    }

    #[tokio::test]
    async fn failed_rows_are_listed_with_their_reason() {
        let (store, message_id) = store_with_failed_row().await;
        let admin = AdminStore::new(store.pool().clone());

        let failed = admin.failed_messages(WorkTable::Inbox, 10).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].message_id, message_id);
        assert_eq!(failed[0].failure_reason, FailureReason::ValidationFailed);
        assert_eq!(failed[0].error.as_deref(), Some("rejected"));
        assert_eq!(failed[0].attempts, 1);
    }

    #[tokio::test]
    async fn retry_clears_the_lease_and_requeues() {
        let (store, message_id) = store_with_failed_row().await;
        let admin = AdminStore::new(store.pool().clone());

        assert!(admin.retry_message(WorkTable::Inbox, message_id).await.unwrap());
        // Idempotent: the row is no longer Failed.
        assert!(!admin.retry_message(WorkTable::Inbox, message_id).await.unwrap());

        // The row is claimable again.
        let coordinator = store.coordinator(CoordinatorConfig::default());
        let result = coordinator
            .process_work_batch(&WorkBatchRequest::empty(descriptor()))
            .await
            .unwrap();
        assert_eq!(result.inbox_work.len(), 1);
        assert_eq!(result.inbox_work[0].message_id, message_id);
    }

    #[tokio::test]
    async fn retry_since_sweeps_a_window() {
        let (store, _message_id) = store_with_failed_row().await;
        let admin = AdminStore::new(store.pool().clone());

        let long_ago = Utc::now() - chrono::Duration::hours(1);
        let retried = admin
            .retry_failed_since(WorkTable::Inbox, long_ago)
            .await
            .unwrap();
        assert_eq!(retried, 1);
        assert!(admin
            .failed_messages(WorkTable::Inbox, 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn pending_stats_count_the_backlog() {
        let (store, _message_id) = store_with_failed_row().await;
        let admin = AdminStore::new(store.pool().clone());

        // The failed row is not pending.
        let stats = admin.pending_stats(WorkTable::Inbox).await.unwrap();
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.oldest_age_seconds, 0);

        admin
            .retry_failed_since(WorkTable::Inbox, Utc::now() - chrono::Duration::hours(1))
            .await
            .unwrap();
        let stats = admin.pending_stats(WorkTable::Inbox).await.unwrap();
        assert_eq!(stats.pending, 1);
    }
}
