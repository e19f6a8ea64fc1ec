//! The work coordinator: one transactional batch operation per polling cycle.
//!
//! Every instance calls [`WorkCoordinator::process_work_batch`] on each cycle.
//! The call records completions and failures from the previous cycle, stores
//! newly produced messages, appends completed events to the event store,
//! refreshes the instance heartbeat, and leases a bounded batch of claimable
//! work back to the caller. All of it happens in a single database
//! transaction: either every effect lands or none does.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tracing::{debug, warn};

use weft_types::{
    FailureReason, InboxWorkItem, InstanceDescriptor, MessageId, NewInboxMessage,
    NewOutboxMessage, OutboxWorkItem, StatusFlags, StreamId, WorkBatchRequest, WorkBatchResult,
    WorkCompletion, WorkFailure, WorkItemFlags, DEFAULT_PARTITION_COUNT,
};

use crate::partitions::partition_for;
use crate::{classify_db_error, is_unique_violation, StoreError};

//─────────────────────────────
//  Configuration
//─────────────────────────────

/// Tuning knobs for the batch protocol.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Maximum outbox rows leased per call.
    pub outbox_batch_size: i64,
    /// Maximum inbox rows leased per call.
    pub inbox_batch_size: i64,
    /// Base delay of the transient-failure backoff curve.
    pub backoff_base: Duration,
    /// Upper bound of the backoff curve.
    pub backoff_cap: Duration,
    /// Fleet-wide partition count; fixed at startup.
    pub partition_count: i64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            outbox_batch_size: 100,
            inbox_batch_size: 100,
            backoff_base: Duration::from_secs(5),
            backoff_cap: Duration::from_secs(300),
            partition_count: DEFAULT_PARTITION_COUNT,
        }
    }
}

impl CoordinatorConfig {
    /// Backoff delay after `attempts` tries: `base * 2^attempts`, capped.
    pub fn backoff_delay(&self, attempts: i64) -> Duration {
        let shift = attempts.clamp(0, 16) as u32;
        let delay = self
            .backoff_base
            .saturating_mul(2u32.saturating_pow(shift));
        delay.min(self.backoff_cap)
    }
}

//─────────────────────────────
//  Internal row shapes
//─────────────────────────────

/// Which durable table a statement targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Outbox,
    Inbox,
}

impl Side {
    fn table(&self) -> &'static str {
        match self {
            Self::Outbox => "outbox",
            Self::Inbox => "inbox",
        }
    }

    /// Status string for a row claimed and in flight.
    fn claimed_status(&self) -> &'static str {
        match self {
            Self::Outbox => "Publishing",
            Self::Inbox => "Processing",
        }
    }

    /// Status string for a row that finished successfully.
    fn done_status(&self) -> &'static str {
        match self {
            Self::Outbox => "Published",
            Self::Inbox => "Completed",
        }
    }

    fn done_timestamp_column(&self) -> &'static str {
        match self {
            Self::Outbox => "published_at",
            Self::Inbox => "processed_at",
        }
    }

    /// Flag whose presence in a completion report marks the row done.
    fn done_flag(&self) -> StatusFlags {
        match self {
            Self::Outbox => StatusFlags::PUBLISHED,
            Self::Inbox => StatusFlags::RECEPTOR_PROCESSED,
        }
    }
}

/// An event append owed to the event store, ordered by `sequence_order`.
struct PendingAppend {
    side: Side,
    message_id: String,
    stream_id: StreamId,
    sequence_order: i64,
    type_tag: String,
    payload: Vec<u8>,
    metadata: Option<String>,
    scope: Option<String>,
}

//─────────────────────────────
//  Coordinator
//─────────────────────────────

/// Executes the batch protocol against the shared store.
#[derive(Debug, Clone)]
pub struct WorkCoordinator {
    pool: SqlitePool,
    config: CoordinatorConfig,
}

impl WorkCoordinator {
    /// Build a coordinator over `pool` with the given tuning.
    pub fn new(pool: SqlitePool, config: CoordinatorConfig) -> Self {
        Self { pool, config }
    }

    /// The coordinator's tuning knobs.
    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Run one full batch cycle for the calling instance.
    ///
    /// Executes as a single transaction; on any error every effect rolls
    /// back and the caller may retry the identical call. Lock contention is
    /// surfaced as [`StoreError::CoordinatorConflict`].
    pub async fn process_work_batch(
        &self,
        request: &WorkBatchRequest,
    ) -> Result<WorkBatchResult, StoreError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(classify_db_error)?;

        // 1. Heartbeat.
        self.upsert_instance(&mut tx, &request.instance, now).await?;

        // 2. Completions; event appends are collected and ordered below.
        let mut appends = Vec::new();
        for completion in &request.outbox_completions {
            self.apply_completion(&mut tx, Side::Outbox, completion, now, &mut appends)
                .await?;
        }
        for completion in &request.inbox_completions {
            self.apply_completion(&mut tx, Side::Inbox, completion, now, &mut appends)
                .await?;
        }

        // 3. Failures.
        for failure in &request.outbox_failures {
            self.apply_failure(&mut tx, Side::Outbox, failure, now).await?;
        }
        for failure in &request.inbox_failures {
            self.apply_failure(&mut tx, Side::Inbox, failure, now).await?;
        }

        // 5. Event-store side effects, in per-stream sequence order so that
        //    versions follow the stored order rather than wall clock.
        appends.sort_by(|a, b| {
            (a.stream_id, a.sequence_order).cmp(&(b.stream_id, b.sequence_order))
        });
        for append in appends {
            self.append_event(&mut tx, append, now).await?;
        }

        // 4 + 6. New stores (claimed immediately) and the claim sweep.
        let mut result = WorkBatchResult::default();
        for message in &request.new_outbox {
            if let Some(item) = self
                .store_new_outbox(&mut tx, message, request, now)
                .await?
            {
                result.outbox_work.push(item);
            }
        }
        for message in &request.new_inbox {
            if let Some(item) = self.store_new_inbox(&mut tx, message, request, now).await? {
                result.inbox_work.push(item);
            }
        }

        let outbox_capacity =
            (self.config.outbox_batch_size - result.outbox_work.len() as i64).max(0);
        let inbox_capacity =
            (self.config.inbox_batch_size - result.inbox_work.len() as i64).max(0);

        for row in self
            .claim_rows(&mut tx, Side::Outbox, request, now, outbox_capacity)
            .await?
        {
            result.outbox_work.push(row_to_outbox_item(row)?);
        }
        for row in self
            .claim_rows(&mut tx, Side::Inbox, request, now, inbox_capacity)
            .await?
        {
            result.inbox_work.push(row_to_inbox_item(row)?);
        }

        tx.commit().await.map_err(classify_db_error)?;

        debug!(
            instance_id = %request.instance.instance_id,
            outbox = result.outbox_work.len(),
            inbox = result.inbox_work.len(),
            "work batch processed"
        );
        Ok(result)
    }

    //───────────────────── heartbeat ─────────────────────

    async fn upsert_instance(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        instance: &InstanceDescriptor,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO service_instances
                (instance_id, service_name, host_name, process_id, started_at, last_heartbeat_at, metadata)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (instance_id) DO UPDATE SET
                last_heartbeat_at = excluded.last_heartbeat_at,
                metadata = excluded.metadata
            "#,
        )
        .bind(instance.instance_id.to_string())
        .bind(&instance.service_name)
        .bind(&instance.host_name)
        .bind(instance.process_id)
        .bind(now)
        .bind(now)
        .bind(instance.metadata.as_ref().map(|m| m.to_string()))
        .execute(&mut **tx)
        .await
        .map_err(classify_db_error)?;
        Ok(())
    }

    //───────────────────── completions ─────────────────────

    async fn apply_completion(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        side: Side,
        completion: &WorkCompletion,
        now: DateTime<Utc>,
        appends: &mut Vec<PendingAppend>,
    ) -> Result<(), StoreError> {
        let message_id = completion.message_id.to_string();
        let row = sqlx::query(&format!(
            "SELECT status_flags, is_event, stream_id, sequence_order, type, payload, metadata, scope \
             FROM {} WHERE message_id = ?",
            side.table()
        ))
        .bind(&message_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(classify_db_error)?;

        let Some(row) = row else {
            // A completion for a row this store never saw is a silent no-op.
            debug!(%message_id, table = side.table(), "completion for unknown message ignored");
            return Ok(());
        };

        let existing = StatusFlags(row.get::<i64, _>("status_flags") as u32);
        let merged = existing | completion.flags;
        let done = completion.flags.contains(side.done_flag());

        if done {
            sqlx::query(&format!(
                "UPDATE {} SET status = ?, status_flags = ?, {} = ?, instance_id = NULL, lease_expiry = NULL \
                 WHERE message_id = ?",
                side.table(),
                side.done_timestamp_column()
            ))
            .bind(side.done_status())
            .bind(merged.0 as i64)
            .bind(now)
            .bind(&message_id)
            .execute(&mut **tx)
            .await
            .map_err(classify_db_error)?;
        } else {
            sqlx::query(&format!(
                "UPDATE {} SET status_flags = ? WHERE message_id = ?",
                side.table()
            ))
            .bind(merged.0 as i64)
            .bind(&message_id)
            .execute(&mut **tx)
            .await
            .map_err(classify_db_error)?;
        }

        let is_event = row.get::<i64, _>("is_event") != 0;
        let stream_id: Option<String> = row.get("stream_id");
        if done && is_event && !existing.contains(StatusFlags::EVENT_STORED) {
            if let Some(stream_id) = stream_id {
                appends.push(PendingAppend {
                    side,
                    message_id,
                    stream_id: parse_id(&stream_id)?,
                    sequence_order: row.get::<Option<i64>, _>("sequence_order").unwrap_or(0),
                    type_tag: row.get("type"),
                    payload: row.get("payload"),
                    metadata: row.get("metadata"),
                    scope: row.get("scope"),
                });
            } else {
                warn!(%message_id, "event row has no stream id, nothing appended");
            }
        }
        Ok(())
    }

    //───────────────────── failures ─────────────────────

    async fn apply_failure(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        side: Side,
        failure: &WorkFailure,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let message_id = failure.message_id.to_string();
        let row = sqlx::query(&format!(
            "SELECT attempts, status_flags FROM {} WHERE message_id = ?",
            side.table()
        ))
        .bind(&message_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(classify_db_error)?;

        let Some(row) = row else {
            debug!(%message_id, table = side.table(), "failure for unknown message ignored");
            return Ok(());
        };

        let attempts: i64 = row.get("attempts");
        let existing = StatusFlags(row.get::<i64, _>("status_flags") as u32);
        let merged = existing | failure.reached | StatusFlags::FAILED;

        if failure.reason.is_transient() {
            // Back onto the pending pool after a backoff window. The owner
            // column is preserved for inspection; the lease is expired so the
            // next eligible cycle can reclaim the row.
            let retry_at = now + chrono::Duration::from_std(self.config.backoff_delay(attempts))
                .unwrap_or_else(|_| chrono::Duration::seconds(300));
            sqlx::query(&format!(
                "UPDATE {} SET status = 'Pending', status_flags = ?, attempts = attempts + 1, \
                 error = ?, failure_reason = ?, scheduled_for = ?, lease_expiry = ? \
                 WHERE message_id = ?",
                side.table()
            ))
            .bind(merged.0 as i64)
            .bind(&failure.error)
            .bind(failure.reason.as_i32())
            .bind(retry_at)
            .bind(now)
            .bind(&message_id)
            .execute(&mut **tx)
            .await
            .map_err(classify_db_error)?;
        } else {
            sqlx::query(&format!(
                "UPDATE {} SET status = 'Failed', status_flags = ?, attempts = attempts + 1, \
                 error = ?, failure_reason = ? \
                 WHERE message_id = ?",
                side.table()
            ))
            .bind(merged.0 as i64)
            .bind(&failure.error)
            .bind(failure.reason.as_i32())
            .bind(&message_id)
            .execute(&mut **tx)
            .await
            .map_err(classify_db_error)?;
        }

        warn!(
            %message_id,
            table = side.table(),
            reason = ?failure.reason,
            error = %failure.error,
            "work failure recorded"
        );
        Ok(())
    }

    //───────────────────── event appends ─────────────────────

    async fn append_event(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        append: PendingAppend,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let stream_id = append.stream_id.to_string();
        let current: (i64,) = sqlx::query_as(
            "SELECT COALESCE(MAX(version), 0) FROM event_store WHERE stream_id = ?",
        )
        .bind(&stream_id)
        .fetch_one(&mut **tx)
        .await
        .map_err(classify_db_error)?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO event_store (event_id, stream_id, version, type, payload, metadata, scope, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&append.message_id)
        .bind(&stream_id)
        .bind(current.0 + 1)
        .bind(&append.type_tag)
        .bind(&append.payload)
        .bind(&append.metadata)
        .bind(&append.scope)
        .bind(now)
        .execute(&mut **tx)
        .await;

        match inserted {
            Ok(_) => {
                sqlx::query(&format!(
                    "UPDATE {} SET status_flags = status_flags | ? WHERE message_id = ?",
                    append.side.table()
                ))
                .bind(StatusFlags::EVENT_STORED.0 as i64)
                .bind(&append.message_id)
                .execute(&mut **tx)
                .await
                .map_err(classify_db_error)?;
                Ok(())
            }
            Err(error) if is_unique_violation(&error) => {
                // A concurrent writer took this version; the row is left
                // Failed for inspection and nothing is appended.
                warn!(
                    message_id = %append.message_id,
                    stream_id = %append.stream_id,
                    "event version conflict, row marked failed"
                );
                sqlx::query(&format!(
                    "UPDATE {} SET status = 'Failed', status_flags = status_flags | ?, failure_reason = ? \
                     WHERE message_id = ?",
                    append.side.table()
                ))
                .bind(StatusFlags::FAILED.0 as i64)
                .bind(FailureReason::OptimisticConcurrency.as_i32())
                .bind(&append.message_id)
                .execute(&mut **tx)
                .await
                .map_err(classify_db_error)?;
                Ok(())
            }
            Err(error) => Err(classify_db_error(error)),
        }
    }

    //───────────────────── new stores ─────────────────────

    async fn next_sequence(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        side: Side,
        stream_id: &StreamId,
    ) -> Result<i64, StoreError> {
        let row: (i64,) = sqlx::query_as(&format!(
            "SELECT COALESCE(MAX(sequence_order), 0) FROM {} WHERE stream_id = ?",
            side.table()
        ))
        .bind(stream_id.to_string())
        .fetch_one(&mut **tx)
        .await
        .map_err(classify_db_error)?;
        Ok(row.0 + 1)
    }

    async fn store_new_outbox(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        message: &NewOutboxMessage,
        request: &WorkBatchRequest,
        now: DateTime<Utc>,
    ) -> Result<Option<OutboxWorkItem>, StoreError> {
        let partition = message
            .stream_id
            .map(|s| partition_for(&s, self.config.partition_count));
        let sequence = match &message.stream_id {
            Some(stream_id) => Some(self.next_sequence(tx, Side::Outbox, stream_id).await?),
            None => None,
        };

        let inserted = sqlx::query(
            r#"
            INSERT INTO outbox
                (message_id, destination, type, payload, metadata, scope, status, status_flags,
                 created_at, stream_id, partition_number, sequence_order, is_event, scheduled_for)
            VALUES (?, ?, ?, ?, ?, ?, 'Pending', ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (message_id) DO NOTHING
            "#,
        )
        .bind(message.message_id.to_string())
        .bind(&message.destination)
        .bind(&message.type_tag)
        .bind(&message.payload)
        .bind(message.metadata.as_ref().map(|m| m.to_string()))
        .bind(&message.scope)
        .bind(StatusFlags::STORED.0 as i64)
        .bind(now)
        .bind(message.stream_id.map(|s| s.to_string()))
        .bind(partition)
        .bind(sequence)
        .bind(message.is_event as i64)
        .bind(message.scheduled_for)
        .execute(&mut **tx)
        .await
        .map_err(classify_db_error)?;

        if inserted.rows_affected() == 0 {
            debug!(message_id = %message.message_id, "duplicate outbox store ignored");
            return Ok(None);
        }
        if message.scheduled_for.map_or(false, |t| t > now) {
            return Ok(None);
        }

        // Newly stored rows are leased to the storing instance in the same
        // call so processing starts without an extra cycle.
        self.claim_one(tx, Side::Outbox, &message.message_id, request, now)
            .await?;

        let mut flags = WorkItemFlags::NEWLY_STORED;
        if message.is_event {
            flags.insert(WorkItemFlags::FROM_EVENT_STORE);
        }
        Ok(Some(OutboxWorkItem {
            message_id: message.message_id,
            destination: message.destination.clone(),
            type_tag: message.type_tag.clone(),
            payload: message.payload.clone(),
            metadata: message.metadata.clone(),
            stream_id: message.stream_id,
            partition_number: partition,
            is_event: message.is_event,
            attempts: 0,
            flags,
        }))
    }

    async fn store_new_inbox(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        message: &NewInboxMessage,
        request: &WorkBatchRequest,
        now: DateTime<Utc>,
    ) -> Result<Option<InboxWorkItem>, StoreError> {
        let partition = message
            .stream_id
            .map(|s| partition_for(&s, self.config.partition_count));
        let sequence = match &message.stream_id {
            Some(stream_id) => Some(self.next_sequence(tx, Side::Inbox, stream_id).await?),
            None => None,
        };

        let inserted = sqlx::query(
            r#"
            INSERT INTO inbox
                (message_id, handler_name, type, payload, metadata, scope, status, status_flags,
                 received_at, stream_id, partition_number, sequence_order, is_event)
            VALUES (?, ?, ?, ?, ?, ?, 'Pending', ?, ?, ?, ?, ?, ?)
            ON CONFLICT (message_id) DO NOTHING
            "#,
        )
        .bind(message.message_id.to_string())
        .bind(&message.handler_name)
        .bind(&message.type_tag)
        .bind(&message.payload)
        .bind(message.metadata.as_ref().map(|m| m.to_string()))
        .bind(&message.scope)
        .bind(StatusFlags::STORED.0 as i64)
        .bind(now)
        .bind(message.stream_id.map(|s| s.to_string()))
        .bind(partition)
        .bind(sequence)
        .bind(message.is_event as i64)
        .execute(&mut **tx)
        .await
        .map_err(classify_db_error)?;

        if inserted.rows_affected() == 0 {
            debug!(message_id = %message.message_id, "duplicate inbox store ignored");
            return Ok(None);
        }

        self.claim_one(tx, Side::Inbox, &message.message_id, request, now)
            .await?;

        let mut flags = WorkItemFlags::NEWLY_STORED;
        if message.is_event {
            flags.insert(WorkItemFlags::FROM_EVENT_STORE);
        }
        Ok(Some(InboxWorkItem {
            message_id: message.message_id,
            handler_name: message.handler_name.clone(),
            type_tag: message.type_tag.clone(),
            payload: message.payload.clone(),
            metadata: message.metadata.clone(),
            stream_id: message.stream_id,
            partition_number: partition,
            is_event: message.is_event,
            attempts: 0,
            flags,
        }))
    }

    async fn claim_one(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        side: Side,
        message_id: &MessageId,
        request: &WorkBatchRequest,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let lease_expiry = now + chrono::Duration::seconds(request.lease_seconds);
        sqlx::query(&format!(
            "UPDATE {} SET instance_id = ?, lease_expiry = ?, status = ? WHERE message_id = ?",
            side.table()
        ))
        .bind(request.instance.instance_id.to_string())
        .bind(lease_expiry)
        .bind(side.claimed_status())
        .bind(message_id.to_string())
        .execute(&mut **tx)
        .await
        .map_err(classify_db_error)?;
        Ok(())
    }

    //───────────────────── claim sweep ─────────────────────

    async fn claim_rows(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        side: Side,
        request: &WorkBatchRequest,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<sqlx::sqlite::SqliteRow>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let instance_id = request.instance.instance_id.to_string();
        let (specific, order_column) = match side {
            Side::Outbox => ("destination", "created_at"),
            Side::Inbox => ("handler_name", "received_at"),
        };
        let candidates = sqlx::query(&format!(
            r#"
            SELECT message_id, {specific}, type, payload, metadata, stream_id,
                   partition_number, is_event, attempts, instance_id, scheduled_for
            FROM {table}
            WHERE status IN ('Pending', ?)
              AND (instance_id IS NULL OR lease_expiry IS NULL OR lease_expiry < ?)
              AND (scheduled_for IS NULL OR scheduled_for <= ?)
              AND (partition_number IS NULL OR partition_number IN
                   (SELECT partition_number FROM partition_assignments WHERE instance_id = ?))
            ORDER BY {order_column} ASC, sequence_order ASC
            LIMIT ?
            "#,
            table = side.table(),
        ))
        .bind(side.claimed_status())
        .bind(now)
        .bind(now)
        .bind(&instance_id)
        .bind(limit)
        .fetch_all(&mut **tx)
        .await
        .map_err(classify_db_error)?;

        let lease_expiry = now + chrono::Duration::seconds(request.lease_seconds);
        let mut claimed = Vec::with_capacity(candidates.len());
        for row in candidates {
            let message_id: String = row.get("message_id");
            // Guarded update: exactly one of unchanged, claimed-by-this-call,
            // or lost-to-another-caller per row.
            let updated = sqlx::query(&format!(
                "UPDATE {} SET instance_id = ?, lease_expiry = ?, status = ? \
                 WHERE message_id = ? AND (instance_id IS NULL OR lease_expiry IS NULL OR lease_expiry < ?)",
                side.table()
            ))
            .bind(&instance_id)
            .bind(lease_expiry)
            .bind(side.claimed_status())
            .bind(&message_id)
            .bind(now)
            .execute(&mut **tx)
            .await
            .map_err(classify_db_error)?;

            if updated.rows_affected() == 1 {
                claimed.push(row);
            } else {
                debug!(%message_id, table = side.table(), "row lost to another caller");
            }
        }
        Ok(claimed)
    }
}

//─────────────────────────────
//  Row conversion
//─────────────────────────────

fn parse_id<T: std::str::FromStr>(raw: &str) -> Result<T, StoreError> {
    raw.parse::<T>()
        .map_err(|_| StoreError::Fatal(format!("corrupt identifier column: {raw:?}")))
}

fn parse_metadata(raw: Option<String>) -> Result<Option<serde_json::Value>, StoreError> {
    raw.map(|text| {
        serde_json::from_str(&text)
            .map_err(|e| StoreError::Fatal(format!("corrupt metadata column: {e}")))
    })
    .transpose()
}

fn claimed_item_flags(row: &sqlx::sqlite::SqliteRow) -> WorkItemFlags {
    let mut flags = WorkItemFlags::NONE;
    if row.get::<Option<String>, _>("instance_id").is_some() {
        flags.insert(WorkItemFlags::ORPHANED);
    }
    if row.get::<i64, _>("attempts") > 0 {
        flags.insert(WorkItemFlags::RETRY_AFTER_FAILURE);
    }
    if row.get::<i64, _>("is_event") != 0 {
        flags.insert(WorkItemFlags::FROM_EVENT_STORE);
    }
    flags
}

fn row_to_outbox_item(row: sqlx::sqlite::SqliteRow) -> Result<OutboxWorkItem, StoreError> {
    let flags = claimed_item_flags(&row);
    Ok(OutboxWorkItem {
        message_id: parse_id(&row.get::<String, _>("message_id"))?,
        destination: row.get("destination"),
        type_tag: row.get("type"),
        payload: row.get("payload"),
        metadata: parse_metadata(row.get("metadata"))?,
        stream_id: row
            .get::<Option<String>, _>("stream_id")
            .as_deref()
            .map(parse_id)
            .transpose()?,
        partition_number: row.get("partition_number"),
        is_event: row.get::<i64, _>("is_event") != 0,
        attempts: row.get("attempts"),
        flags,
    })
}

fn row_to_inbox_item(row: sqlx::sqlite::SqliteRow) -> Result<InboxWorkItem, StoreError> {
    let flags = claimed_item_flags(&row);
    Ok(InboxWorkItem {
        message_id: parse_id(&row.get::<String, _>("message_id"))?,
        handler_name: row.get("handler_name"),
        type_tag: row.get("type"),
        payload: row.get("payload"),
        metadata: parse_metadata(row.get("metadata"))?,
        stream_id: row
            .get::<Option<String>, _>("stream_id")
            .as_deref()
            .map(parse_id)
            .transpose()?,
        partition_number: row.get("partition_number"),
        is_event: row.get::<i64, _>("is_event") != 0,
        attempts: row.get("attempts"),
        flags,
    })
}
