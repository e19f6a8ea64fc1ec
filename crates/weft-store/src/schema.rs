//! Database schema migrations.
//!
//! `sequence_order` on the outbox/inbox tables is the per-stream monotone
//! position assigned at store time; claim order and event-store append order
//! both follow it.

use sqlx::SqlitePool;

use crate::StoreError;

/// Create all tables and indexes if they do not exist yet.
pub(crate) async fn migrate(pool: &SqlitePool) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS service_instances (
            instance_id TEXT PRIMARY KEY,
            service_name TEXT NOT NULL,
            host_name TEXT NOT NULL,
            process_id INTEGER NOT NULL,
            started_at TEXT NOT NULL,
            last_heartbeat_at TEXT NOT NULL,
            metadata TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS outbox (
            message_id TEXT PRIMARY KEY,
            destination TEXT NOT NULL,
            type TEXT NOT NULL,
            payload BLOB NOT NULL,
            metadata TEXT,
            scope TEXT,
            status TEXT NOT NULL DEFAULT 'Pending',
            status_flags INTEGER NOT NULL DEFAULT 0,
            attempts INTEGER NOT NULL DEFAULT 0,
            error TEXT,
            created_at TEXT NOT NULL,
            published_at TEXT,
            instance_id TEXT,
            lease_expiry TEXT,
            stream_id TEXT,
            partition_number INTEGER,
            sequence_order INTEGER,
            is_event INTEGER NOT NULL DEFAULT 0,
            failure_reason INTEGER NOT NULL DEFAULT 0,
            scheduled_for TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS inbox (
            message_id TEXT PRIMARY KEY,
            handler_name TEXT NOT NULL,
            type TEXT NOT NULL,
            payload BLOB NOT NULL,
            metadata TEXT,
            scope TEXT,
            status TEXT NOT NULL DEFAULT 'Pending',
            status_flags INTEGER NOT NULL DEFAULT 0,
            attempts INTEGER NOT NULL DEFAULT 0,
            error TEXT,
            received_at TEXT NOT NULL,
            processed_at TEXT,
            instance_id TEXT,
            lease_expiry TEXT,
            stream_id TEXT,
            partition_number INTEGER,
            sequence_order INTEGER,
            is_event INTEGER NOT NULL DEFAULT 0,
            failure_reason INTEGER NOT NULL DEFAULT 0,
            scheduled_for TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS event_store (
            seq_id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT NOT NULL UNIQUE,
            stream_id TEXT NOT NULL,
            version INTEGER NOT NULL,
            type TEXT NOT NULL,
            payload BLOB NOT NULL,
            metadata TEXT,
            scope TEXT,
            created_at TEXT NOT NULL,
            UNIQUE (stream_id, version)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS partition_assignments (
            partition_number INTEGER PRIMARY KEY,
            instance_id TEXT NOT NULL,
            assigned_at TEXT NOT NULL,
            last_heartbeat TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS perspective_checkpoints (
            perspective_name TEXT PRIMARY KEY,
            last_seq_id INTEGER NOT NULL DEFAULT 0,
            last_updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Claim scans and stream ordering.
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_outbox_claim ON outbox (status, lease_expiry, partition_number)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_outbox_stream ON outbox (stream_id, sequence_order)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_inbox_claim ON inbox (status, lease_expiry, partition_number)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_inbox_stream ON inbox (stream_id, sequence_order)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_event_store_type ON event_store (type, seq_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_partition_owner ON partition_assignments (instance_id, last_heartbeat)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
