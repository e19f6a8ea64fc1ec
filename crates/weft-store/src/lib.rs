#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **weft-store** – Relational store for the Weft runtime.
//!
//! Owns the shared database every instance of a fleet coordinates through:
//! the outbox/inbox tables, the append-only event store, the partition
//! assignment table, and the perspective checkpoints. The centerpiece is the
//! [`WorkCoordinator`], whose single transactional batch operation records
//! completions, stores new messages, appends events, and leases claimable
//! work to the calling instance.
//!
//! The bundled driver is SQLite via sqlx; all SQL sticks to the portable
//! subset so the same statements run on a PostgreSQL pool. No in-memory
//! state survives between coordinator calls - the database is the source of
//! truth.

use std::path::Path;

use chrono::Utc;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

use weft_types::{InstanceId, MessageId, StreamId};

mod admin;
mod checkpoints;
mod coordinator;
mod event_store;
mod partitions;
mod schema;

pub use admin::{AdminStore, FailedMessage, PendingStats, WorkTable};
pub use checkpoints::{Checkpoint, CheckpointStore};
pub use coordinator::{CoordinatorConfig, WorkCoordinator};
pub use event_store::EventStore;
pub use partitions::{partition_for, PartitionConfig, PartitionHeartbeat, PartitionManager};

//─────────────────────────────
//  Error types
//─────────────────────────────

/// Errors produced by the store layer.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Event-store version conflict with a concurrent writer.
    #[error("event-store version conflict on stream {stream_id}")]
    OptimisticConcurrency {
        /// Stream on which the conflicting append was attempted.
        stream_id: StreamId,
    },
    /// The batch transaction lost a serialization race; retry the whole call.
    #[error("coordinator transaction conflict, retry the batch: {0}")]
    CoordinatorConflict(String),
    /// The caller's lease on a row expired mid-work.
    #[error("lease lost for message {0}")]
    LeaseLost(MessageId),
    /// Schema mismatch or corrupt row; the worker should stop.
    #[error("unrecoverable store error: {0}")]
    Fatal(String),
    /// Any other database failure.
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Map a database error, classifying lock/serialization contention as a
/// retryable [`StoreError::CoordinatorConflict`].
pub(crate) fn classify_db_error(error: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &error {
        let code = db.code().unwrap_or_default();
        // SQLITE_BUSY / SQLITE_LOCKED, or a PostgreSQL serialization failure.
        if code == "5" || code == "6" || code == "40001" {
            return StoreError::CoordinatorConflict(db.message().to_owned());
        }
    }
    StoreError::Database(error)
}

pub(crate) fn is_unique_violation(error: &sqlx::Error) -> bool {
    error
        .as_database_error()
        .map(|db| db.kind() == sqlx::error::ErrorKind::UniqueViolation)
        .unwrap_or(false)
}

//─────────────────────────────
//  Store handle
//─────────────────────────────

/// Handle to the shared relational store.
///
/// Cheap to clone; all components built from it share one connection pool.
#[derive(Debug, Clone)]
pub struct WeftStore {
    pool: SqlitePool,
}

impl WeftStore {
    /// Open or create the database at the given filesystem path.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let database_url = format!("sqlite://{}?mode=rwc", path.as_ref().display());
        let pool = SqlitePool::connect(&database_url).await?;
        Self::from_pool(pool).await
    }

    /// Open an in-memory database, useful for tests.
    ///
    /// The pool is capped at one connection: a pooled `sqlite::memory:`
    /// with more connections silently yields one database per connection.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Self::from_pool(pool).await
    }

    /// Wrap an existing pool, running migrations first.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        schema::migrate(&pool).await?;
        Ok(Self { pool })
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Build the work coordinator over this store.
    pub fn coordinator(&self, config: CoordinatorConfig) -> WorkCoordinator {
        WorkCoordinator::new(self.pool.clone(), config)
    }

    /// Build the event store over this store.
    pub fn event_store(&self) -> EventStore {
        EventStore::new(self.pool.clone())
    }

    /// Build the partition manager over this store.
    pub fn partition_manager(&self, config: PartitionConfig) -> PartitionManager {
        PartitionManager::new(self.pool.clone(), config)
    }

    /// Build the perspective checkpoint store over this store.
    pub fn checkpoints(&self) -> CheckpointStore {
        CheckpointStore::new(self.pool.clone())
    }

    /// Build the operator surface over this store.
    pub fn admin(&self) -> AdminStore {
        AdminStore::new(self.pool.clone())
    }

    /// Delete this instance's registration row on graceful shutdown.
    pub async fn deregister_instance(&self, instance_id: InstanceId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM service_instances WHERE instance_id = ?")
            .bind(instance_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Number of instances whose heartbeat is younger than `max_age_seconds`.
    pub async fn live_instance_count(&self, max_age_seconds: i64) -> Result<i64, StoreError> {
        let threshold = Utc::now() - chrono::Duration::seconds(max_age_seconds);
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM service_instances WHERE last_heartbeat_at > ?",
        )
        .bind(threshold)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    /// Close the connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
