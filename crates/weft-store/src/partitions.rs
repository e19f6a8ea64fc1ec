//! Partition ownership over the shared assignment table.
//!
//! Every stream hashes to one partition in `[0, P)`; every partition has at
//! most one live owner, so all rows of a stream are processed by one
//! instance at a time. Ownership is maintained by heartbeat: stale rows are
//! reclaimable by any instance, and owners above the fleet's fair-share
//! target release the excess on their next tick.

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::{debug, info};

use weft_types::{InstanceId, StreamId, DEFAULT_PARTITION_COUNT};

use crate::{classify_db_error, StoreError};

/// Partition a stream id maps to: the low 128 bits reduced `mod P`.
///
/// Stable across the fleet; no process-local hasher state is involved.
pub fn partition_for(stream_id: &StreamId, partition_count: i64) -> i64 {
    (stream_id.as_u128() % partition_count.max(1) as u128) as i64
}

//─────────────────────────────
//  Configuration
//─────────────────────────────

/// Tuning knobs for partition ownership.
#[derive(Debug, Clone)]
pub struct PartitionConfig {
    /// Fleet-wide partition count; fixed at startup.
    pub partition_count: i64,
    /// Heartbeat age beyond which an assignment is considered stale.
    pub heartbeat_expiry: Duration,
    /// Maximum partitions claimed in one tick; bounds catch-up bursts.
    pub claim_limit: i64,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            partition_count: DEFAULT_PARTITION_COUNT,
            heartbeat_expiry: Duration::from_secs(30),
            claim_limit: 512,
        }
    }
}

/// Outcome of one heartbeat tick, for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionHeartbeat {
    /// Partitions owned after the tick.
    pub owned: i64,
    /// Partitions newly claimed by this tick.
    pub claimed: i64,
    /// Partitions released by this tick.
    pub released: i64,
    /// Fair-share ownership target used by this tick.
    pub target: i64,
    /// Instances with a fresh heartbeat at tick time.
    pub live_instances: i64,
}

//─────────────────────────────
//  Manager
//─────────────────────────────

/// Maintains this instance's partition ownership.
#[derive(Debug, Clone)]
pub struct PartitionManager {
    pool: SqlitePool,
    config: PartitionConfig,
}

impl PartitionManager {
    /// Build a manager over `pool` with the given tuning.
    pub fn new(pool: SqlitePool, config: PartitionConfig) -> Self {
        Self { pool, config }
    }

    /// The manager's tuning knobs.
    pub fn config(&self) -> &PartitionConfig {
        &self.config
    }

    /// Run one ownership tick for `instance_id`.
    ///
    /// Refreshes heartbeats on owned rows, claims stale or unassigned
    /// partitions up to the fair-share target `ceil(P / live_instances)`,
    /// and releases any excess above the target.
    pub async fn heartbeat(
        &self,
        instance_id: InstanceId,
    ) -> Result<PartitionHeartbeat, StoreError> {
        let now = Utc::now();
        let threshold = now
            - chrono::Duration::from_std(self.config.heartbeat_expiry)
                .unwrap_or_else(|_| chrono::Duration::seconds(30));
        let instance = instance_id.to_string();

        // Refresh everything we own.
        sqlx::query("UPDATE partition_assignments SET last_heartbeat = ? WHERE instance_id = ?")
            .bind(now)
            .bind(&instance)
            .execute(&self.pool)
            .await
            .map_err(classify_db_error)?;

        let live: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM service_instances WHERE last_heartbeat_at > ?",
        )
        .bind(threshold)
        .fetch_one(&self.pool)
        .await?;
        let live_instances = live.0.max(1);
        let target =
            (self.config.partition_count + live_instances - 1) / live_instances;

        let owned: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM partition_assignments WHERE instance_id = ?",
        )
        .bind(&instance)
        .fetch_one(&self.pool)
        .await?;

        let mut claimed = 0i64;
        let mut released = 0i64;
        if owned.0 < target {
            let wanted = (target - owned.0).min(self.config.claim_limit);
            claimed = self
                .claim_partitions(&instance, wanted, now, threshold)
                .await?;
        } else if owned.0 > target {
            released = self.release_excess(&instance, owned.0 - target).await?;
        }

        let tick = PartitionHeartbeat {
            owned: owned.0 + claimed - released,
            claimed,
            released,
            target,
            live_instances,
        };
        debug!(instance_id = %instance_id, ?tick, "partition heartbeat");
        Ok(tick)
    }

    /// Partition numbers currently owned by `instance_id`, ascending.
    pub async fn owned_partitions(
        &self,
        instance_id: InstanceId,
    ) -> Result<Vec<i64>, StoreError> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            "SELECT partition_number FROM partition_assignments WHERE instance_id = ? \
             ORDER BY partition_number ASC",
        )
        .bind(instance_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }

    /// Release every partition owned by `instance_id`; graceful shutdown.
    pub async fn release_all(&self, instance_id: InstanceId) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM partition_assignments WHERE instance_id = ?")
            .bind(instance_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(classify_db_error)?;
        if result.rows_affected() > 0 {
            info!(%instance_id, count = result.rows_affected(), "partitions released");
        }
        Ok(result.rows_affected())
    }

    //───────────────────── claims ─────────────────────

    async fn claim_partitions(
        &self,
        instance: &str,
        wanted: i64,
        now: DateTime<Utc>,
        threshold: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let mut remaining = wanted;
        let mut claimed = 0i64;

        // Stale assignments of other instances first.
        let stale: Vec<(i64,)> = sqlx::query_as(
            "SELECT partition_number FROM partition_assignments \
             WHERE last_heartbeat < ? AND instance_id != ? \
             ORDER BY partition_number ASC LIMIT ?",
        )
        .bind(threshold)
        .bind(instance)
        .bind(remaining)
        .fetch_all(&self.pool)
        .await?;

        for (partition,) in stale {
            if self
                .claim_one(partition, instance, now, threshold)
                .await?
            {
                claimed += 1;
                remaining -= 1;
            }
        }
        if remaining <= 0 {
            return Ok(claimed);
        }

        // Then partitions no row exists for yet.
        let existing: Vec<(i64,)> =
            sqlx::query_as("SELECT partition_number FROM partition_assignments")
                .fetch_all(&self.pool)
                .await?;
        let taken: HashSet<i64> = existing.into_iter().map(|r| r.0).collect();
        for partition in 0..self.config.partition_count {
            if remaining <= 0 {
                break;
            }
            if taken.contains(&partition) {
                continue;
            }
            if self
                .claim_one(partition, instance, now, threshold)
                .await?
            {
                claimed += 1;
                remaining -= 1;
            }
        }
        Ok(claimed)
    }

    /// Conditional upsert: wins only if the row is absent or stale.
    async fn claim_one(
        &self,
        partition: i64,
        instance: &str,
        now: DateTime<Utc>,
        threshold: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO partition_assignments (partition_number, instance_id, assigned_at, last_heartbeat)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (partition_number) DO UPDATE SET
                instance_id = excluded.instance_id,
                assigned_at = excluded.assigned_at,
                last_heartbeat = excluded.last_heartbeat
            WHERE partition_assignments.last_heartbeat < ?
            "#,
        )
        .bind(partition)
        .bind(instance)
        .bind(now)
        .bind(now)
        .bind(threshold)
        .execute(&self.pool)
        .await
        .map_err(classify_db_error)?;
        Ok(result.rows_affected() > 0)
    }

    async fn release_excess(&self, instance: &str, excess: i64) -> Result<i64, StoreError> {
        let result = sqlx::query(
            "DELETE FROM partition_assignments WHERE partition_number IN \
             (SELECT partition_number FROM partition_assignments WHERE instance_id = ? \
              ORDER BY partition_number DESC LIMIT ?)",
        )
        .bind(instance)
        .bind(excess)
        .execute(&self.pool)
        .await
        .map_err(classify_db_error)?;
        Ok(result.rows_affected() as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WeftStore;

    fn config(partitions: i64) -> PartitionConfig {
        PartitionConfig {
            partition_count: partitions,
            heartbeat_expiry: Duration::from_secs(30),
            claim_limit: 512,
        }
    }

    async fn register_instance(store: &WeftStore, instance: InstanceId, heartbeat: DateTime<Utc>) {
        sqlx::query(
            "INSERT INTO service_instances \
             (instance_id, service_name, host_name, process_id, started_at, last_heartbeat_at) \
             VALUES (?, 'svc', 'host', 1, ?, ?) \
             ON CONFLICT (instance_id) DO UPDATE SET last_heartbeat_at = excluded.last_heartbeat_at",
        )
        .bind(instance.to_string())
        .bind(heartbeat)
        .bind(heartbeat)
        .execute(store.pool())
        .await
        .unwrap();
    }

    #[test]
    fn partition_is_stable_and_in_range() {
        let stream = StreamId::generate();
        let first = partition_for(&stream, 16);
        let second = partition_for(&stream, 16);
        assert_eq!(first, second);
        assert!((0..16).contains(&first));
    }

    #[tokio::test]
    async fn lone_instance_claims_everything() {
        let store = WeftStore::in_memory().await.unwrap();
        let manager = store.partition_manager(config(8));
        let instance = InstanceId::generate();
        register_instance(&store, instance, Utc::now()).await;

        let tick = manager.heartbeat(instance).await.unwrap();
        assert_eq!(tick.live_instances, 1);
        assert_eq!(tick.target, 8);
        assert_eq!(tick.claimed, 8);
        assert_eq!(manager.owned_partitions(instance).await.unwrap().len(), 8);
    }

    #[tokio::test]
    async fn stale_partitions_are_reclaimed() {
        let store = WeftStore::in_memory().await.unwrap();
        let manager = store.partition_manager(config(4));
        let dead = InstanceId::generate();
        let alive = InstanceId::generate();

        // Dead instance owned everything, then stopped heartbeating.
        let long_ago = Utc::now() - chrono::Duration::minutes(10);
        register_instance(&store, dead, long_ago).await;
        for partition in 0..4 {
            sqlx::query(
                "INSERT INTO partition_assignments \
                 (partition_number, instance_id, assigned_at, last_heartbeat) VALUES (?, ?, ?, ?)",
            )
            .bind(partition)
            .bind(dead.to_string())
            .bind(long_ago)
            .bind(long_ago)
            .execute(store.pool())
            .await
            .unwrap();
        }

        register_instance(&store, alive, Utc::now()).await;
        let tick = manager.heartbeat(alive).await.unwrap();
        assert_eq!(tick.claimed, 4);
        assert_eq!(manager.owned_partitions(alive).await.unwrap(), vec![0, 1, 2, 3]);
        assert!(manager.owned_partitions(dead).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn fresh_partitions_are_not_stolen() {
        let store = WeftStore::in_memory().await.unwrap();
        let manager = store.partition_manager(config(2));
        let first = InstanceId::generate();
        let second = InstanceId::generate();

        register_instance(&store, first, Utc::now()).await;
        manager.heartbeat(first).await.unwrap();

        register_instance(&store, second, Utc::now()).await;
        let tick = manager.heartbeat(second).await.unwrap();
        // Both partitions have fresh owners; target is 1, nothing claimable.
        assert_eq!(tick.claimed, 0);
        assert_eq!(manager.owned_partitions(first).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn over_target_owner_releases_excess() {
        let store = WeftStore::in_memory().await.unwrap();
        let manager = store.partition_manager(config(4));
        let first = InstanceId::generate();
        let second = InstanceId::generate();

        register_instance(&store, first, Utc::now()).await;
        manager.heartbeat(first).await.unwrap();
        assert_eq!(manager.owned_partitions(first).await.unwrap().len(), 4);

        // A second live instance halves the target; the next tick sheds.
        register_instance(&store, second, Utc::now()).await;
        let tick = manager.heartbeat(first).await.unwrap();
        assert_eq!(tick.target, 2);
        assert_eq!(tick.released, 2);
        assert_eq!(manager.owned_partitions(first).await.unwrap().len(), 2);

        // The freed partitions are claimable by the newcomer.
        let tick = manager.heartbeat(second).await.unwrap();
        assert_eq!(tick.claimed, 2);
        assert_eq!(manager.owned_partitions(second).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn release_all_clears_ownership() {
        let store = WeftStore::in_memory().await.unwrap();
        let manager = store.partition_manager(config(3));
        let instance = InstanceId::generate();
        register_instance(&store, instance, Utc::now()).await;
        manager.heartbeat(instance).await.unwrap();

        let released = manager.release_all(instance).await.unwrap();
        assert_eq!(released, 3);
        assert!(manager.owned_partitions(instance).await.unwrap().is_empty());
    }
}
