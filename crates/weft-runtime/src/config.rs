//! Runtime configuration.

use std::time::Duration;

use weft_store::{CoordinatorConfig, PartitionConfig};
use weft_types::DEFAULT_LEASE_SECONDS;

/// Tuning for one service instance's runtime.
///
/// Constructed explicitly and handed to [`WeftRuntime::new`]; nothing here
/// changes after the runtime is built. `coordinator.partition_count` and
/// `partitions.partition_count` must agree, and must be identical across the
/// fleet.
///
/// [`WeftRuntime::new`]: crate::WeftRuntime::new
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Logical service name shared by all instances of a deployment.
    pub service_name: String,
    /// Host name reported in the instance row.
    pub host_name: String,
    /// Delay between coordinator cycles.
    pub poll_interval: Duration,
    /// Delay between partition-ownership ticks.
    pub heartbeat_interval: Duration,
    /// Delay between perspective replay cycles.
    pub perspective_interval: Duration,
    /// Lease duration granted to claimed work rows.
    pub lease_seconds: i64,
    /// How long `stop` waits for in-flight work before giving up.
    pub graceful_timeout: Duration,
    /// Per-publish transport deadline.
    pub publish_timeout: Duration,
    /// Events read per perspective per cycle.
    pub perspective_batch_size: i64,
    /// Batch-protocol tuning.
    pub coordinator: CoordinatorConfig,
    /// Partition-ownership tuning.
    pub partitions: PartitionConfig,
    /// Optional instance metadata recorded in the instance row.
    pub metadata: Option<serde_json::Value>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            service_name: "weft".to_string(),
            host_name: std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string()),
            poll_interval: Duration::from_millis(500),
            heartbeat_interval: Duration::from_secs(10),
            perspective_interval: Duration::from_millis(500),
            lease_seconds: DEFAULT_LEASE_SECONDS,
            graceful_timeout: Duration::from_secs(30),
            publish_timeout: Duration::from_secs(30),
            perspective_batch_size: 100,
            coordinator: CoordinatorConfig::default(),
            partitions: PartitionConfig::default(),
            metadata: None,
        }
    }
}

impl RuntimeConfig {
    /// A config named after `service_name` with every other knob default.
    pub fn for_service(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Self::default()
        }
    }
}
