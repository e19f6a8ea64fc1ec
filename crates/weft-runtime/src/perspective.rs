//! Perspective worker: replays the event store into materialized read models.
//!
//! Each registered perspective names the event types it consumes and an
//! apply function. The worker reads forward from the perspective's
//! checkpoint in global `seq_id` order and advances the checkpoint either
//! once per cycle (batched, the default) or after every event (instant,
//! deterministic visibility for tests). A failing apply suspends the
//! perspective at the failing sequence id until an operator intervenes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use futures::future::BoxFuture;
use tracing::{debug, error};

use weft_store::{CheckpointStore, EventStore};
use weft_types::EventRecord;

//─────────────────────────────
//  Registration
//─────────────────────────────

/// When the checkpoint is written relative to applied events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CheckpointMode {
    /// One checkpoint write per cycle; fewer database roundtrips.
    #[default]
    Batched,
    /// A checkpoint write after every applied event.
    Instant,
}

/// Projection function applied to each matching event.
pub type ApplyFn = Arc<dyn Fn(EventRecord) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// A registered read model.
#[derive(Clone)]
pub struct Perspective {
    /// Unique name; the checkpoint key.
    pub name: String,
    /// Event types this perspective consumes; empty consumes everything.
    pub event_types: Vec<String>,
    /// Projection applied per event, in `seq_id` order.
    pub apply: ApplyFn,
    /// Checkpointing strategy.
    pub mode: CheckpointMode,
}

impl std::fmt::Debug for Perspective {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Perspective")
            .field("name", &self.name)
            .field("event_types", &self.event_types)
            .field("mode", &self.mode)
            .finish()
    }
}

/// Perspectives registered before the runtime starts.
#[derive(Debug, Default)]
pub struct PerspectiveRegistry {
    perspectives: Mutex<Vec<Perspective>>,
}

impl PerspectiveRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a perspective. Names must be unique; a duplicate replaces
    /// the previous registration.
    pub fn register(&self, perspective: Perspective) {
        let mut perspectives = self.perspectives.lock().unwrap_or_else(|e| e.into_inner());
        perspectives.retain(|p| p.name != perspective.name);
        perspectives.push(perspective);
    }

    /// Snapshot of every registered perspective.
    pub fn all(&self) -> Vec<Perspective> {
        self.perspectives
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

//─────────────────────────────
//  Worker
//─────────────────────────────

/// Health of one perspective as seen by the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PerspectiveStatus {
    /// Applying and advancing normally.
    Active,
    /// Suspended at the given sequence id after a failed apply.
    Failed {
        /// Sequence id of the event whose apply failed.
        at_seq_id: i64,
    },
}

/// Drives all registered perspectives forward.
pub struct PerspectiveWorker {
    events: EventStore,
    checkpoints: CheckpointStore,
    registry: Arc<PerspectiveRegistry>,
    batch_size: i64,
    statuses: Mutex<HashMap<String, PerspectiveStatus>>,
}

impl PerspectiveWorker {
    /// Build a worker over the event store and checkpoint table.
    pub fn new(
        events: EventStore,
        checkpoints: CheckpointStore,
        registry: Arc<PerspectiveRegistry>,
        batch_size: i64,
    ) -> Self {
        Self {
            events,
            checkpoints,
            registry,
            batch_size,
            statuses: Mutex::new(HashMap::new()),
        }
    }

    /// The worker's view of a perspective's health.
    pub fn status(&self, name: &str) -> PerspectiveStatus {
        self.statuses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .copied()
            .unwrap_or(PerspectiveStatus::Active)
    }

    fn set_status(&self, name: &str, status: PerspectiveStatus) {
        self.statuses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_owned(), status);
    }

    /// Run one replay cycle across every registered perspective.
    pub async fn run_cycle(&self) -> Result<()> {
        for perspective in self.registry.all() {
            if let PerspectiveStatus::Failed { at_seq_id } = self.status(&perspective.name) {
                debug!(
                    perspective = %perspective.name,
                    at_seq_id,
                    "perspective suspended, skipping"
                );
                continue;
            }
            self.advance_one(&perspective).await?;
        }
        Ok(())
    }

    async fn advance_one(&self, perspective: &Perspective) -> Result<()> {
        let last = self.checkpoints.load(&perspective.name).await?;
        let events = self
            .events
            .read_since(last, &perspective.event_types, self.batch_size)
            .await?;
        if events.is_empty() {
            return Ok(());
        }

        let mut advanced = last;
        for event in events {
            let seq_id = event.seq_id;
            match (perspective.apply)(event).await {
                Ok(()) => {
                    advanced = seq_id;
                    if perspective.mode == CheckpointMode::Instant {
                        self.checkpoints.advance(&perspective.name, seq_id).await?;
                    }
                }
                Err(apply_error) => {
                    // Operator alert: the perspective stops advancing until
                    // the failing event is dealt with.
                    error!(
                        perspective = %perspective.name,
                        seq_id,
                        error = %apply_error,
                        "perspective apply failed, suspending"
                    );
                    self.set_status(
                        &perspective.name,
                        PerspectiveStatus::Failed { at_seq_id: seq_id },
                    );
                    break;
                }
            }
        }

        if perspective.mode == CheckpointMode::Batched && advanced > last {
            self.checkpoints.advance(&perspective.name, advanced).await?;
        }
        debug!(
            perspective = %perspective.name,
            from = last,
            to = advanced,
            "perspective advanced"
        );
        Ok(())
    }
}
