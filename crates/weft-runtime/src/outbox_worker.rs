//! Outbox publisher: pushes leased outbox rows to the transport.
//!
//! The cycle loop hands this worker the outbox half of each claimed batch.
//! Per item the worker fires the distribute lifecycle stages around the
//! publish I/O and queues one completion or one classified failure for the
//! next cycle. Nothing is ever raised to the loop; the reports are the only
//! outcome.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use weft_codec::CodecError;
use weft_lifecycle::{HookContext, LifecycleInvoker, Stage};
use weft_transport::Transport;
use weft_types::{
    Envelope, FailureReason, Hop, InstanceId, OutboxWorkItem, StatusFlags,
};

use crate::reports::CycleReports;

/// Publishes claimed outbox rows and reports their fate.
pub struct OutboxPublisher {
    instance_id: InstanceId,
    transport: Arc<dyn Transport>,
    lifecycle: LifecycleInvoker,
    reports: Arc<CycleReports>,
    publish_timeout: Duration,
}

impl OutboxPublisher {
    /// Build a publisher bound to one instance's transport and reports.
    pub fn new(
        instance_id: InstanceId,
        transport: Arc<dyn Transport>,
        lifecycle: LifecycleInvoker,
        reports: Arc<CycleReports>,
        publish_timeout: Duration,
    ) -> Self {
        Self {
            instance_id,
            transport,
            lifecycle,
            reports,
            publish_timeout,
        }
    }

    /// Publish every item of a claimed batch.
    ///
    /// A cancelled token stops before the next item; in-flight publishes are
    /// bounded by the per-publish timeout and their leases expire naturally
    /// if the process goes away first.
    pub async fn process(&self, items: Vec<OutboxWorkItem>, cancel: &CancellationToken) {
        for item in items {
            if cancel.is_cancelled() {
                debug!(message_id = %item.message_id, "shutdown, leaving row to its lease");
                break;
            }
            self.publish_one(item, cancel).await;
        }
    }

    async fn publish_one(&self, item: OutboxWorkItem, cancel: &CancellationToken) {
        let hook_ctx = |stage: Stage| HookContext {
            message_id: item.message_id,
            type_tag: item.type_tag.clone(),
            stage,
            metadata: item.metadata.clone(),
            cancel: cancel.clone(),
        };

        if let Err(error) = self
            .lifecycle
            .run_inline(&hook_ctx(Stage::PreDistributeInline))
            .await
        {
            self.reports.outbox_failed(
                item.message_id,
                StatusFlags::STORED,
                FailureReason::Unknown,
                format!("pre-distribute hook failed: {error}"),
            );
            return;
        }
        self.lifecycle.spawn_async(&hook_ctx(Stage::PreDistributeAsync));

        let mut envelope = Envelope::new(item.message_id, item.type_tag.clone(), item.payload.clone());
        envelope.add_hop(Hop::new(self.instance_id, None, None));

        // DistributeAsync runs beside the publish I/O.
        self.lifecycle.spawn_async(&hook_ctx(Stage::DistributeAsync));
        let published = tokio::time::timeout(
            self.publish_timeout,
            self.transport
                .publish(envelope, &item.destination, cancel.child_token()),
        )
        .await;

        self.lifecycle
            .spawn_async(&hook_ctx(Stage::PostDistributeAsync));
        let post_inline = self
            .lifecycle
            .run_inline(&hook_ctx(Stage::PostDistributeInline))
            .await;

        match published {
            Ok(Ok(())) => match post_inline {
                Ok(()) => {
                    debug!(message_id = %item.message_id, destination = %item.destination, "published");
                    self.reports.outbox_completed(
                        item.message_id,
                        StatusFlags::STORED | StatusFlags::PUBLISHED,
                    );
                }
                Err(error) => {
                    self.reports.outbox_failed(
                        item.message_id,
                        StatusFlags::STORED | StatusFlags::PUBLISHED,
                        FailureReason::Unknown,
                        format!("post-distribute hook failed: {error}"),
                    );
                }
            },
            Ok(Err(error)) => {
                let reason = if error.downcast_ref::<CodecError>().is_some() {
                    FailureReason::SerializationError
                } else {
                    FailureReason::TransportUnavailable
                };
                warn!(
                    message_id = %item.message_id,
                    destination = %item.destination,
                    attempts = item.attempts,
                    %error,
                    "publish failed"
                );
                self.reports.outbox_failed(
                    item.message_id,
                    StatusFlags::STORED,
                    reason,
                    error.to_string(),
                );
            }
            Err(_elapsed) => {
                warn!(
                    message_id = %item.message_id,
                    destination = %item.destination,
                    timeout_secs = self.publish_timeout.as_secs(),
                    "publish timed out"
                );
                self.reports.outbox_failed(
                    item.message_id,
                    StatusFlags::STORED,
                    FailureReason::Timeout,
                    format!("publish exceeded {:?}", self.publish_timeout),
                );
            }
        }
    }
}
