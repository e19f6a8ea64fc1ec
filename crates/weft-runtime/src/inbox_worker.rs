//! Inbox consumer: receives envelopes and dispatches stored rows to receptors.
//!
//! The transport handler runs the pre-inbox stages and queues the envelope
//! as a new inbox message; the coordinator's `ON CONFLICT DO NOTHING` insert
//! makes reception idempotent, so a redelivered envelope is acknowledged
//! without reprocessing. Rows claimed back from the coordinator are
//! dispatched to the local receptor, and one completion or classified
//! failure per row feeds the next cycle.

use std::sync::Arc;

use tracing::{debug, warn};

use tokio_util::sync::CancellationToken;
use weft_dispatch::{Dispatcher, ReceptorContext, ReceptorError};
use weft_lifecycle::{HookContext, LifecycleInvoker, Stage};
use weft_transport::SubscriptionHandler;
use weft_types::{
    Envelope, FailureReason, InboxWorkItem, NewInboxMessage, StatusFlags, StreamId,
};

use crate::reports::CycleReports;

//─────────────────────────────
//  Inbound routing
//─────────────────────────────

/// Derives the stream a delivered envelope belongs to.
pub type StreamKeyFn = Arc<dyn Fn(&Envelope) -> Option<StreamId> + Send + Sync>;

/// How envelopes arriving on one destination become inbox rows.
#[derive(Clone, Default)]
pub struct InboundRoute {
    /// Receptor name; the envelope's payload type tag when `None`.
    pub handler_name: Option<String>,
    /// Whether processed rows append to the event store.
    pub is_event: bool,
    /// Optional stream extraction for ordered processing.
    pub stream_key: Option<StreamKeyFn>,
}

impl std::fmt::Debug for InboundRoute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundRoute")
            .field("handler_name", &self.handler_name)
            .field("is_event", &self.is_event)
            .field("has_stream_key", &self.stream_key.is_some())
            .finish()
    }
}

//─────────────────────────────
//  Consumer
//─────────────────────────────

/// Consumes delivered envelopes and dispatches claimed inbox rows.
pub struct InboxConsumer {
    dispatcher: Arc<Dispatcher>,
    lifecycle: LifecycleInvoker,
    reports: Arc<CycleReports>,
}

impl InboxConsumer {
    /// Build a consumer over the local dispatcher and shared reports.
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        lifecycle: LifecycleInvoker,
        reports: Arc<CycleReports>,
    ) -> Self {
        Self {
            dispatcher,
            lifecycle,
            reports,
        }
    }

    /// Build the transport handler for one subscribed destination.
    ///
    /// Fires the pre-inbox stages, then queues the envelope for the next
    /// coordinator cycle. An inline-hook failure propagates to the driver,
    /// which redelivers under at-least-once semantics.
    pub fn transport_handler(
        &self,
        route: InboundRoute,
        cancel: CancellationToken,
    ) -> SubscriptionHandler {
        let lifecycle = self.lifecycle.clone();
        let reports = Arc::clone(&self.reports);
        Arc::new(move |envelope: Envelope| {
            let lifecycle = lifecycle.clone();
            let reports = Arc::clone(&reports);
            let route = route.clone();
            let cancel = cancel.clone();
            Box::pin(async move {
                let hook_ctx = |stage: Stage| HookContext {
                    message_id: envelope.message_id,
                    type_tag: envelope.payload_type.clone(),
                    stage,
                    metadata: envelope.current_hop().and_then(|h| h.metadata.clone()),
                    cancel: cancel.clone(),
                };
                lifecycle.run_inline(&hook_ctx(Stage::PreInboxInline)).await?;
                lifecycle.spawn_async(&hook_ctx(Stage::PreInboxAsync));

                let stream_id = route.stream_key.as_ref().and_then(|key| key(&envelope));
                debug!(message_id = %envelope.message_id, type_tag = %envelope.payload_type, "envelope received");
                reports.inbox_received(NewInboxMessage {
                    message_id: envelope.message_id,
                    handler_name: route
                        .handler_name
                        .clone()
                        .unwrap_or_else(|| envelope.payload_type.clone()),
                    type_tag: envelope.payload_type.clone(),
                    payload: envelope.payload.clone(),
                    metadata: envelope.current_hop().and_then(|h| h.metadata.clone()),
                    scope: None,
                    stream_id,
                    is_event: route.is_event,
                });
                Ok(())
            })
        })
    }

    /// Dispatch every item of a claimed batch to its receptor.
    pub async fn process(&self, items: Vec<InboxWorkItem>, cancel: &CancellationToken) {
        for item in items {
            if cancel.is_cancelled() {
                debug!(message_id = %item.message_id, "shutdown, leaving row to its lease");
                break;
            }
            self.dispatch_one(item, cancel).await;
        }
    }

    async fn dispatch_one(&self, item: InboxWorkItem, cancel: &CancellationToken) {
        let hook_ctx = |stage: Stage| HookContext {
            message_id: item.message_id,
            type_tag: item.type_tag.clone(),
            stage,
            metadata: item.metadata.clone(),
            cancel: cancel.clone(),
        };

        let ctx = ReceptorContext {
            message_id: item.message_id,
            correlation_id: None,
            causation_id: None,
            metadata: item.metadata.clone(),
            cancel: cancel.clone(),
        };
        let outcome = self
            .dispatcher
            .local_invoke(&item.type_tag, item.payload.clone(), ctx)
            .await;

        self.lifecycle.spawn_async(&hook_ctx(Stage::PostInboxAsync));
        let post_inline = self
            .lifecycle
            .run_inline(&hook_ctx(Stage::PostInboxInline))
            .await;

        match outcome {
            Ok(output) => {
                // Whatever the receptor produced goes out through the
                // durable send path on the next cycle.
                for message in output.into_messages() {
                    self.dispatcher.send(message);
                }
                match post_inline {
                    Ok(()) => {
                        debug!(message_id = %item.message_id, "receptor processed");
                        self.reports.inbox_completed(
                            item.message_id,
                            StatusFlags::STORED | StatusFlags::RECEPTOR_PROCESSED,
                        );
                    }
                    Err(error) => {
                        self.reports.inbox_failed(
                            item.message_id,
                            StatusFlags::STORED | StatusFlags::RECEPTOR_PROCESSED,
                            FailureReason::Unknown,
                            format!("post-inbox hook failed: {error}"),
                        );
                    }
                }
            }
            Err(error) => {
                let reason = classify_receptor_error(&error);
                warn!(
                    message_id = %item.message_id,
                    handler = %item.handler_name,
                    attempts = item.attempts,
                    ?reason,
                    %error,
                    "receptor dispatch failed"
                );
                self.reports.inbox_failed(
                    item.message_id,
                    StatusFlags::STORED,
                    reason,
                    error.to_string(),
                );
            }
        }
    }
}

/// Map a receptor error onto the durable failure taxonomy.
///
/// A missing receptor and any unclassified receptor error both land on
/// `HandlerException`; only the explicit [`ReceptorError`] variants carry a
/// more specific reason.
fn classify_receptor_error(error: &anyhow::Error) -> FailureReason {
    match error.downcast_ref::<ReceptorError>() {
        Some(ReceptorError::Validation(_)) => FailureReason::ValidationFailed,
        Some(ReceptorError::BusinessRule(_)) => FailureReason::BusinessRuleViolation,
        Some(ReceptorError::Timeout(_)) => FailureReason::Timeout,
        None => FailureReason::HandlerException,
    }
}
