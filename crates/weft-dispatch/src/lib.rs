#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **weft-dispatch** – Local message dispatch for the Weft runtime.
//!
//! Routes messages to their locally registered receptors. Two paths exist:
//! a direct in-process call (`local_invoke`, no persistence, no transport)
//! and the durable `send` path, which hands the message to the next
//! coordinator cycle and returns a delivery receipt. The publish policy
//! engine that chooses destinations for outbound messages lives in
//! [`policy`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use anyhow::Result;
use chrono::Utc;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use weft_types::{
    CausationId, CorrelationId, DeliveryReceipt, MessageId, NewOutboxMessage,
};

pub mod policy;

pub use policy::{PolicyContext, PolicyEngine, PublishConfig};

//─────────────────────────────
//  Receptor contract
//─────────────────────────────

/// Context handed to a receptor invocation.
#[derive(Debug, Clone)]
pub struct ReceptorContext {
    /// Message being dispatched.
    pub message_id: MessageId,
    /// Correlation identifier inherited from the envelope, if any.
    pub correlation_id: Option<CorrelationId>,
    /// Causation identifier inherited from the envelope, if any.
    pub causation_id: Option<CausationId>,
    /// Optional message metadata.
    pub metadata: Option<serde_json::Value>,
    /// Cancellation signal of the owning worker.
    pub cancel: CancellationToken,
}

impl ReceptorContext {
    /// A bare context for `message_id` with no inherited identifiers.
    pub fn for_message(message_id: MessageId) -> Self {
        Self {
            message_id,
            correlation_id: None,
            causation_id: None,
            metadata: None,
            cancel: CancellationToken::new(),
        }
    }
}

/// What a receptor produced.
///
/// Receptors come in several shapes (returning nothing, one message, or
/// several); the dispatcher flattens `Many` into individual outbound
/// messages.
#[derive(Debug, Clone, PartialEq)]
pub enum ReceptorOutput {
    /// Nothing produced.
    Void,
    /// One outbound message produced.
    Single(NewOutboxMessage),
    /// Several outbound messages produced.
    Many(Vec<NewOutboxMessage>),
}

impl ReceptorOutput {
    /// Flatten into the produced outbound messages.
    pub fn into_messages(self) -> Vec<NewOutboxMessage> {
        match self {
            Self::Void => Vec::new(),
            Self::Single(message) => vec![message],
            Self::Many(messages) => messages,
        }
    }
}

/// A registered receptor: serialized payload in, produced messages out.
pub type ReceptorFn =
    Arc<dyn Fn(Vec<u8>, ReceptorContext) -> BoxFuture<'static, Result<ReceptorOutput>> + Send + Sync>;

//─────────────────────────────
//  Receptor registry
//─────────────────────────────

/// Maps payload type tags to receptors.
///
/// Populated at startup from generated registration glue; dispatch is a
/// single hash lookup.
#[derive(Default)]
pub struct ReceptorRegistry {
    receptors: RwLock<HashMap<String, ReceptorFn>>,
}

impl ReceptorRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the receptor for `type_tag`, replacing any previous one.
    pub fn register(&self, type_tag: impl Into<String>, receptor: ReceptorFn) {
        let mut receptors = self.receptors.write().unwrap_or_else(|e| e.into_inner());
        receptors.insert(type_tag.into(), receptor);
    }

    /// The receptor registered for `type_tag`.
    pub fn get(&self, type_tag: &str) -> Option<ReceptorFn> {
        let receptors = self.receptors.read().unwrap_or_else(|e| e.into_inner());
        receptors.get(type_tag).cloned()
    }

    /// Whether a receptor is registered for `type_tag`.
    pub fn is_registered(&self, type_tag: &str) -> bool {
        let receptors = self.receptors.read().unwrap_or_else(|e| e.into_inner());
        receptors.contains_key(type_tag)
    }
}

impl std::fmt::Debug for ReceptorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let receptors = self.receptors.read().unwrap_or_else(|e| e.into_inner());
        f.debug_struct("ReceptorRegistry")
            .field("type_tags", &receptors.keys().collect::<Vec<_>>())
            .finish()
    }
}

//─────────────────────────────
//  Dispatcher
//─────────────────────────────

/// Deterministic error codes produced by the dispatcher.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum DispatchError {
    /// `local_invoke` found no receptor for the message type.
    #[error("no receptor registered for type tag {0:?}")]
    HandlerNotFound(String),
}

/// Classified failures a receptor may raise.
///
/// Receptors return these (wrapped in `anyhow`) when they want the failure
/// recorded under a specific reason; anything else they raise is classified
/// as a handler exception.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ReceptorError {
    /// The message contents failed validation; not retried.
    #[error("validation failed: {0}")]
    Validation(String),
    /// A domain rule rejected the message; not retried.
    #[error("business rule violation: {0}")]
    BusinessRule(String),
    /// The receptor exceeded its deadline.
    #[error("receptor timed out: {0}")]
    Timeout(String),
}

/// Routes messages to local receptors and accepts durable sends.
pub struct Dispatcher {
    receptors: Arc<ReceptorRegistry>,
    outbound: Mutex<Vec<NewOutboxMessage>>,
}

impl Dispatcher {
    /// Build a dispatcher over a shared receptor registry.
    pub fn new(receptors: Arc<ReceptorRegistry>) -> Self {
        Self {
            receptors,
            outbound: Mutex::new(Vec::new()),
        }
    }

    /// The registry this dispatcher routes through.
    pub fn receptors(&self) -> &Arc<ReceptorRegistry> {
        &self.receptors
    }

    /// Direct in-process call: no persistence, no transport.
    ///
    /// Fails with [`DispatchError::HandlerNotFound`] when nothing is
    /// registered for `type_tag`; receptor errors propagate as-is.
    pub async fn local_invoke(
        &self,
        type_tag: &str,
        payload: Vec<u8>,
        ctx: ReceptorContext,
    ) -> Result<ReceptorOutput> {
        let receptor = self
            .receptors
            .get(type_tag)
            .ok_or_else(|| DispatchError::HandlerNotFound(type_tag.to_owned()))?;
        receptor(payload, ctx).await
    }

    /// Durable send: queue the message for the next coordinator cycle.
    ///
    /// Never requires a local receptor. The receipt's `message_id` is the
    /// identifier the message will be stored and published under.
    pub fn send(&self, message: NewOutboxMessage) -> DeliveryReceipt {
        let receipt = DeliveryReceipt {
            message_id: message.message_id,
            accepted_at: Utc::now(),
        };
        let mut outbound = self.outbound.lock().unwrap_or_else(|e| e.into_inner());
        outbound.push(message);
        receipt
    }

    /// Take every message queued by [`send`](Self::send) since the last drain.
    ///
    /// Called by the outbox worker once per polling cycle.
    pub fn drain_outbound(&self) -> Vec<NewOutboxMessage> {
        let mut outbound = self.outbound.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *outbound)
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pending = self.outbound.lock().unwrap_or_else(|e| e.into_inner()).len();
        f.debug_struct("Dispatcher")
            .field("receptors", &self.receptors)
            .field("pending_outbound", &pending)
            .finish()
    }
}
