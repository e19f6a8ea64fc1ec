#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **weft-transport** – Transport port for the Weft runtime.
//!
//! Defines the publish/subscribe abstraction consumed by the outbox publisher
//! and inbox consumer workers, together with an in-memory driver used by
//! tests and single-process deployments. Concrete brokered drivers live in
//! separate crates and implement the same [`Transport`] trait.
//!
//! The core assumes at-least-once delivery from any driver; exactly-once is
//! constructed by the inbox's deduplicating store, not here.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use weft_types::Envelope;

/// Default per-destination ring buffer capacity for the in-memory driver.
const DEFAULT_TOPIC_CAPACITY: usize = 1024;

//─────────────────────────────
//  Capabilities
//─────────────────────────────

/// What a transport driver guarantees.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportCapabilities(pub u32);

impl TransportCapabilities {
    /// Driver fans a published envelope out to every subscriber.
    pub const PUB_SUB: TransportCapabilities = TransportCapabilities(1);
    /// Driver persists envelopes until acknowledged.
    pub const RELIABLE: TransportCapabilities = TransportCapabilities(2);
    /// Driver preserves publish order per destination.
    pub const ORDERED: TransportCapabilities = TransportCapabilities(4);

    /// Whether every capability in `other` is present.
    pub const fn contains(&self, other: TransportCapabilities) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for TransportCapabilities {
    type Output = TransportCapabilities;

    fn bitor(self, rhs: TransportCapabilities) -> TransportCapabilities {
        TransportCapabilities(self.0 | rhs.0)
    }
}

//─────────────────────────────
//  Subscription handles
//─────────────────────────────

/// Lifecycle state of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Envelopes are delivered to the handler.
    Active,
    /// Delivery is held back; envelopes wait in the driver's buffer.
    Paused,
    /// Terminal; no further delivery.
    Closed,
}

/// Controls one subscription created by [`Transport::subscribe`].
#[derive(Debug)]
pub struct SubscriptionHandle {
    state: watch::Sender<SubscriptionState>,
}

impl SubscriptionHandle {
    fn new(state: watch::Sender<SubscriptionState>) -> Self {
        Self { state }
    }

    /// Hold back delivery. No-op once closed.
    pub fn pause(&self) {
        self.state.send_if_modified(|s| {
            if *s == SubscriptionState::Active {
                *s = SubscriptionState::Paused;
                true
            } else {
                false
            }
        });
    }

    /// Resume delivery after a pause. No-op once closed.
    pub fn resume(&self) {
        self.state.send_if_modified(|s| {
            if *s == SubscriptionState::Paused {
                *s = SubscriptionState::Active;
                true
            } else {
                false
            }
        });
    }

    /// Close the subscription. Terminal.
    pub fn close(&self) {
        self.state.send_if_modified(|s| {
            if *s != SubscriptionState::Closed {
                *s = SubscriptionState::Closed;
                true
            } else {
                false
            }
        });
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SubscriptionState {
        *self.state.borrow()
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.close();
    }
}

//─────────────────────────────
//  Transport port
//─────────────────────────────

/// Predicate applied to incoming envelopes before the handler runs.
pub type SubscriptionFilter = Arc<dyn Fn(&Envelope) -> bool + Send + Sync>;

/// Handler invoked for each delivered envelope.
pub type SubscriptionHandler =
    Arc<dyn Fn(Envelope) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Abstract publish/subscribe interface consumed by the workers.
///
/// Implementations must be thread-safe; the runtime shares one driver across
/// all workers of an instance.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Publish an envelope to an opaque destination.
    ///
    /// Honors `cancel`: a cancelled token aborts the in-flight publish and
    /// surfaces an error to the caller.
    async fn publish(
        &self,
        envelope: Envelope,
        destination: &str,
        cancel: CancellationToken,
    ) -> Result<()>;

    /// Subscribe `handler` to envelopes arriving at `destination`.
    ///
    /// `filter`, when given, screens envelopes before the handler runs.
    /// The returned handle pauses, resumes, or closes the subscription.
    fn subscribe(
        &self,
        destination: &str,
        filter: Option<SubscriptionFilter>,
        handler: SubscriptionHandler,
    ) -> Result<SubscriptionHandle>;

    /// What this driver guarantees.
    fn capabilities(&self) -> TransportCapabilities;
}

//─────────────────────────────
//  In-memory driver
//─────────────────────────────

/// In-memory transport over per-destination broadcast channels.
///
/// Order is preserved per destination; there is no persistence, so a
/// subscriber that falls behind the ring buffer misses envelopes. Suitable
/// for tests and single-process deployments.
#[derive(Debug)]
pub struct MemoryTransport {
    capacity: usize,
    topics: Mutex<HashMap<String, broadcast::Sender<Envelope>>>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new(DEFAULT_TOPIC_CAPACITY)
    }
}

impl MemoryTransport {
    /// Create a driver whose per-destination buffers hold `capacity` envelopes.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            topics: Mutex::new(HashMap::new()),
        }
    }

    fn sender(&self, destination: &str) -> broadcast::Sender<Envelope> {
        let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        topics
            .entry(destination.to_owned())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    /// Number of active subscribers on `destination`.
    pub fn subscriber_count(&self, destination: &str) -> usize {
        let topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        topics
            .get(destination)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn publish(
        &self,
        envelope: Envelope,
        destination: &str,
        cancel: CancellationToken,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            anyhow::bail!("publish to {destination} cancelled");
        }
        // No subscribers is not an error; the envelope is simply dropped,
        // matching broker semantics for an unbound topic.
        let _ = self.sender(destination).send(envelope);
        Ok(())
    }

    fn subscribe(
        &self,
        destination: &str,
        filter: Option<SubscriptionFilter>,
        handler: SubscriptionHandler,
    ) -> Result<SubscriptionHandle> {
        let mut rx = self.sender(destination).subscribe();
        let (state_tx, mut state_rx) = watch::channel(SubscriptionState::Active);
        let destination = destination.to_owned();

        tokio::spawn(async move {
            loop {
                // Hold delivery while paused; envelopes queue in the ring buffer.
                while *state_rx.borrow() == SubscriptionState::Paused {
                    if state_rx.changed().await.is_err() {
                        return;
                    }
                }
                if *state_rx.borrow() == SubscriptionState::Closed {
                    return;
                }

                tokio::select! {
                    changed = state_rx.changed() => {
                        if changed.is_err() || *state_rx.borrow() == SubscriptionState::Closed {
                            return;
                        }
                    }
                    received = rx.recv() => match received {
                        Ok(envelope) => {
                            if let Some(filter) = &filter {
                                if !filter(&envelope) {
                                    continue;
                                }
                            }
                            let message_id = envelope.message_id;
                            if let Err(error) = handler(envelope).await {
                                warn!(%message_id, %destination, %error, "subscription handler failed");
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(%destination, skipped, "subscriber lagged, envelopes dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            debug!(%destination, "topic closed, ending subscription");
                            return;
                        }
                    },
                }
            }
        });

        Ok(SubscriptionHandle::new(state_tx))
    }

    fn capabilities(&self) -> TransportCapabilities {
        TransportCapabilities::PUB_SUB | TransportCapabilities::ORDERED
    }
}
