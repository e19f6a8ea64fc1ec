//! Transport-level message envelope.
//!
//! An envelope wraps a serialized payload with its identifiers and an ordered
//! list of hops. Each hop records the service instance that handled the
//! envelope, when, and under which correlation/causation identifiers. Hops
//! reference instances by id only; envelopes own their hops outright.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{CausationId, CorrelationId, InstanceId, MessageId};

//─────────────────────────────
//  Hops
//─────────────────────────────

/// Role of a hop within the envelope's journey.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HopType {
    /// The hop of the instance currently holding the envelope.
    Current,
    /// A prior hop, demoted when a newer one was appended.
    Causation,
}

/// One leg of an envelope's journey through the fleet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hop {
    /// Instance that recorded this hop.
    pub instance: InstanceId,
    /// Whether this hop is the current one.
    pub hop_type: HopType,
    /// When the hop was recorded.
    pub recorded_at: DateTime<Utc>,
    /// Correlation identifier carried by this hop.
    pub correlation_id: Option<CorrelationId>,
    /// Causation identifier carried by this hop.
    pub causation_id: Option<CausationId>,
    /// Optional application metadata attached to the hop.
    pub metadata: Option<serde_json::Value>,
}

impl Hop {
    /// Build a hop for `instance` stamped with the current time.
    pub fn new(
        instance: InstanceId,
        correlation_id: Option<CorrelationId>,
        causation_id: Option<CausationId>,
    ) -> Self {
        Self {
            instance,
            hop_type: HopType::Current,
            recorded_at: Utc::now(),
            correlation_id,
            causation_id,
            metadata: None,
        }
    }
}

//─────────────────────────────
//  Envelope
//─────────────────────────────

/// Wraps a serialized payload with identifiers and the hop trail.
///
/// Envelopes are value objects: equality compares the full structural
/// contents, payload bytes included.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Identifier of the wrapped message.
    pub message_id: MessageId,
    /// Type tag of the payload, resolved through the codec registry.
    pub payload_type: String,
    /// Serialized payload bytes.
    pub payload: Vec<u8>,
    /// Ordered hop trail, oldest first.
    pub hops: Vec<Hop>,
}

impl Envelope {
    /// Create an envelope with no hops.
    pub fn new(message_id: MessageId, payload_type: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            message_id,
            payload_type: payload_type.into(),
            payload,
            hops: Vec::new(),
        }
    }

    /// Append a hop, demoting every existing `Current` hop to `Causation`.
    ///
    /// After every append exactly one hop is `Current`: the newest.
    pub fn add_hop(&mut self, mut hop: Hop) {
        for existing in &mut self.hops {
            if existing.hop_type == HopType::Current {
                existing.hop_type = HopType::Causation;
            }
        }
        hop.hop_type = HopType::Current;
        self.hops.push(hop);
    }

    /// The newest `Current` hop, if any hops were recorded.
    pub fn current_hop(&self) -> Option<&Hop> {
        self.hops.iter().rev().find(|h| h.hop_type == HopType::Current)
    }

    /// Correlation identifier of the current hop.
    pub fn correlation_id(&self) -> Option<CorrelationId> {
        self.current_hop().and_then(|h| h.correlation_id)
    }

    /// Causation identifier of the current hop.
    pub fn causation_id(&self) -> Option<CausationId> {
        self.current_hop().and_then(|h| h.causation_id)
    }
}
