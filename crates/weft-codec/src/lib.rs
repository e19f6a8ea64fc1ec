#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **weft-codec** – Envelope wire codec for the Weft runtime.
//!
//! Serializes [`Envelope`]s to bytes and back over two wire formats: a
//! compact binary format (msgpack) and JSON. Payload type tags are resolved
//! through a [`CodecRegistry`] populated once at startup; decoding a tag that
//! was never registered is an error, and round-trip identity holds for every
//! registered type.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::de::DeserializeOwned;
use serde::Serialize;

use weft_types::Envelope;

//─────────────────────────────
//  Payload marker trait
//─────────────────────────────

/// Marker trait implemented by all serializable message payloads.
///
/// Automatically implemented for any type satisfying the required bounds.
pub trait Payload: Serialize + for<'de> serde::Deserialize<'de> + Send + Sync {}

impl<T> Payload for T where T: Serialize + for<'de> serde::Deserialize<'de> + Send + Sync {}

//─────────────────────────────
//  Wire formats
//─────────────────────────────

/// Encoding used on the wire and in the payload columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    /// msgpack via `rmp-serde`; the compact default.
    Binary,
    /// Human-readable JSON via `serde_json`.
    Json,
}

/// Encode any serializable value in the given wire format.
pub fn encode_value<T: Serialize>(value: &T, format: WireFormat) -> Result<Vec<u8>, CodecError> {
    match format {
        WireFormat::Binary => {
            rmp_serde::to_vec_named(value).map_err(|e| CodecError::Encode(e.to_string()))
        }
        WireFormat::Json => {
            serde_json::to_vec(value).map_err(|e| CodecError::Encode(e.to_string()))
        }
    }
}

/// Decode any deserializable value from the given wire format.
pub fn decode_value<T: DeserializeOwned>(
    bytes: &[u8],
    format: WireFormat,
) -> Result<T, CodecError> {
    match format {
        WireFormat::Binary => {
            rmp_serde::from_slice(bytes).map_err(|e| CodecError::Malformed(e.to_string()))
        }
        WireFormat::Json => {
            serde_json::from_slice(bytes).map_err(|e| CodecError::Malformed(e.to_string()))
        }
    }
}

//─────────────────────────────
//  Type-tag registry
//─────────────────────────────

type VerifyFn = Arc<dyn Fn(&[u8], WireFormat) -> Result<(), CodecError> + Send + Sync>;

/// Maps payload type tags to their codecs.
///
/// Populated during startup (registration goes through a shared reference,
/// like the other runtime registries) and effectively read-only afterwards;
/// the runtime shares it behind an `Arc`.
#[derive(Default)]
pub struct CodecRegistry {
    tags: RwLock<HashMap<String, VerifyFn>>,
}

impl CodecRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register payload type `T` under `tag`.
    ///
    /// Re-registering a tag replaces the previous entry.
    pub fn register<T: Payload + 'static>(&self, tag: impl Into<String>) {
        let mut tags = self.tags.write().unwrap_or_else(|e| e.into_inner());
        tags.insert(
            tag.into(),
            Arc::new(|bytes, format| {
                decode_value::<T>(bytes, format).map(|_| ())
            }),
        );
    }

    /// Whether `tag` was registered.
    pub fn is_registered(&self, tag: &str) -> bool {
        let tags = self.tags.read().unwrap_or_else(|e| e.into_inner());
        tags.contains_key(tag)
    }

    /// Number of registered tags.
    pub fn len(&self) -> usize {
        let tags = self.tags.read().unwrap_or_else(|e| e.into_inner());
        tags.len()
    }

    /// Whether no tags were registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check that `bytes` decode as the payload type registered under `tag`.
    pub fn verify_payload(
        &self,
        tag: &str,
        bytes: &[u8],
        format: WireFormat,
    ) -> Result<(), CodecError> {
        let verify = {
            let tags = self.tags.read().unwrap_or_else(|e| e.into_inner());
            tags.get(tag)
                .cloned()
                .ok_or_else(|| CodecError::UnknownTypeTag(tag.to_owned()))?
        };
        verify(bytes, format)
    }
}

impl std::fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tags = self.tags.read().unwrap_or_else(|e| e.into_inner());
        f.debug_struct("CodecRegistry")
            .field("tags", &tags.keys().collect::<Vec<_>>())
            .finish()
    }
}

//─────────────────────────────
//  Envelope codec
//─────────────────────────────

/// Serializes envelopes over one wire format, gated by the tag registry.
#[derive(Debug, Clone)]
pub struct EnvelopeCodec {
    format: WireFormat,
    registry: Arc<CodecRegistry>,
}

impl EnvelopeCodec {
    /// Build a codec over `registry` using `format` on the wire.
    pub fn new(format: WireFormat, registry: Arc<CodecRegistry>) -> Self {
        Self { format, registry }
    }

    /// Wire format this codec produces.
    pub fn format(&self) -> WireFormat {
        self.format
    }

    /// Serialize an envelope. The payload type must be registered.
    pub fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>, CodecError> {
        if !self.registry.is_registered(&envelope.payload_type) {
            return Err(CodecError::UnknownTypeTag(envelope.payload_type.clone()));
        }
        encode_value(envelope, self.format)
    }

    /// Deserialize an envelope previously produced by [`encode`](Self::encode).
    ///
    /// `type_tag` is the tag the receiver expects; it must be registered and
    /// must match the tag carried inside the envelope.
    pub fn decode(&self, bytes: &[u8], type_tag: &str) -> Result<Envelope, CodecError> {
        if !self.registry.is_registered(type_tag) {
            return Err(CodecError::UnknownTypeTag(type_tag.to_owned()));
        }
        let envelope: Envelope = decode_value(bytes, self.format)?;
        if envelope.payload_type != type_tag {
            return Err(CodecError::TagMismatch {
                expected: type_tag.to_owned(),
                actual: envelope.payload_type,
            });
        }
        self.registry
            .verify_payload(type_tag, &envelope.payload, self.format)?;
        Ok(envelope)
    }
}

//─────────────────────────────
//  Error types
//─────────────────────────────

/// Errors raised while encoding or decoding envelopes.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The payload type tag was never registered.
    #[error("unknown payload type tag: {0}")]
    UnknownTypeTag(String),
    /// The envelope carries a different tag than the receiver expected.
    #[error("payload tag mismatch: expected {expected}, got {actual}")]
    TagMismatch {
        /// Tag the receiver asked for.
        expected: String,
        /// Tag carried by the envelope.
        actual: String,
    },
    /// A value could not be encoded.
    #[error("failed to encode: {0}")]
    Encode(String),
    /// The bytes do not decode in the chosen wire format.
    #[error("malformed wire bytes: {0}")]
    Malformed(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use weft_types::{Hop, InstanceId, MessageId};

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct OrderPlaced {
        order: String,
        quantity: u32,
    }

    fn registry() -> Arc<CodecRegistry> {
        let registry = CodecRegistry::new();
        registry.register::<OrderPlaced>("orders.placed");
        Arc::new(registry)
    }

    fn envelope(format: WireFormat) -> Envelope {
        let payload = OrderPlaced {
            order: "A-100".into(),
            quantity: 3,
        };
        let mut env = Envelope::new(
            MessageId::generate(),
            "orders.placed",
            encode_value(&payload, format).unwrap(),
        );
        env.add_hop(Hop::new(InstanceId::generate(), None, None));
        env
    }

    #[test]
    fn binary_round_trip_is_identity() {
        let codec = EnvelopeCodec::new(WireFormat::Binary, registry());
        let env = envelope(WireFormat::Binary);
        let bytes = codec.encode(&env).unwrap();
        let decoded = codec.decode(&bytes, "orders.placed").unwrap();
        assert_eq!(decoded, env);
    }

    #[test]
    fn json_round_trip_is_identity() {
        let codec = EnvelopeCodec::new(WireFormat::Json, registry());
        let env = envelope(WireFormat::Json);
        let bytes = codec.encode(&env).unwrap();
        let decoded = codec.decode(&bytes, "orders.placed").unwrap();
        assert_eq!(decoded, env);
    }

    #[test]
    fn unknown_tag_is_rejected_on_encode_and_decode() {
        let codec = EnvelopeCodec::new(WireFormat::Binary, registry());
        let mut env = envelope(WireFormat::Binary);
        env.payload_type = "orders.unknown".into();

        assert!(matches!(
            codec.encode(&env),
            Err(CodecError::UnknownTypeTag(_))
        ));
        assert!(matches!(
            codec.decode(b"\x90", "orders.unknown"),
            Err(CodecError::UnknownTypeTag(_))
        ));
    }

    #[test]
    fn tag_mismatch_is_rejected() {
        let reg = CodecRegistry::new();
        reg.register::<OrderPlaced>("orders.placed");
        reg.register::<OrderPlaced>("orders.other");
        let codec = EnvelopeCodec::new(WireFormat::Binary, Arc::new(reg));

        let env = envelope(WireFormat::Binary);
        let bytes = codec.encode(&env).unwrap();
        assert!(matches!(
            codec.decode(&bytes, "orders.other"),
            Err(CodecError::TagMismatch { .. })
        ));
    }

    #[test]
    fn malformed_bytes_are_rejected() {
        let codec = EnvelopeCodec::new(WireFormat::Json, registry());
        let err = codec.decode(b"{ not json", "orders.placed").unwrap_err();
        assert!(matches!(err, CodecError::Malformed(_)));
    }

    #[test]
    fn payload_verification_uses_registered_type() {
        let reg = registry();
        let good = encode_value(
            &OrderPlaced {
                order: "A".into(),
                quantity: 1,
            },
            WireFormat::Json,
        )
        .unwrap();
        assert!(reg
            .verify_payload("orders.placed", &good, WireFormat::Json)
            .is_ok());
        assert!(reg
            .verify_payload("orders.placed", b"[]", WireFormat::Json)
            .is_err());
    }
}
