//! Time-ordered 128-bit identifiers.
//!
//! Identifiers follow the UUIDv7 layout: 48 bits of unix milliseconds, the
//! version/variant bits, and a random tail. Within one process successive
//! identifiers are strictly monotone, including many draws in the same
//! millisecond and across small backwards clock steps; across processes the
//! ordering skew is bounded by wall-clock skew.

use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use chrono::{DateTime, TimeZone, Utc};
use once_cell::sync::Lazy;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

//─────────────────────────────
//  Parse error
//─────────────────────────────

/// Returned when an identifier cannot be parsed from its canonical
/// 36-character hyphenated string form.
#[derive(Debug, thiserror::Error)]
#[error("malformed identifier {input:?}: {source}")]
pub struct IdParseError {
    /// The string that failed to parse.
    pub input: String,
    #[source]
    source: uuid::Error,
}

//─────────────────────────────
//  Generator
//─────────────────────────────

struct GeneratorState {
    last_millis: u64,
    counter: u16,
}

/// Strictly monotone UUIDv7-layout identifier generator.
///
/// The 12 `rand_a` bits carry a per-millisecond counter; the 62 `rand_b`
/// bits stay random. When the counter would overflow the generator borrows
/// the next millisecond, and a backwards clock step never re-issues a
/// smaller timestamp than the last one used.
pub struct IdGenerator {
    state: Mutex<GeneratorState>,
}

impl IdGenerator {
    /// Create a fresh generator with its own monotonicity window.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GeneratorState {
                last_millis: 0,
                counter: 0,
            }),
        }
    }

    /// The process-wide generator used by the `generate()` constructors.
    pub fn global() -> &'static IdGenerator {
        static GLOBAL: Lazy<IdGenerator> = Lazy::new(IdGenerator::new);
        &GLOBAL
    }

    /// Draw the next identifier.
    pub fn next_id(&self) -> Uuid {
        let now = Utc::now().timestamp_millis().max(0) as u64;
        let (millis, counter) = {
            // Lock poisoning cannot occur: no code below panics while held.
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if now > state.last_millis {
                state.last_millis = now;
                state.counter = 0;
            } else if state.counter < 0x0fff {
                state.counter += 1;
            } else {
                // Counter exhausted within this millisecond: borrow the next.
                state.last_millis += 1;
                state.counter = 0;
            }
            (state.last_millis, state.counter)
        };

        let mut tail = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut tail);
        let rand_b = u64::from_be_bytes(tail) & 0x3fff_ffff_ffff_ffff;

        let mut value: u128 = (millis as u128 & 0xffff_ffff_ffff) << 80;
        value |= 0x7u128 << 76; // version 7
        value |= (counter as u128 & 0x0fff) << 64;
        value |= 0b10u128 << 62; // RFC 4122 variant
        value |= rand_b as u128;
        Uuid::from_u128(value)
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Extract the millisecond timestamp prefix of a v7-layout identifier.
pub(crate) fn id_timestamp(id: &Uuid) -> DateTime<Utc> {
    let millis = (id.as_u128() >> 80) as i64;
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

//─────────────────────────────
//  Newtype wrappers
//─────────────────────────────

macro_rules! define_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Draw a fresh time-ordered identifier from the global generator.
            pub fn generate() -> Self {
                Self(IdGenerator::global().next_id())
            }

            /// Wrap an existing UUID value.
            pub const fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }

            /// The raw 128-bit value.
            pub const fn as_u128(&self) -> u128 {
                self.0.as_u128()
            }

            /// The millisecond timestamp encoded in the identifier prefix.
            pub fn timestamp(&self) -> DateTime<Utc> {
                id_timestamp(&self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0.hyphenated())
            }
        }

        impl FromStr for $name {
            type Err = IdParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map($name).map_err(|source| IdParseError {
                    input: s.to_owned(),
                    source,
                })
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl From<$name> for Uuid {
            fn from(id: $name) -> Uuid {
                id.0
            }
        }
    };
}

define_id! {
    /// Identifier of a single message in the outbox or inbox.
    MessageId
}
define_id! {
    /// Identifier of an ordered event stream.
    StreamId
}
define_id! {
    /// Identifier of a committed event-store record.
    EventId
}
define_id! {
    /// Correlation identifier shared across a causal chain of messages.
    CorrelationId
}
define_id! {
    /// Identifier of the message that caused the current one.
    CausationId
}
define_id! {
    /// Identifier of a running service instance.
    InstanceId
}
