#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **weft-types** – Shared primitive data structures for the Weft runtime.
//!
//! The crate is dependency-light and sits at the very bottom of the crate
//! graph so that *every* other crate can depend on it without causing cycles.
//! It defines the time-ordered identifiers, the message envelope, the durable
//! row statuses and the coordinator request/response shapes. It intentionally
//! makes no assumptions about I/O, transports, or storage.

mod envelope;
mod ids;
mod message;

pub use envelope::{Envelope, Hop, HopType};
pub use ids::{
    CausationId, CorrelationId, EventId, IdGenerator, IdParseError, InstanceId, MessageId,
    StreamId,
};
pub use message::{
    DeliveryReceipt, EventRecord, FailureReason, InboxStatus, InboxWorkItem, InstanceDescriptor,
    NewEvent, NewInboxMessage, NewOutboxMessage, OutboxStatus, OutboxWorkItem, StatusFlags,
    WorkBatchRequest, WorkBatchResult, WorkCompletion, WorkFailure, WorkItemFlags,
};

/// Default lease duration, in seconds, applied to claimed work rows.
pub const DEFAULT_LEASE_SECONDS: i64 = 300;

/// Default number of partitions; must be identical across the fleet.
pub const DEFAULT_PARTITION_COUNT: i64 = 10_000;
