//! Durable message statuses, flag bitsets, and the coordinator batch shapes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{EventId, InstanceId, MessageId, StreamId};
use crate::DEFAULT_LEASE_SECONDS;

//─────────────────────────────
//  Row statuses
//─────────────────────────────

/// Status of an outbox row. Stored as a case-sensitive string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutboxStatus {
    /// Stored, waiting to be claimed.
    Pending,
    /// Claimed by an instance, publish in flight.
    Publishing,
    /// Delivered to the transport.
    Published,
    /// Publish failed; error and reason recorded on the row.
    Failed,
}

impl OutboxStatus {
    /// Canonical string form used in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Publishing => "Publishing",
            Self::Published => "Published",
            Self::Failed => "Failed",
        }
    }

    /// Parse the canonical string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Pending" => Some(Self::Pending),
            "Publishing" => Some(Self::Publishing),
            "Published" => Some(Self::Published),
            "Failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Status of an inbox row. Stored as a case-sensitive string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InboxStatus {
    /// Stored, waiting to be claimed.
    Pending,
    /// Claimed by an instance, receptor dispatch in flight.
    Processing,
    /// Receptor finished successfully.
    Completed,
    /// Dispatch failed; error and reason recorded on the row.
    Failed,
}

impl InboxStatus {
    /// Canonical string form used in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Processing => "Processing",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
        }
    }

    /// Parse the canonical string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Pending" => Some(Self::Pending),
            "Processing" => Some(Self::Processing),
            "Completed" => Some(Self::Completed),
            "Failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

//─────────────────────────────
//  Status flags
//─────────────────────────────

/// Bitset tracking which lifecycle milestones a row has reached.
///
/// Flags are OR-merged by the coordinator: a milestone once reached is never
/// un-reached, which is what makes completion reporting idempotent.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct StatusFlags(pub u32);

impl StatusFlags {
    /// No milestones reached.
    pub const NONE: StatusFlags = StatusFlags(0);
    /// Row durably stored.
    pub const STORED: StatusFlags = StatusFlags(1);
    /// Event-store record appended for this row.
    pub const EVENT_STORED: StatusFlags = StatusFlags(2);
    /// Delivered to the transport.
    pub const PUBLISHED: StatusFlags = StatusFlags(4);
    /// Local receptor ran to completion.
    pub const RECEPTOR_PROCESSED: StatusFlags = StatusFlags(8);
    /// Terminal failure recorded.
    pub const FAILED: StatusFlags = StatusFlags(32_768);

    /// Whether every flag in `other` is set in `self`.
    pub const fn contains(&self, other: StatusFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Union of both flag sets.
    pub const fn union(&self, other: StatusFlags) -> StatusFlags {
        StatusFlags(self.0 | other.0)
    }

    /// Set the given flags in place.
    pub fn insert(&mut self, other: StatusFlags) {
        self.0 |= other.0;
    }

    /// Whether no flags are set.
    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for StatusFlags {
    type Output = StatusFlags;

    fn bitor(self, rhs: StatusFlags) -> StatusFlags {
        self.union(rhs)
    }
}

//─────────────────────────────
//  Failure reasons
//─────────────────────────────

/// Classified failure cause, stored as a small integer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    /// No failure recorded.
    None,
    /// Event-store version conflict with a concurrent writer.
    OptimisticConcurrency,
    /// Transport rejected the publish or was unreachable.
    TransportUnavailable,
    /// Operation exceeded its deadline.
    Timeout,
    /// Payload could not be encoded or decoded.
    SerializationError,
    /// Receptor rejected the message contents.
    ValidationFailed,
    /// Receptor raised a domain rule violation.
    BusinessRuleViolation,
    /// Receptor raised an unexpected error.
    HandlerException,
    /// Unclassified failure.
    #[default]
    Unknown,
}

impl FailureReason {
    /// Integer code stored in the database. `Unknown` is 99.
    pub fn as_i32(&self) -> i32 {
        match self {
            Self::None => 0,
            Self::OptimisticConcurrency => 1,
            Self::TransportUnavailable => 2,
            Self::Timeout => 3,
            Self::SerializationError => 4,
            Self::ValidationFailed => 5,
            Self::BusinessRuleViolation => 6,
            Self::HandlerException => 7,
            Self::Unknown => 99,
        }
    }

    /// Decode the integer code; anything unrecognized is `Unknown`.
    pub fn from_i32(code: i32) -> Self {
        match code {
            0 => Self::None,
            1 => Self::OptimisticConcurrency,
            2 => Self::TransportUnavailable,
            3 => Self::Timeout,
            4 => Self::SerializationError,
            5 => Self::ValidationFailed,
            6 => Self::BusinessRuleViolation,
            7 => Self::HandlerException,
            _ => Self::Unknown,
        }
    }

    /// Whether the coordinator should schedule a backoff retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::TransportUnavailable | Self::Timeout | Self::Unknown
        )
    }
}

//─────────────────────────────
//  Work item flags
//─────────────────────────────

/// Tags attached to each claimed work item describing how it was obtained.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct WorkItemFlags(pub u32);

impl WorkItemFlags {
    /// No tags.
    pub const NONE: WorkItemFlags = WorkItemFlags(0);
    /// Stored by this very coordinator call.
    pub const NEWLY_STORED: WorkItemFlags = WorkItemFlags(1);
    /// Reclaimed from another instance's expired lease.
    pub const ORPHANED: WorkItemFlags = WorkItemFlags(2);
    /// Row carries an event destined for the event store.
    pub const FROM_EVENT_STORE: WorkItemFlags = WorkItemFlags(4);
    /// Row re-entered the pool after a transient failure backoff.
    pub const RETRY_AFTER_FAILURE: WorkItemFlags = WorkItemFlags(8);
    /// Diagnostic replay; handlers may relax side effects.
    pub const DEBUG_MODE: WorkItemFlags = WorkItemFlags(16);
    /// Claimed ahead of normal ordering.
    pub const HIGH_PRIORITY: WorkItemFlags = WorkItemFlags(32);

    /// Whether every flag in `other` is set in `self`.
    pub const fn contains(&self, other: WorkItemFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Set the given flags in place.
    pub fn insert(&mut self, other: WorkItemFlags) {
        self.0 |= other.0;
    }
}

//─────────────────────────────
//  Coordinator batch shapes
//─────────────────────────────

/// Identity of the calling service instance, upserted on every cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceDescriptor {
    /// Stable identifier of this instance for the life of the process.
    pub instance_id: InstanceId,
    /// Logical service name shared by all instances of a deployment.
    pub service_name: String,
    /// Host the instance runs on.
    pub host_name: String,
    /// Operating-system process id.
    pub process_id: i64,
    /// Optional instance metadata.
    pub metadata: Option<serde_json::Value>,
}

/// A message-lifecycle completion observed since the previous cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkCompletion {
    /// Row the completion refers to.
    pub message_id: MessageId,
    /// Milestones reached; OR-merged into the row's flags.
    pub flags: StatusFlags,
}

/// A message-lifecycle failure observed since the previous cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkFailure {
    /// Row the failure refers to.
    pub message_id: MessageId,
    /// Milestones the row reached before failing (e.g. `STORED`).
    pub reached: StatusFlags,
    /// Classified cause.
    pub reason: FailureReason,
    /// Human-readable error text for operator inspection.
    pub error: String,
}

/// A newly produced outbound message to store on the next cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewOutboxMessage {
    /// Message identifier; the primary key deduplicating stores.
    pub message_id: MessageId,
    /// Opaque transport destination.
    pub destination: String,
    /// Payload type tag.
    pub type_tag: String,
    /// Serialized payload bytes.
    pub payload: Vec<u8>,
    /// Optional message metadata.
    pub metadata: Option<serde_json::Value>,
    /// Optional tenancy scope.
    pub scope: Option<String>,
    /// Stream the message belongs to, when ordered processing is required.
    pub stream_id: Option<StreamId>,
    /// Whether publishing this message also appends to the event store.
    pub is_event: bool,
    /// Earliest time the row may be claimed.
    pub scheduled_for: Option<DateTime<Utc>>,
}

/// A newly received inbound message to store on the next cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewInboxMessage {
    /// Message identifier; the primary key deduplicating receives.
    pub message_id: MessageId,
    /// Name of the receptor this message is addressed to.
    pub handler_name: String,
    /// Payload type tag.
    pub type_tag: String,
    /// Serialized payload bytes.
    pub payload: Vec<u8>,
    /// Optional message metadata.
    pub metadata: Option<serde_json::Value>,
    /// Optional tenancy scope.
    pub scope: Option<String>,
    /// Stream the message belongs to, when ordered processing is required.
    pub stream_id: Option<StreamId>,
    /// Whether processing this message also appends to the event store.
    pub is_event: bool,
}

/// One claimed outbox row handed back to the publisher worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxWorkItem {
    /// Row identifier.
    pub message_id: MessageId,
    /// Opaque transport destination.
    pub destination: String,
    /// Payload type tag.
    pub type_tag: String,
    /// Serialized payload bytes.
    pub payload: Vec<u8>,
    /// Optional message metadata.
    pub metadata: Option<serde_json::Value>,
    /// Stream the row belongs to.
    pub stream_id: Option<StreamId>,
    /// Partition derived from the stream id.
    pub partition_number: Option<i64>,
    /// Whether the row feeds the event store on completion.
    pub is_event: bool,
    /// Publish attempts so far.
    pub attempts: i64,
    /// How the row was obtained.
    pub flags: WorkItemFlags,
}

/// One claimed inbox row handed back to the consumer worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboxWorkItem {
    /// Row identifier.
    pub message_id: MessageId,
    /// Name of the receptor this row is addressed to.
    pub handler_name: String,
    /// Payload type tag.
    pub type_tag: String,
    /// Serialized payload bytes.
    pub payload: Vec<u8>,
    /// Optional message metadata.
    pub metadata: Option<serde_json::Value>,
    /// Stream the row belongs to.
    pub stream_id: Option<StreamId>,
    /// Partition derived from the stream id.
    pub partition_number: Option<i64>,
    /// Whether the row feeds the event store on completion.
    pub is_event: bool,
    /// Dispatch attempts so far.
    pub attempts: i64,
    /// How the row was obtained.
    pub flags: WorkItemFlags,
}

/// Full input of one `process_work_batch` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkBatchRequest {
    /// Calling instance identity; heartbeat target.
    pub instance: InstanceDescriptor,
    /// Outbox completions from the previous cycle.
    pub outbox_completions: Vec<WorkCompletion>,
    /// Outbox failures from the previous cycle.
    pub outbox_failures: Vec<WorkFailure>,
    /// Inbox completions from the previous cycle.
    pub inbox_completions: Vec<WorkCompletion>,
    /// Inbox failures from the previous cycle.
    pub inbox_failures: Vec<WorkFailure>,
    /// Newly produced outbound messages.
    pub new_outbox: Vec<NewOutboxMessage>,
    /// Newly received inbound messages.
    pub new_inbox: Vec<NewInboxMessage>,
    /// Lease duration granted to claimed rows.
    pub lease_seconds: i64,
}

impl WorkBatchRequest {
    /// An otherwise-empty request for `instance`: heartbeat plus claim.
    pub fn empty(instance: InstanceDescriptor) -> Self {
        Self {
            instance,
            outbox_completions: Vec::new(),
            outbox_failures: Vec::new(),
            inbox_completions: Vec::new(),
            inbox_failures: Vec::new(),
            new_outbox: Vec::new(),
            new_inbox: Vec::new(),
            lease_seconds: DEFAULT_LEASE_SECONDS,
        }
    }
}

/// Full output of one `process_work_batch` call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkBatchResult {
    /// Outbox rows leased to the caller.
    pub outbox_work: Vec<OutboxWorkItem>,
    /// Inbox rows leased to the caller.
    pub inbox_work: Vec<InboxWorkItem>,
}

//─────────────────────────────
//  Receipts and event records
//─────────────────────────────

/// Returned by `Dispatcher::send` once a message is accepted for storage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    /// Identifier the message will be stored and published under.
    pub message_id: MessageId,
    /// When the runtime accepted the message.
    pub accepted_at: DateTime<Utc>,
}

/// An event to append to a stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEvent {
    /// Event identifier.
    pub event_id: EventId,
    /// Event type tag.
    pub type_tag: String,
    /// Serialized payload bytes.
    pub payload: Vec<u8>,
    /// Optional event metadata.
    pub metadata: Option<serde_json::Value>,
    /// Optional tenancy scope.
    pub scope: Option<String>,
}

/// A committed event-store record. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Global append order, monotone across all streams.
    pub seq_id: i64,
    /// Event identifier.
    pub event_id: EventId,
    /// Stream the event belongs to.
    pub stream_id: StreamId,
    /// Position within the stream, contiguous from 1.
    pub version: i64,
    /// Event type tag.
    pub type_tag: String,
    /// Serialized payload bytes.
    pub payload: Vec<u8>,
    /// Optional event metadata.
    pub metadata: Option<serde_json::Value>,
    /// Optional tenancy scope.
    pub scope: Option<String>,
    /// When the record was written.
    pub created_at: DateTime<Utc>,
}
