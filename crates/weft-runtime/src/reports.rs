//! Completion and failure reports accumulated between coordinator cycles.
//!
//! Workers push outcomes here as they finish each boundary operation; the
//! cycle loop drains everything into the next `process_work_batch` call. On
//! a coordinator error the drained reports are pushed back so nothing is
//! lost across a retried cycle.

use std::sync::Mutex;

use weft_types::{
    FailureReason, MessageId, NewInboxMessage, NewOutboxMessage, StatusFlags, WorkCompletion,
    WorkFailure,
};

/// Everything a cycle feeds into the coordinator besides claims.
#[derive(Debug, Default)]
pub struct CycleInput {
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
}

impl CycleInput {
    /// Whether the input carries nothing at all.
    pub fn is_empty(&self) -> bool {
        self.outbox_completions.is_empty()
            && self.outbox_failures.is_empty()
            && self.inbox_completions.is_empty()
            && self.inbox_failures.is_empty()
            && self.new_outbox.is_empty()
            && self.new_inbox.is_empty()
    }
}

/// Thread-safe accumulator shared by the workers and the cycle loop.
#[derive(Debug, Default)]
pub struct CycleReports {
    inner: Mutex<CycleInput>,
}

impl CycleReports {
    /// Create an empty accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful outbox publish.
    pub fn outbox_completed(&self, message_id: MessageId, flags: StatusFlags) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .outbox_completions
            .push(WorkCompletion { message_id, flags });
    }

    /// Record a failed outbox publish.
    pub fn outbox_failed(
        &self,
        message_id: MessageId,
        reached: StatusFlags,
        reason: FailureReason,
        error: String,
    ) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.outbox_failures.push(WorkFailure {
            message_id,
            reached,
            reason,
            error,
        });
    }

    /// Record a successful inbox dispatch.
    pub fn inbox_completed(&self, message_id: MessageId, flags: StatusFlags) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .inbox_completions
            .push(WorkCompletion { message_id, flags });
    }

    /// Record a failed inbox dispatch.
    pub fn inbox_failed(
        &self,
        message_id: MessageId,
        reached: StatusFlags,
        reason: FailureReason,
        error: String,
    ) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.inbox_failures.push(WorkFailure {
            message_id,
            reached,
            reason,
            error,
        });
    }

    /// Queue a newly received inbound message for the next cycle.
    pub fn inbox_received(&self, message: NewInboxMessage) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.new_inbox.push(message);
    }

    /// Take the accumulated input, leaving the accumulator empty.
    pub fn drain(&self) -> CycleInput {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *inner)
    }

    /// Return a drained input after a failed coordinator call so the next
    /// cycle retries it.
    pub fn restore(&self, mut input: CycleInput) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .outbox_completions
            .append(&mut input.outbox_completions);
        inner.outbox_failures.append(&mut input.outbox_failures);
        inner
            .inbox_completions
            .append(&mut input.inbox_completions);
        inner.inbox_failures.append(&mut input.inbox_failures);
        inner.new_outbox.append(&mut input.new_outbox);
        inner.new_inbox.append(&mut input.new_inbox);
    }
}
