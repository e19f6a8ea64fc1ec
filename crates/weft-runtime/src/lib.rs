#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **weft-runtime** – Worker loops and runtime wiring for Weft.
//!
//! Assembles the store, transport, dispatcher, lifecycle hooks, and policy
//! engine into one [`WeftRuntime`] per service instance. The runtime drives
//! three loops: the coordinator cycle (claim work, publish, dispatch, report
//! back), the partition-ownership heartbeat, and the perspective replay.
//! Everything shuts down cooperatively through one cancellation token; leases
//! on unfinished rows expire naturally and other instances pick them up.

mod config;
mod inbox_worker;
mod outbox_worker;
mod perspective;
mod reports;
mod runtime;

pub use config::RuntimeConfig;
pub use inbox_worker::{InboundRoute, InboxConsumer, StreamKeyFn};
pub use outbox_worker::OutboxPublisher;
pub use perspective::{
    ApplyFn, CheckpointMode, Perspective, PerspectiveRegistry, PerspectiveStatus,
    PerspectiveWorker,
};
pub use reports::{CycleInput, CycleReports};
pub use runtime::WeftRuntime;
