#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **weft-lifecycle** – Cross-cutting lifecycle hooks for the Weft runtime.
//!
//! Hooks are registered per `(payload type, stage)` and dispatched by the
//! workers around every outbox publish and inbox dispatch. Inline stages
//! block the worker and their failure fails the message; async stages are
//! fire-and-forget, their outcome is logged and never affects the message's
//! fate.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use anyhow::Result;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use weft_types::MessageId;

//─────────────────────────────
//  Stages
//─────────────────────────────

/// Closed set of lifecycle stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Before publish; blocks, failure fails the message.
    PreDistributeInline,
    /// Before publish; fire-and-forget.
    PreDistributeAsync,
    /// Concurrent with the publish I/O; fire-and-forget.
    DistributeAsync,
    /// After publish; fire-and-forget.
    PostDistributeAsync,
    /// After publish; blocks, failure fails the message.
    PostDistributeInline,
    /// Before receptor dispatch; blocks, failure fails the message.
    PreInboxInline,
    /// Before receptor dispatch; fire-and-forget.
    PreInboxAsync,
    /// After receptor dispatch; fire-and-forget.
    PostInboxAsync,
    /// After receptor dispatch; blocks, failure fails the message.
    PostInboxInline,
}

impl Stage {
    /// Whether this stage blocks the worker until its hooks return.
    pub fn is_inline(&self) -> bool {
        matches!(
            self,
            Self::PreDistributeInline
                | Self::PostDistributeInline
                | Self::PreInboxInline
                | Self::PostInboxInline
        )
    }
}

//─────────────────────────────
//  Hooks
//─────────────────────────────

/// Context handed to every hook invocation.
#[derive(Debug, Clone)]
pub struct HookContext {
    /// Message the boundary operation concerns.
    pub message_id: MessageId,
    /// Payload type tag of the message.
    pub type_tag: String,
    /// Stage being dispatched.
    pub stage: Stage,
    /// Optional message metadata.
    pub metadata: Option<serde_json::Value>,
    /// Cancellation signal of the owning worker.
    pub cancel: CancellationToken,
}

/// A registered lifecycle hook.
pub type Hook = Arc<dyn Fn(HookContext) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Token returned by [`LifecycleRegistry::register`], used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookId(u64);

//─────────────────────────────
//  Registry
//─────────────────────────────

/// Maps `(type tag, stage)` to an ordered hook list.
///
/// Registration order is invocation order within a stage. The registry is
/// populated during startup but supports late registration and removal; all
/// access goes through a read/write lock with short critical sections.
#[derive(Default)]
pub struct LifecycleRegistry {
    hooks: RwLock<HashMap<(String, Stage), Vec<(HookId, Hook)>>>,
    next_id: AtomicU64,
}

impl LifecycleRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `hook` to the list for `(type_tag, stage)`.
    pub fn register(&self, type_tag: impl Into<String>, stage: Stage, hook: Hook) -> HookId {
        let id = HookId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut hooks = self.hooks.write().unwrap_or_else(|e| e.into_inner());
        hooks
            .entry((type_tag.into(), stage))
            .or_default()
            .push((id, hook));
        id
    }

    /// Remove a previously registered hook. Idempotent.
    pub fn unregister(&self, id: HookId) {
        let mut hooks = self.hooks.write().unwrap_or_else(|e| e.into_inner());
        for list in hooks.values_mut() {
            list.retain(|(hook_id, _)| *hook_id != id);
        }
    }

    /// Hooks registered for `(type_tag, stage)`, in registration order.
    pub fn hooks_for(&self, type_tag: &str, stage: Stage) -> Vec<Hook> {
        let hooks = self.hooks.read().unwrap_or_else(|e| e.into_inner());
        hooks
            .get(&(type_tag.to_owned(), stage))
            .map(|list| list.iter().map(|(_, hook)| hook.clone()).collect())
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for LifecycleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let hooks = self.hooks.read().unwrap_or_else(|e| e.into_inner());
        f.debug_struct("LifecycleRegistry")
            .field("stages", &hooks.keys().collect::<Vec<_>>())
            .finish()
    }
}

//─────────────────────────────
//  Invoker
//─────────────────────────────

/// Dispatches hooks for the workers.
#[derive(Debug, Clone)]
pub struct LifecycleInvoker {
    registry: Arc<LifecycleRegistry>,
}

impl LifecycleInvoker {
    /// Build an invoker over a shared registry.
    pub fn new(registry: Arc<LifecycleRegistry>) -> Self {
        Self { registry }
    }

    /// The registry this invoker reads.
    pub fn registry(&self) -> &Arc<LifecycleRegistry> {
        &self.registry
    }

    /// Run an inline stage: hooks awaited in order, first error surfaces.
    pub async fn run_inline(&self, ctx: &HookContext) -> Result<()> {
        debug_assert!(ctx.stage.is_inline());
        for hook in self.registry.hooks_for(&ctx.type_tag, ctx.stage) {
            hook(ctx.clone()).await?;
        }
        Ok(())
    }

    /// Schedule an async stage: hooks spawned fire-and-forget.
    ///
    /// Errors are logged and never observed by the message's fate; a
    /// cancelled worker token abandons hooks that have not yet run.
    pub fn spawn_async(&self, ctx: &HookContext) {
        debug_assert!(!ctx.stage.is_inline());
        for hook in self.registry.hooks_for(&ctx.type_tag, ctx.stage) {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                let message_id = ctx.message_id;
                let stage = ctx.stage;
                let cancel = ctx.cancel.clone();
                tokio::select! {
                    _ = cancel.cancelled() => {
                        warn!(%message_id, ?stage, "async hook abandoned on cancellation");
                    }
                    result = hook(ctx) => {
                        if let Err(error) = result {
                            warn!(%message_id, ?stage, %error, "async lifecycle hook failed");
                        }
                    }
                }
            });
        }
    }
}
