//! First-match publish policy engine.
//!
//! Policies decide where an outbound message goes and how it is published.
//! Rules are evaluated in registration order; the first predicate that
//! matches wins. Evaluation is side-effect-free.

use std::sync::{Arc, RwLock};

use weft_types::StreamId;

//─────────────────────────────
//  Context and config
//─────────────────────────────

/// Facts about an outbound message available to policy predicates.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyContext {
    /// Payload type tag.
    pub type_tag: String,
    /// Stream the message belongs to, if any.
    pub stream_id: Option<StreamId>,
    /// Whether the producer marked the message as an event.
    pub is_event: bool,
    /// Optional message metadata.
    pub metadata: Option<serde_json::Value>,
}

/// How a matched message is published.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishConfig {
    /// Opaque transport destination.
    pub destination: String,
    /// Optional partition hint forwarded to the transport driver.
    pub partition_hint: Option<i64>,
    /// Whether completions of this message append to the event store.
    pub is_event: bool,
    /// Attempts before the row is left `Failed` for operator attention.
    pub max_attempts: i64,
}

impl PublishConfig {
    /// A plain config targeting `destination` with default retry behavior.
    pub fn to_destination(destination: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            partition_hint: None,
            is_event: false,
            max_attempts: 10,
        }
    }

    /// Mark the config as producing event-store records.
    pub fn as_event(mut self) -> Self {
        self.is_event = true;
        self
    }
}

//─────────────────────────────
//  Engine
//─────────────────────────────

type Predicate = Arc<dyn Fn(&PolicyContext) -> bool + Send + Sync>;

struct PolicyRule {
    name: String,
    predicate: Predicate,
    config: PublishConfig,
}

/// Ordered, append-only list of publish policies.
#[derive(Default)]
pub struct PolicyEngine {
    rules: RwLock<Vec<PolicyRule>>,
}

impl PolicyEngine {
    /// Create an engine with no rules.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a rule. Order of addition is evaluation order.
    pub fn add_rule(
        &self,
        name: impl Into<String>,
        predicate: impl Fn(&PolicyContext) -> bool + Send + Sync + 'static,
        config: PublishConfig,
    ) {
        let mut rules = self.rules.write().unwrap_or_else(|e| e.into_inner());
        rules.push(PolicyRule {
            name: name.into(),
            predicate: Arc::new(predicate),
            config,
        });
    }

    /// The first matching config, or `None` when no rule matches.
    pub fn match_first(&self, ctx: &PolicyContext) -> Option<PublishConfig> {
        let rules = self.rules.read().unwrap_or_else(|e| e.into_inner());
        rules
            .iter()
            .find(|rule| (rule.predicate)(ctx))
            .map(|rule| rule.config.clone())
    }

    /// Name of the first matching rule; diagnostic companion to `match_first`.
    pub fn match_name(&self, ctx: &PolicyContext) -> Option<String> {
        let rules = self.rules.read().unwrap_or_else(|e| e.into_inner());
        rules
            .iter()
            .find(|rule| (rule.predicate)(ctx))
            .map(|rule| rule.name.clone())
    }

    /// Number of registered rules.
    pub fn len(&self) -> usize {
        self.rules.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether no rules are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for PolicyEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let rules = self.rules.read().unwrap_or_else(|e| e.into_inner());
        f.debug_struct("PolicyEngine")
            .field(
                "rules",
                &rules.iter().map(|r| r.name.as_str()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(tag: &str) -> PolicyContext {
        PolicyContext {
            type_tag: tag.into(),
            stream_id: None,
            is_event: false,
            metadata: None,
        }
    }

    #[test]
    fn first_match_wins_in_registration_order() {
        let engine = PolicyEngine::new();
        engine.add_rule(
            "orders",
            |ctx| ctx.type_tag.starts_with("orders."),
            PublishConfig::to_destination("topic-orders"),
        );
        engine.add_rule(
            "catch-all",
            |_ctx| true,
            PublishConfig::to_destination("topic-default"),
        );

        let config = engine.match_first(&ctx("orders.placed")).unwrap();
        assert_eq!(config.destination, "topic-orders");
        assert_eq!(engine.match_name(&ctx("orders.placed")).unwrap(), "orders");

        let fallback = engine.match_first(&ctx("billing.charged")).unwrap();
        assert_eq!(fallback.destination, "topic-default");
    }

    #[test]
    fn no_match_yields_none() {
        let engine = PolicyEngine::new();
        engine.add_rule(
            "orders",
            |ctx| ctx.type_tag.starts_with("orders."),
            PublishConfig::to_destination("topic-orders"),
        );
        assert!(engine.match_first(&ctx("billing.charged")).is_none());
    }

    #[test]
    fn evaluation_is_pure() {
        let engine = PolicyEngine::new();
        engine.add_rule(
            "events",
            |ctx| ctx.is_event,
            PublishConfig::to_destination("topic-events").as_event(),
        );

        let context = PolicyContext {
            type_tag: "orders.placed".into(),
            stream_id: Some(StreamId::generate()),
            is_event: true,
            metadata: None,
        };
        let first = engine.match_first(&context);
        let second = engine.match_first(&context);
        assert_eq!(first, second);
        assert!(first.unwrap().is_event);
    }

    #[test]
    fn empty_engine_matches_nothing() {
        let engine = PolicyEngine::new();
        assert!(engine.is_empty());
        assert!(engine.match_first(&ctx("anything")).is_none());
    }
}
