//! Named, built-in handler registry. Per §9's config-schema decision, custom
//! criteria/actions in the declarative config reference a compiled-in
//! handler by name instead of arbitrary scripting.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use serde_json::Value;

use crate::exchange::HttpExchange;
use crate::rules::{CustomActionFn, CustomCriterionFn};

/// Always-true criterion handler, useful as a default/no-op in tests and
/// configs that only need `stop` semantics.
fn always_allow(_exchange: &HttpExchange) -> crate::rules::CriterionFuture<'_> {
    Box::pin(async { true })
}

/// Blocks requests whose path starts with `/internal/` — a minimal
/// stand-in for an operator-defined access policy.
fn deny_internal_paths(exchange: &HttpExchange) -> crate::rules::CriterionFuture<'_> {
    Box::pin(async move { !exchange.get_path().starts_with("/internal/") })
}

/// No-op action handler producing `null` (so no mutator is applied).
fn noop_action(_exchange: &HttpExchange) -> crate::rules::ActionFuture<'_> {
    Box::pin(async { Value::Null })
}

static CRITERION_HANDLERS: Lazy<HashMap<&'static str, CustomCriterionFn>> = Lazy::new(|| {
    let mut m: HashMap<&'static str, CustomCriterionFn> = HashMap::new();
    m.insert("always_allow", std::sync::Arc::new(always_allow));
    m.insert("deny_internal_paths", std::sync::Arc::new(deny_internal_paths));
    m
});

static ACTION_HANDLERS: Lazy<HashMap<&'static str, CustomActionFn>> = Lazy::new(|| {
    let mut m: HashMap<&'static str, CustomActionFn> = HashMap::new();
    m.insert("noop", std::sync::Arc::new(noop_action));
    m
});

pub fn lookup_criterion(name: &str) -> Option<CustomCriterionFn> {
    CRITERION_HANDLERS.get(name).cloned()
}

pub fn lookup_action(name: &str) -> Option<CustomActionFn> {
    ACTION_HANDLERS.get(name).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_handlers_are_registered() {
        assert!(lookup_criterion("always_allow").is_some());
        assert!(lookup_action("noop").is_some());
        assert!(lookup_criterion("nonexistent").is_none());
    }
}
