//! Rule engine (frontend): `Criteria`, `Actions`, and the executor that runs
//! criteria, executes matched actions per phase, and honours `stop` (§4.5).

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::future::join_all;
use serde_json::Value;

use crate::exchange::HttpExchange;
use crate::matchers::Matcher;

pub type CriterionFuture<'a> = Pin<Box<dyn Future<Output = bool> + Send + 'a>>;
pub type CustomCriterionFn = Arc<dyn for<'a> Fn(&'a HttpExchange) -> CriterionFuture<'a> + Send + Sync>;

pub type ActionFuture<'a> = Pin<Box<dyn Future<Output = Value> + Send + 'a>>;
pub type CustomActionFn = Arc<dyn for<'a> Fn(&'a HttpExchange) -> ActionFuture<'a> + Send + Sync>;

/// Recognized `get_*` attribute names, per §4.5 ("criteria recognize the
/// exchange getters whose names begin with `get_`").
const KNOWN_ATTRIBUTES: [&str; 5] = ["method", "path", "host", "remote_ip", "real_ip"];

fn get_attribute(exchange: &HttpExchange, name: &str) -> Option<String> {
    match name {
        "method" => Some(exchange.get_method()),
        "path" => Some(exchange.get_path()),
        "host" => Some(exchange.get_host()),
        "remote_ip" => Some(exchange.get_remote_ip()),
        "real_ip" => Some(exchange.get_real_ip()),
        _ => None,
    }
}

#[derive(Clone)]
pub enum CriterionSpec {
    Literal(String),
    Sequence(Vec<String>),
    Matcher(Matcher),
}

impl CriterionSpec {
    fn matches(&self, value: &str) -> bool {
        match self {
            CriterionSpec::Literal(expected) => expected == value,
            CriterionSpec::Sequence(options) => options.iter().any(|o| o == value),
            CriterionSpec::Matcher(m) => m.matches(value),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown criteria attribute `{0}`")]
pub struct UnknownAttribute(String);

/// A bundle of named attribute checks, AND-combined, plus an optional
/// `custom` callable.
#[derive(Default, Clone)]
pub struct Criteria {
    attrs: Vec<(String, CriterionSpec)>,
    custom: Option<CustomCriterionFn>,
}

impl Criteria {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_attr(
        mut self,
        name: impl Into<String>,
        spec: CriterionSpec,
    ) -> Result<Self, UnknownAttribute> {
        let name = name.into();
        if !KNOWN_ATTRIBUTES.contains(&name.as_str()) {
            return Err(UnknownAttribute(name));
        }
        self.attrs.push((name, spec));
        Ok(self)
    }

    pub fn with_custom(mut self, f: CustomCriterionFn) -> Self {
        self.custom = Some(f);
        self
    }

    /// AND over all present criteria. Eagerly-evaluated attribute checks
    /// short-circuit: a `false` skips invoking `custom` entirely.
    pub async fn eval(&self, exchange: &HttpExchange) -> bool {
        for (name, spec) in &self.attrs {
            let Some(value) = get_attribute(exchange, name) else {
                return false;
            };
            if !spec.matches(&value) {
                return false;
            }
        }
        match &self.custom {
            Some(f) => f(exchange).await,
            None => true,
        }
    }
}

#[derive(Clone)]
pub enum ActionValue {
    Literal(Value),
    Handler(CustomActionFn),
}

/// The exchange's mutator names, in the order the exchange exposes them.
/// Apply order within a phase follows this table, not action-map order —
/// stable across runs even though independent actions don't observably
/// depend on it (§4.5).
const MUTATOR_ORDER: [&str; 19] = [
    "set_redis_host",
    "set_redis_port",
    "set_redis_uds",
    "set_redis_queue",
    "set_input_priority",
    "set_method",
    "set_path",
    "set_host",
    "set_remote_ip",
    "set_query_string_arg",
    "add_query_string_arg",
    "del_query_string_arg",
    "set_input_header",
    "add_input_header",
    "del_input_header",
    "set_input_body",
    "set_status_code",
    "set_output_header",
    "set_output_body",
];

fn classify_phase(name: &str) -> Phase {
    if name == "custom_input" {
        return Phase::Input;
    }
    if name == "custom_output" {
        return Phase::Output;
    }
    if name.ends_with("_output") || name.contains("_output_") {
        Phase::Output
    } else {
        Phase::Input
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Input,
    Output,
}

/// A bundle of named actions: setter/adder/deleter names plus the two
/// reserved custom callables.
#[derive(Default, Clone)]
pub struct Actions {
    sets: Vec<(String, ActionValue)>,
    custom_input: Option<CustomActionFn>,
    custom_output: Option<CustomActionFn>,
}

impl Actions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_action(mut self, name: impl Into<String>, value: ActionValue) -> Self {
        self.sets.push((name.into(), value));
        self
    }

    pub fn with_custom_input(mut self, f: CustomActionFn) -> Self {
        self.custom_input = Some(f);
        self
    }

    pub fn with_custom_output(mut self, f: CustomActionFn) -> Self {
        self.custom_output = Some(f);
        self
    }

    /// Executes this phase's subset of actions against `exchange` (§4.5
    /// steps 1-4).
    pub async fn execute(&self, exchange: &mut HttpExchange, phase: Phase) {
        let resolved: Vec<(String, Value)> = {
            let mut immediate = Vec::new();
            let mut deferred = Vec::new();
            for (name, value) in &self.sets {
                if classify_phase(name) != phase {
                    continue;
                }
                match value {
                    ActionValue::Literal(v) => immediate.push((name.clone(), v.clone())),
                    ActionValue::Handler(f) => deferred.push((name.clone(), f(&*exchange))),
                }
            }
            let custom = match phase {
                Phase::Input => &self.custom_input,
                Phase::Output => &self.custom_output,
            };
            if let Some(f) = custom {
                deferred.push(("__custom__".to_string(), f(&*exchange)));
            }
            // §4.5 step 2: every deferred handler for this phase, including
            // the custom callable, awaits as one concurrent batch.
            let awaited = join_all(
                deferred
                    .into_iter()
                    .map(|(name, fut)| async move { (name, fut.await) }),
            )
            .await;
            immediate.extend(awaited);
            immediate
        };

        for mutator_name in MUTATOR_ORDER {
            if let Some((_, value)) = resolved.iter().find(|(n, _)| n == mutator_name) {
                if value.is_null() {
                    continue;
                }
                apply_mutator(exchange, mutator_name, value);
            }
        }
    }
}

fn apply_mutator(exchange: &mut HttpExchange, name: &str, value: &Value) {
    let as_str = |v: &Value| v.as_str().unwrap_or_default().to_string();
    let as_pair = |v: &Value| -> (String, String) {
        let arr = v.as_array().cloned().unwrap_or_default();
        (
            arr.first().map(as_str).unwrap_or_default(),
            arr.get(1).map(as_str).unwrap_or_default(),
        )
    };
    match name {
        "set_redis_host" => exchange.set_redis_host(as_str(value)),
        "set_redis_port" => exchange.set_redis_port(value.as_u64().unwrap_or(6379) as u16),
        "set_redis_uds" => exchange.set_redis_uds(as_str(value)),
        "set_redis_queue" => exchange.set_redis_queue(as_str(value)),
        "set_input_priority" => exchange.set_input_priority(value.as_i64().unwrap_or(50)),
        "set_method" => exchange.set_method(as_str(value)),
        "set_path" => exchange.set_path(as_str(value)),
        "set_host" => exchange.set_host(as_str(value)),
        "set_remote_ip" => exchange.set_remote_ip(as_str(value)),
        "set_query_string_arg" => {
            let (k, v) = as_pair(value);
            exchange.set_query_string_arg(k, v);
        }
        "add_query_string_arg" => {
            let (k, v) = as_pair(value);
            exchange.add_query_string_arg(k, v);
        }
        "del_query_string_arg" => exchange.del_query_string_arg(&as_str(value)),
        "set_input_header" => {
            let (k, v) = as_pair(value);
            exchange.set_input_header(k, v);
        }
        "add_input_header" => {
            let (k, v) = as_pair(value);
            exchange.add_input_header(k, v);
        }
        "del_input_header" => exchange.del_input_header(&as_str(value)),
        "set_input_body" => exchange.set_input_body(as_str(value).into_bytes()),
        "set_status_code" => exchange.set_status_code(value.as_u64().unwrap_or(200) as u16),
        "set_output_header" => {
            let (k, v) = as_pair(value);
            exchange.set_output_header(k, v);
        }
        "set_output_body" => exchange.set_output_body(as_str(value).into_bytes()),
        _ => {}
    }
}

/// A single `(criteria, actions, stop)` triple (§4.5).
pub struct Rule {
    pub criteria: Criteria,
    pub actions: Actions,
    pub stop: bool,
}

/// The global ordered rule list and its executor.
#[derive(Default)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_rule(&mut self, criteria: Criteria, actions: Actions, stop: bool) {
        self.rules.push(Rule {
            criteria,
            actions,
            stop,
        });
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Runs the input-phase subset of matching rules, in registration
    /// order, honouring `stop`. Returns the indices of matched rules so the
    /// output phase can replay exactly that subset without re-matching.
    pub async fn execute_input(&self, exchange: &mut HttpExchange) -> Vec<usize> {
        let mut matched = Vec::new();
        for (idx, rule) in self.rules.iter().enumerate() {
            if rule.criteria.eval(exchange).await {
                matched.push(idx);
                rule.actions.execute(exchange, Phase::Input).await;
                if rule.stop {
                    break;
                }
            }
        }
        matched
    }

    /// Runs the output phase over exactly the subset matched in the input
    /// phase (memoized on the exchange).
    pub async fn execute_output(&self, exchange: &mut HttpExchange, matched: &[usize]) {
        for &idx in matched {
            self.rules[idx].actions.execute(exchange, Phase::Output).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::ExchangeRequest;

    fn exchange_for(method: &str, path: &str, remote_ip: &str) -> HttpExchange {
        HttpExchange::new(
            ExchangeRequest {
                method: method.to_string(),
                path: path.to_string(),
                host: "h".to_string(),
                remote_ip: remote_ip.to_string(),
                ..Default::default()
            },
            "127.0.0.1".to_string(),
            6379,
            "thr:queue:default".to_string(),
            None,
        )
    }

    #[tokio::test]
    async fn rule_order_and_stop() {
        let mut rules = RuleSet::new();
        let criteria = Criteria::new()
            .with_attr("path", CriterionSpec::Literal("/foo".to_string()))
            .unwrap();
        rules.add_rule(
            criteria.clone(),
            Actions::new().with_action(
                "set_output_header",
                ActionValue::Literal(Value::Array(vec![
                    Value::String("X-Test".to_string()),
                    Value::String("A".to_string()),
                ])),
            ),
            false,
        );
        rules.add_rule(
            criteria,
            Actions::new().with_action(
                "set_output_header",
                ActionValue::Literal(Value::Array(vec![
                    Value::String("X-Test".to_string()),
                    Value::String("B".to_string()),
                ])),
            ),
            false,
        );
        let mut exchange = exchange_for("GET", "/foo", "1.1.1.1");
        let matched = rules.execute_input(&mut exchange).await;
        rules.execute_output(&mut exchange, &matched).await;
        assert_eq!(
            exchange
                .response
                .headers
                .iter()
                .find(|(k, _)| k == "X-Test")
                .unwrap()
                .1,
            "B"
        );
    }

    #[tokio::test]
    async fn stop_flag_halts_further_rules() {
        let mut rules = RuleSet::new();
        let criteria = Criteria::new()
            .with_attr("path", CriterionSpec::Literal("/foo".to_string()))
            .unwrap();
        rules.add_rule(
            criteria.clone(),
            Actions::new().with_action(
                "set_output_header",
                ActionValue::Literal(Value::Array(vec![
                    Value::String("X-Test".to_string()),
                    Value::String("A".to_string()),
                ])),
            ),
            true,
        );
        rules.add_rule(
            criteria,
            Actions::new().with_action(
                "set_output_header",
                ActionValue::Literal(Value::Array(vec![
                    Value::String("X-Test".to_string()),
                    Value::String("B".to_string()),
                ])),
            ),
            false,
        );
        let mut exchange = exchange_for("GET", "/foo", "1.1.1.1");
        let matched = rules.execute_input(&mut exchange).await;
        rules.execute_output(&mut exchange, &matched).await;
        assert_eq!(
            exchange
                .response
                .headers
                .iter()
                .find(|(k, _)| k == "X-Test")
                .unwrap()
                .1,
            "A"
        );
    }

    #[tokio::test]
    async fn criteria_are_anded_and_matcher_families_work() {
        let criteria = Criteria::new()
            .with_attr("method", CriterionSpec::Literal("GET".to_string()))
            .unwrap()
            .with_attr(
                "path",
                CriterionSpec::Matcher(Matcher::regexp(["^/foo"]).unwrap()),
            )
            .unwrap();
        assert!(criteria.eval(&exchange_for("GET", "/foo/x", "1.1.1.1")).await);
        assert!(!criteria.eval(&exchange_for("POST", "/foo/x", "1.1.1.1")).await);
        assert!(!criteria.eval(&exchange_for("GET", "/bar", "1.1.1.1")).await);

        let ip_criteria = Criteria::new()
            .with_attr(
                "remote_ip",
                CriterionSpec::Matcher(Matcher::glob(["10.0.0.*"])),
            )
            .unwrap();
        assert!(ip_criteria.eval(&exchange_for("GET", "/x", "10.0.0.7")).await);
        assert!(!ip_criteria.eval(&exchange_for("GET", "/x", "10.0.1.7")).await);

        let seq_criteria = Criteria::new()
            .with_attr(
                "method",
                CriterionSpec::Sequence(vec!["GET".to_string(), "POST".to_string()]),
            )
            .unwrap();
        assert!(seq_criteria.eval(&exchange_for("GET", "/x", "1.1.1.1")).await);
        assert!(seq_criteria.eval(&exchange_for("POST", "/x", "1.1.1.1")).await);
    }

    #[tokio::test]
    async fn custom_criterion_is_awaited_and_can_suppress_or_admit() {
        let allow: CustomCriterionFn = Arc::new(|_exchange| Box::pin(async { true }));
        let deny: CustomCriterionFn = Arc::new(|_exchange| Box::pin(async { false }));

        let criteria = Criteria::new().with_custom(allow);
        assert!(criteria.eval(&exchange_for("GET", "/x", "1.1.1.1")).await);

        let criteria = Criteria::new().with_custom(deny);
        assert!(!criteria.eval(&exchange_for("GET", "/x", "1.1.1.1")).await);
    }
}
