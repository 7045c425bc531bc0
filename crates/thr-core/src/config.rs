//! Declarative JSON configuration schema (§9 open question, decision b):
//! rules, queues and limits are named data, loaded once at startup instead
//! of executing a config script. Custom callables reference a named
//! built-in handler (§6/`handlers`).

use std::collections::HashMap;

use anyhow::{anyhow, Context};
use serde::Deserialize;
use serde_json::Value;

use crate::handlers;
use crate::limits::{LimitSpec, LimitsRegistry};
use crate::matchers::MatcherSpec;
use crate::rules::{ActionValue, Actions, Criteria, CriterionSpec, RuleSet};

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum CriterionValueSpec {
    Literal(String),
    Sequence(Vec<String>),
    Matcher(MatcherSpec),
}

impl CriterionValueSpec {
    fn build(&self) -> anyhow::Result<CriterionSpec> {
        Ok(match self {
            CriterionValueSpec::Literal(s) => CriterionSpec::Literal(s.clone()),
            CriterionValueSpec::Sequence(v) => CriterionSpec::Sequence(v.clone()),
            CriterionValueSpec::Matcher(spec) => CriterionSpec::Matcher(spec.build()?),
        })
    }
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct CriteriaSpec {
    pub method: Option<CriterionValueSpec>,
    pub path: Option<CriterionValueSpec>,
    pub host: Option<CriterionValueSpec>,
    pub remote_ip: Option<CriterionValueSpec>,
    pub real_ip: Option<CriterionValueSpec>,
    pub custom: Option<String>,
}

impl CriteriaSpec {
    pub fn build(&self) -> anyhow::Result<Criteria> {
        let mut c = Criteria::new();
        for (name, spec) in [
            ("method", &self.method),
            ("path", &self.path),
            ("host", &self.host),
            ("remote_ip", &self.remote_ip),
            ("real_ip", &self.real_ip),
        ] {
            if let Some(spec) = spec {
                c = c
                    .with_attr(name, spec.build()?)
                    .map_err(|e| anyhow!(e.to_string()))?;
            }
        }
        if let Some(name) = &self.custom {
            let f = handlers::lookup_criterion(name)
                .ok_or_else(|| anyhow!("unknown criterion handler `{name}`"))?;
            c = c.with_custom(f);
        }
        Ok(c)
    }
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct ActionsSpec {
    #[serde(default)]
    pub sets: HashMap<String, Value>,
    pub custom_input: Option<String>,
    pub custom_output: Option<String>,
}

impl ActionsSpec {
    pub fn build(&self) -> anyhow::Result<Actions> {
        let mut a = Actions::new();
        for (name, value) in &self.sets {
            let action_value = match value.get("handler").and_then(Value::as_str) {
                Some(handler_name) => {
                    let f = handlers::lookup_action(handler_name)
                        .ok_or_else(|| anyhow!("unknown action handler `{handler_name}`"))?;
                    ActionValue::Handler(f)
                }
                None => ActionValue::Literal(value.clone()),
            };
            a = a.with_action(name.clone(), action_value);
        }
        if let Some(name) = &self.custom_input {
            let f = handlers::lookup_action(name)
                .ok_or_else(|| anyhow!("unknown action handler `{name}`"))?;
            a = a.with_custom_input(f);
        }
        if let Some(name) = &self.custom_output {
            let f = handlers::lookup_action(name)
                .ok_or_else(|| anyhow!("unknown action handler `{name}`"))?;
            a = a.with_custom_output(f);
        }
        Ok(a)
    }
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct RuleSpec {
    #[serde(default)]
    pub criteria: CriteriaSpec,
    #[serde(default)]
    pub actions: ActionsSpec,
    #[serde(default)]
    pub stop: bool,
}

/// Queue registration (`add_queue`), §6.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueSpec {
    pub lists: Vec<String>,
    #[serde(default = "default_redis_host")]
    pub redis_host: String,
    #[serde(default = "default_redis_port")]
    pub redis_port: u16,
    pub redis_unix_socket: Option<String>,
    pub http_host: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    pub http_unix_socket: Option<String>,
    #[serde(default = "default_workers")]
    pub workers: u32,
}

fn default_redis_host() -> String {
    "127.0.0.1".to_string()
}
fn default_redis_port() -> u16 {
    6379
}
fn default_http_port() -> u16 {
    80
}
fn default_workers() -> u32 {
    1
}

/// Top-level config file contents; the frontend reads `rules`, the
/// dispatcher reads `queues` and `limits`.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub rules: Vec<RuleSpec>,
    #[serde(default)]
    pub queues: Vec<QueueSpec>,
    #[serde(default)]
    pub limits: Vec<LimitSpec>,
}

impl ConfigFile {
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("parsing config file {}", path.display()))
    }

    pub fn build_rules(&self) -> anyhow::Result<RuleSet> {
        let mut rules = RuleSet::new();
        for spec in &self.rules {
            rules.add_rule(spec.criteria.build()?, spec.actions.build()?, spec.stop);
        }
        Ok(rules)
    }

    pub fn build_limits(&self) -> anyhow::Result<LimitsRegistry> {
        let mut registry = LimitsRegistry::new();
        for spec in &self.limits {
            spec.apply(&mut registry)?;
        }
        Ok(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config() {
        let json = r#"{
            "rules": [
                {"criteria": {"path": "/quux"}, "actions": {"sets": {"set_redis_queue": "test-queue"}}}
            ],
            "queues": [
                {"lists": ["test-queue"], "http_host": "127.0.0.1", "http_port": 9000}
            ],
            "limits": [
                {"name": "lim", "hash_fn": "path", "max": 2}
            ]
        }"#;
        let cfg: ConfigFile = serde_json::from_str(json).unwrap();
        let rules = cfg.build_rules().unwrap();
        assert_eq!(rules.len(), 1);
        let limits = cfg.build_limits().unwrap();
        assert_eq!(limits.limits().len(), 1);
        assert_eq!(cfg.queues[0].workers, 1);
    }
}
