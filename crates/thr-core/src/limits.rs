//! Limits registry: named concurrency limits, each producing a
//! `(counter_name, max)` condition for a given request (§4.4).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::matchers::{Matcher, MatcherSpec};

/// Minimal read-only view of a request, enough to compute any built-in hash
/// function. Both the frontend's `HttpExchange` and the dispatcher's
/// `HttpRequestExchange` can implement this.
pub trait RequestView {
    fn method(&self) -> &str;
    fn path(&self) -> &str;
    fn remote_ip(&self) -> Option<&str>;
    fn header(&self, name: &str) -> Option<&str>;
}

/// Named, config-referenceable hash functions (§9: config is declarative,
/// so hash functions are named rather than arbitrary closures).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashFn {
    Path,
    Method,
    RemoteIp,
    Header(String),
}

impl HashFn {
    pub fn eval(&self, req: &dyn RequestView) -> Option<String> {
        match self {
            HashFn::Path => Some(req.path().to_string()),
            HashFn::Method => Some(req.method().to_string()),
            HashFn::RemoteIp => req.remote_ip().map(str::to_string),
            HashFn::Header(name) => req.header(name).map(str::to_string),
        }
    }
}

#[derive(Clone, Debug)]
pub enum HashPattern {
    Literal(String),
    Matcher(Matcher),
}

impl HashPattern {
    fn matches(&self, value: &str) -> bool {
        match self {
            HashPattern::Literal(p) => p == value,
            HashPattern::Matcher(m) => m.matches(value),
        }
    }
}

/// What a limit's pattern means: either "fire when the hash matches this
/// pattern" or the per-value sentinel ("one counter per distinct hash
/// value"), per §9's `per_value: bool` design decision.
pub enum LimitPattern {
    Pattern(HashPattern),
    PerValue,
}

pub struct Limit {
    pub name: String,
    pub hash_fn: HashFn,
    pattern: Option<HashPattern>,
    pub per_value: bool,
    pub max: u32,
    pub show_in_stats: bool,
}

#[derive(Debug, Error)]
pub enum LimitsError {
    #[error("limit name `{0}` already registered")]
    DuplicateName(String),
    #[error("limit name `{0}` may not contain `==` (reserved as a counter-suffix separator)")]
    ReservedSeparator(String),
}

#[derive(Default)]
pub struct LimitsRegistry {
    limits: Vec<Limit>,
}

impl LimitsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        hash_fn: HashFn,
        pattern: LimitPattern,
        max: u32,
        show_in_stats: bool,
    ) -> Result<(), LimitsError> {
        let name = name.into();
        if name.contains("==") {
            return Err(LimitsError::ReservedSeparator(name));
        }
        if self.limits.iter().any(|l| l.name == name) {
            return Err(LimitsError::DuplicateName(name));
        }
        let (pattern, per_value) = match pattern {
            LimitPattern::Pattern(p) => (Some(p), false),
            LimitPattern::PerValue => (None, true),
        };
        self.limits.push(Limit {
            name,
            hash_fn,
            pattern,
            per_value,
            max,
            show_in_stats,
        });
        Ok(())
    }

    pub fn limits(&self) -> &[Limit] {
        &self.limits
    }

    /// For a given request, the `(counter_name, max)` conditions it must
    /// satisfy to be admitted.
    pub fn conditions(&self, req: &dyn RequestView) -> Vec<(String, u32)> {
        let mut memo: HashMap<&HashFn, Option<String>> = HashMap::new();
        let mut out = Vec::new();
        for limit in &self.limits {
            let hash = memo
                .entry(&limit.hash_fn)
                .or_insert_with(|| limit.hash_fn.eval(req))
                .clone();
            let Some(hash) = hash else { continue };
            if limit.per_value {
                out.push((format!("{}=={}", limit.name, hash), limit.max));
            } else if limit
                .pattern
                .as_ref()
                .is_some_and(|p| p.matches(&hash))
            {
                out.push((limit.name.clone(), limit.max));
            }
        }
        out
    }
}

/// Declarative limit spec, as it appears in the JSON config file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LimitSpec {
    pub name: String,
    pub hash_fn: HashFn,
    /// `None` denotes the per-value sentinel (`hash_pattern == hash_fn`).
    #[serde(default)]
    pub hash_pattern: Option<MatcherOrLiteral>,
    pub max: u32,
    #[serde(default = "default_true")]
    pub show_in_stats: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MatcherOrLiteral {
    Literal(String),
    Matcher(MatcherSpec),
}

impl LimitSpec {
    pub fn apply(&self, registry: &mut LimitsRegistry) -> anyhow::Result<()> {
        let pattern = match &self.hash_pattern {
            None => LimitPattern::PerValue,
            Some(MatcherOrLiteral::Literal(s)) => {
                LimitPattern::Pattern(HashPattern::Literal(s.clone()))
            }
            Some(MatcherOrLiteral::Matcher(spec)) => {
                LimitPattern::Pattern(HashPattern::Matcher(spec.build()?))
            }
        };
        registry.register(
            self.name.clone(),
            self.hash_fn.clone(),
            pattern,
            self.max,
            self.show_in_stats,
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Req {
        method: &'static str,
        path: &'static str,
    }
    impl RequestView for Req {
        fn method(&self) -> &str {
            self.method
        }
        fn path(&self) -> &str {
            self.path
        }
        fn remote_ip(&self) -> Option<&str> {
            None
        }
        fn header(&self, _name: &str) -> Option<&str> {
            None
        }
    }

    #[test]
    fn rejects_duplicate_and_reserved_names() {
        let mut reg = LimitsRegistry::new();
        reg.register("lim", HashFn::Path, LimitPattern::PerValue, 2, true)
            .unwrap();
        assert!(reg
            .register("lim", HashFn::Path, LimitPattern::PerValue, 2, true)
            .is_err());
        assert!(reg
            .register("a==b", HashFn::Path, LimitPattern::PerValue, 2, true)
            .is_err());
    }

    #[test]
    fn per_value_limit_names_counters_per_hash() {
        let mut reg = LimitsRegistry::new();
        reg.register("lim", HashFn::Path, LimitPattern::PerValue, 2, true)
            .unwrap();
        let bar = Req {
            method: "GET",
            path: "bar",
        };
        let baz = Req {
            method: "GET",
            path: "baz",
        };
        assert_eq!(reg.conditions(&bar), vec![("lim==bar".to_string(), 2)]);
        assert_eq!(reg.conditions(&baz), vec![("lim==baz".to_string(), 2)]);
    }
}
