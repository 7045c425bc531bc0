//! String-pattern matchers shared by rule criteria and dispatcher limits.

use regex::Regex;
use serde::{Deserialize, Serialize};

/// One of the three pattern families from the spec: `glob`, `regexp`, `diff`.
///
/// `glob` and `regexp` OR-combine their patterns; `diff` matches when the
/// input equals none of its patterns (negation).
#[derive(Clone, Debug)]
pub enum Matcher {
    Glob(Vec<String>),
    Regexp(Vec<Regex>),
    Diff(Vec<String>),
}

impl Matcher {
    pub fn glob(patterns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Matcher::Glob(patterns.into_iter().map(Into::into).collect())
    }

    pub fn regexp<I, S>(patterns: I) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let compiled = patterns
            .into_iter()
            .map(|p| anchor_at_start(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Matcher::Regexp(compiled))
    }

    pub fn diff(patterns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Matcher::Diff(patterns.into_iter().map(Into::into).collect())
    }

    pub fn matches(&self, value: &str) -> bool {
        match self {
            Matcher::Glob(patterns) => patterns.iter().any(|p| glob_match::glob_match(p, value)),
            Matcher::Regexp(patterns) => patterns.iter().any(|r| r.is_match(value)),
            Matcher::Diff(patterns) => !patterns.iter().any(|p| p == value),
        }
    }
}

/// Python's `re.match` only anchors at the start of the string; reproduce
/// that by wrapping the user pattern instead of requiring a full match.
fn anchor_at_start(pattern: &str) -> Result<Regex, regex::Error> {
    if let Some(stripped) = pattern.strip_prefix('^') {
        Regex::new(&format!("^(?:{stripped})"))
    } else {
        Regex::new(&format!("^(?:{pattern})"))
    }
}

/// A declarative spec for a matcher, as it appears in the JSON config file.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatcherSpec {
    Glob(Vec<String>),
    Regexp(Vec<String>),
    Diff(Vec<String>),
}

impl MatcherSpec {
    pub fn build(&self) -> Result<Matcher, regex::Error> {
        match self {
            MatcherSpec::Glob(p) => Ok(Matcher::glob(p.clone())),
            MatcherSpec::Regexp(p) => Matcher::regexp(p),
            MatcherSpec::Diff(p) => Ok(Matcher::diff(p.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_matches_whole_string() {
        let m = Matcher::glob(["10.0.0.*"]);
        assert!(m.matches("10.0.0.7"));
        assert!(!m.matches("10.0.1.7"));
    }

    #[test]
    fn regexp_is_anchored_at_start_not_end() {
        let m = Matcher::regexp(["^/foo"]).unwrap();
        assert!(m.matches("/foo/x"));
        assert!(!m.matches("/bar"));
    }

    #[test]
    fn diff_matches_when_equal_to_none() {
        let m = Matcher::diff(["a", "b"]);
        assert!(m.matches("c"));
        assert!(!m.matches("a"));
    }
}
