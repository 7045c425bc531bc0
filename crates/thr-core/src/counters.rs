//! Process-local counter table and the conditional batch increment that is
//! the dispatcher's core admission primitive (§4.3).
//!
//! Owned by the single-threaded scheduler core (§5); not behind a lock.

use std::collections::HashMap;

#[derive(Default, Debug)]
pub struct Counters {
    values: HashMap<String, u64>,
    blocks: HashMap<String, u64>,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> u64 {
        self.values.get(name).copied().unwrap_or(0)
    }

    pub fn set(&mut self, name: &str, value: u64) {
        self.values.insert(name.to_string(), value);
    }

    pub fn del(&mut self, name: &str) {
        self.values.remove(name);
    }

    pub fn get_block_count(&self, name: &str) -> u64 {
        self.blocks.get(name).copied().unwrap_or(0)
    }

    /// Every counter name currently tracked (value or block count nonzero).
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values
            .keys()
            .chain(self.blocks.keys())
            .map(String::as_str)
    }

    /// Decrements every counter in `names`, deleting any that reach zero.
    pub fn decrement(&mut self, names: &[String]) {
        for name in names {
            if let Some(value) = self.values.get_mut(name) {
                *value = value.saturating_sub(1);
                if *value == 0 {
                    self.values.remove(name);
                }
            }
        }
    }

    /// Atomically either increments every counter named in `conditions` by
    /// one and returns `(true, names)`, or leaves every counter untouched
    /// and returns `(false, blocked_names)`. A counter is blocked iff its
    /// current value is `>= max`. Every blocked counter's block count is
    /// incremented once per failed attempt, win or lose.
    pub fn conditional_batch_increment(
        &mut self,
        conditions: &[(String, u32)],
    ) -> (bool, Vec<String>) {
        let mut blocked = Vec::new();
        for (name, max) in conditions {
            if self.get(name) >= *max as u64 {
                blocked.push(name.clone());
            }
        }
        if !blocked.is_empty() {
            for name in &blocked {
                *self.blocks.entry(name.clone()).or_insert(0) += 1;
            }
            return (false, blocked);
        }
        let names: Vec<String> = conditions.iter().map(|(n, _)| n.clone()).collect();
        for name in &names {
            *self.values.entry(name.clone()).or_insert(0) += 1;
        }
        (true, names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_increment_is_all_or_nothing() {
        let mut counters = Counters::new();
        let (ok, names) = counters.conditional_batch_increment(&[("x".to_string(), 1)]);
        assert!(ok);
        assert_eq!(names, vec!["x".to_string()]);
        assert_eq!(counters.get("x"), 1);

        let (ok, blocked) = counters.conditional_batch_increment(&[("x".to_string(), 1)]);
        assert!(!ok);
        assert_eq!(blocked, vec!["x".to_string()]);
        assert_eq!(counters.get("x"), 1);
        assert_eq!(counters.get_block_count("x"), 1);

        counters.decrement(&["x".to_string()]);
        assert_eq!(counters.get("x"), 0);
    }

    #[test]
    fn mixed_conditions_block_atomically() {
        let mut counters = Counters::new();
        counters.set("a", 5);
        let (ok, blocked) =
            counters.conditional_batch_increment(&[("a".to_string(), 5), ("b".to_string(), 2)]);
        assert!(!ok);
        assert_eq!(blocked, vec!["a".to_string()]);
        // "b" must not have been touched since the batch failed.
        assert_eq!(counters.get("b"), 0);
    }

    #[test]
    fn decrement_to_zero_deletes_key() {
        let mut counters = Counters::new();
        counters.set("x", 1);
        counters.decrement(&["x".to_string()]);
        assert_eq!(counters.get("x"), 0);
        assert!(!counters.values.contains_key("x"));
    }
}
