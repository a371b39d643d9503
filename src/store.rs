use std::collections::{HashMap, HashSet};
use std::time::Instant;

use glob_match::glob_match;
use serde::Serialize;
use thiserror::Error as ThisError;

/// Bound on each counter's rate history; the oldest samples fall off first.
const MAX_COUNTER_HISTORY: usize = 100;

#[derive(Debug, ThisError, PartialEq)]
pub enum Error {
    #[error("key not found")]
    NotFound,
}

/// A counter accumulates until the periodic flush turns the accumulated
/// value into a rate and zeroes it again.
#[derive(Clone, Debug, Serialize)]
pub struct Counter {
    pub value: i64,
    pub rate_per_second: f64,
    pub history: Vec<f64>,
}

/// In-memory store for counters, integer values, and string sets. Callers
/// wrap it in `Arc<Mutex<..>>`; every operation is a short critical section.
pub struct MemoryStore {
    counters: HashMap<String, Counter>,
    values: HashMap<String, i64>,
    sets: HashMap<String, HashSet<String>>,
    last_flush: Instant,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore {
            counters: HashMap::new(),
            values: HashMap::new(),
            sets: HashMap::new(),
            last_flush: Instant::now(),
        }
    }

    /// Turns each counter's accumulated value into a per-second rate,
    /// shifting the previous rate into its history, and zeroes the value.
    pub fn flush_counters(&mut self) {
        let elapsed = self.last_flush.elapsed().as_secs_f64();
        self.last_flush = Instant::now();
        self.flush_with_elapsed(elapsed);
    }

    fn flush_with_elapsed(&mut self, elapsed: f64) {
        for counter in self.counters.values_mut() {
            let previous_rate = counter.rate_per_second;
            counter.rate_per_second = counter.value as f64 / elapsed;
            counter.history.push(previous_rate);
            if counter.history.len() > MAX_COUNTER_HISTORY {
                let excess = counter.history.len() - MAX_COUNTER_HISTORY;
                counter.history.drain(..excess);
            }
            counter.value = 0;
        }
    }

    pub fn counter_by(&mut self, name: &str, count: i64) -> i64 {
        let counter = self.counters.entry(name.to_string()).or_insert(Counter {
            value: 0,
            rate_per_second: 0.0,
            history: Vec::new(),
        });
        counter.value += count;
        counter.value
    }

    pub fn counters(&self) -> HashMap<String, Counter> {
        self.counters.clone()
    }

    pub fn incr_by(&mut self, name: &str, count: i64) -> i64 {
        let value = self.values.entry(name.to_string()).or_insert(0);
        *value += count;
        *value
    }

    pub fn decr_by(&mut self, name: &str, count: i64) -> i64 {
        self.incr_by(name, -count)
    }

    pub fn set(&mut self, name: &str, value: i64) -> i64 {
        self.values.insert(name.to_string(), value);
        1
    }

    /// Returns 1 when the key was absent and has been set, -1 when a value
    /// already existed.
    pub fn set_nx(&mut self, name: &str, value: i64) -> i64 {
        if self.values.contains_key(name) {
            -1
        } else {
            self.values.insert(name.to_string(), value);
            1
        }
    }

    /// A missing key is an error, distinct from a key holding zero.
    pub fn get(&self, name: &str) -> Result<i64, Error> {
        self.values.get(name).copied().ok_or(Error::NotFound)
    }

    pub fn exists(&self, name: &str) -> i64 {
        i64::from(self.values.contains_key(name))
    }

    /// Removes the key from values, counters, and sets, counting each
    /// removal separately.
    pub fn del(&mut self, name: &str) -> i64 {
        let mut deleted = 0;
        if self.values.remove(name).is_some() {
            deleted += 1;
        }
        if self.counters.remove(name).is_some() {
            deleted += 1;
        }
        if self.sets.remove(name).is_some() {
            deleted += 1;
        }
        deleted
    }

    pub fn keys(&self, pattern: &str) -> Vec<String> {
        if pattern.is_empty() || pattern == "*" {
            return self.values.keys().cloned().collect();
        }
        self.values
            .keys()
            .filter(|key| glob_match(pattern, key))
            .cloned()
            .collect()
    }

    pub fn sadd(&mut self, key: &str, members: impl IntoIterator<Item = String>) -> i64 {
        let set = self.sets.entry(key.to_string()).or_default();
        let mut added = 0;
        for member in members {
            if set.insert(member) {
                added += 1;
            }
        }
        added
    }

    pub fn srem(&mut self, key: &str, members: impl IntoIterator<Item = String>) -> i64 {
        let Some(set) = self.sets.get_mut(key) else {
            return 0;
        };
        let mut removed = 0;
        for member in members {
            if set.remove(&member) {
                removed += 1;
            }
        }
        if set.is_empty() {
            self.sets.remove(key);
        }
        removed
    }

    pub fn scard(&self, key: &str) -> i64 {
        self.sets.get(key).map_or(0, |set| set.len() as i64)
    }

    pub fn smembers(&self, key: &str) -> Vec<String> {
        self.sets
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_nx_only_inserts_once() {
        let mut store = MemoryStore::new();

        assert_eq!(store.set_nx("foo", 9), 1);
        assert_eq!(store.get("foo"), Ok(9));
        assert_eq!(store.set_nx("foo", 11), -1);
        assert_eq!(store.get("foo"), Ok(9));
    }

    #[test]
    fn get_missing_key_is_not_found() {
        let store = MemoryStore::new();
        assert_eq!(store.get("missing"), Err(Error::NotFound));
    }

    #[test]
    fn incr_and_decr_start_from_zero() {
        let mut store = MemoryStore::new();

        assert_eq!(store.incr_by("hits", 3), 3);
        assert_eq!(store.incr_by("hits", 1), 4);
        assert_eq!(store.decr_by("hits", 2), 2);
        assert_eq!(store.decr_by("fresh", 5), -5);
    }

    #[test]
    fn del_counts_every_map_the_key_lived_in() {
        let mut store = MemoryStore::new();
        store.set("foo", 1);
        store.counter_by("foo", 10);
        store.sadd("foo", vec!["a".to_string()]);

        assert_eq!(store.del("foo"), 3);
        assert_eq!(store.del("foo"), 0);
    }

    #[test]
    fn flush_computes_rate_and_keeps_history() {
        let mut store = MemoryStore::new();
        store.counter_by("reqs", 50);

        store.flush_with_elapsed(5.0);
        let counters = store.counters();
        assert_eq!(counters["reqs"].value, 0);
        assert_eq!(counters["reqs"].rate_per_second, 10.0);
        assert_eq!(counters["reqs"].history, vec![0.0]);

        store.counter_by("reqs", 20);
        store.flush_with_elapsed(2.0);
        let counters = store.counters();
        assert_eq!(counters["reqs"].rate_per_second, 10.0);
        assert_eq!(counters["reqs"].history, vec![0.0, 10.0]);
    }

    #[test]
    fn flush_history_is_bounded() {
        let mut store = MemoryStore::new();
        store.counter_by("reqs", 1);
        for _ in 0..(MAX_COUNTER_HISTORY + 20) {
            store.flush_with_elapsed(1.0);
        }

        let counters = store.counters();
        assert_eq!(counters["reqs"].history.len(), MAX_COUNTER_HISTORY);
    }

    #[test]
    fn keys_matches_glob_patterns() {
        let mut store = MemoryStore::new();
        store.set("user:1", 1);
        store.set("user:2", 2);
        store.set("order:1", 3);

        let mut keys = store.keys("user:*");
        keys.sort();
        assert_eq!(keys, vec!["user:1", "user:2"]);
        assert_eq!(store.keys("*").len(), 3);
        assert_eq!(store.keys("").len(), 3);
    }

    #[test]
    fn set_operations() {
        let mut store = MemoryStore::new();

        let added = store.sadd("tags", vec!["a".into(), "b".into(), "a".into()]);
        assert_eq!(added, 2);
        assert_eq!(store.scard("tags"), 2);

        assert_eq!(store.srem("tags", vec!["a".into(), "x".into()]), 1);
        let members = store.smembers("tags");
        assert_eq!(members, vec!["b".to_string()]);

        assert_eq!(store.srem("tags", vec!["b".into()]), 1);
        assert_eq!(store.scard("tags"), 0);
        assert_eq!(store.srem("missing", vec!["a".into()]), 0);
    }
}
