//! Versioned value store backing one run.
//!
//! Every named value carries the version (superstep index) that produced it;
//! seeds from defaults, bindings, and provided inputs sit at version 0. A
//! per-node ledger remembers the versions each node consumed at its last
//! execution, which is what drives staleness detection in cyclic graphs: a
//! node is re-runnable only when some input's current version is newer than
//! the version it last consumed.
//!
//! Emit-only signals live beside data values as bare generation counters;
//! they gate readiness but never resolve to a value.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::node::ValueMap;

#[derive(Debug, Clone, Default)]
pub struct VersionedStore {
    values: BTreeMap<String, (Value, u64)>,
    /// node -> input name -> version consumed at the node's last execution.
    consumed: BTreeMap<String, BTreeMap<String, u64>>,
    /// signal name -> generation.
    signals: BTreeMap<String, u64>,
    /// node -> signal name -> generation observed at the node's last run.
    seen_signals: BTreeMap<String, BTreeMap<String, u64>>,
}

impl VersionedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a value at version 0 (defaults, bindings, provided inputs).
    pub fn seed(&mut self, name: impl Into<String>, value: Value) {
        self.values.insert(name.into(), (value, 0));
    }

    /// Merge a produced value under the given superstep version.
    pub fn merge(&mut self, name: impl Into<String>, value: Value, version: u64) {
        self.values.insert(name.into(), (value, version));
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name).map(|(v, _)| v)
    }

    pub fn version(&self, name: &str) -> Option<u64> {
        self.values.get(name).map(|(_, v)| *v)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// Record the input versions a node consumed when it executed.
    pub fn record_consumed(&mut self, node: &str, versions: BTreeMap<String, u64>) {
        self.consumed.insert(node.to_string(), versions);
    }

    pub fn consumed_versions(&self, node: &str) -> Option<&BTreeMap<String, u64>> {
        self.consumed.get(node)
    }

    pub fn has_executed(&self, node: &str) -> bool {
        self.consumed.contains_key(node)
    }

    /// Bump an emit-only signal's generation.
    pub fn bump_signal(&mut self, name: &str) {
        *self.signals.entry(name.to_string()).or_insert(0) += 1;
    }

    pub fn signal_generation(&self, name: &str) -> u64 {
        self.signals.get(name).copied().unwrap_or(0)
    }

    /// Record the signal generations a node observed when it executed.
    pub fn record_seen_signals(&mut self, node: &str, seen: BTreeMap<String, u64>) {
        self.seen_signals.insert(node.to_string(), seen);
    }

    pub fn seen_signal(&self, node: &str, signal: &str) -> u64 {
        self.seen_signals
            .get(node)
            .and_then(|m| m.get(signal).copied())
            .unwrap_or(0)
    }

    /// All current values (without versions).
    pub fn values_map(&self) -> ValueMap {
        self.values
            .iter()
            .map(|(name, (value, _))| (name.clone(), value.clone()))
            .collect()
    }

    /// Values restricted to the given names.
    pub fn select_values(&self, names: &[String]) -> ValueMap {
        names
            .iter()
            .filter_map(|n| self.get(n).map(|v| (n.clone(), v.clone())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_seed_and_merge_versions() {
        let mut store = VersionedStore::new();
        store.seed("x", json!(5));
        assert_eq!(store.version("x"), Some(0));

        store.merge("x", json!(6), 3);
        assert_eq!(store.get("x"), Some(&json!(6)));
        assert_eq!(store.version("x"), Some(3));
    }

    #[test]
    fn test_consumed_ledger() {
        let mut store = VersionedStore::new();
        assert!(!store.has_executed("double"));

        let mut consumed = BTreeMap::new();
        consumed.insert("x".to_string(), 0);
        store.record_consumed("double", consumed);

        assert!(store.has_executed("double"));
        assert_eq!(store.consumed_versions("double").unwrap()["x"], 0);
    }

    #[test]
    fn test_signals_start_at_zero_and_bump() {
        let mut store = VersionedStore::new();
        assert_eq!(store.signal_generation("saved"), 0);
        store.bump_signal("saved");
        store.bump_signal("saved");
        assert_eq!(store.signal_generation("saved"), 2);
        assert_eq!(store.seen_signal("writer", "saved"), 0);
    }

    #[test]
    fn test_select_values() {
        let mut store = VersionedStore::new();
        store.seed("a", json!(1));
        store.seed("b", json!(2));
        let picked = store.select_values(&["b".to_string(), "missing".to_string()]);
        assert_eq!(picked.len(), 1);
        assert_eq!(picked["b"], json!(2));
    }
}
