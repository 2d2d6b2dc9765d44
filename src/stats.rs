//! Write-only statistics sink.
//!
//! Filters and the processor publish counters here under
//! `scope/filter-id/name` keys; the host's reporting layer drains the sink on
//! its own schedule. The sink never feeds back into filtering decisions.

use dashmap::DashMap;

/// Shared counter sink keyed by `scope/name`.
#[derive(Debug, Default)]
pub struct StatsSink {
    counters: DashMap<String, i64>,
}

impl StatsSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a counter value, overwriting any previous reading.
    pub fn set(&self, scope: &str, name: &str, value: i64) {
        self.counters.insert(format!("{scope}/{name}"), value);
    }

    /// Read back a published value. Mainly for the host's export path and
    /// tests; filters never read from the sink.
    pub fn get(&self, scope: &str, name: &str) -> Option<i64> {
        self.counters.get(&format!("{scope}/{name}")).map(|v| *v)
    }

    /// Snapshot all counters, sorted by key.
    pub fn snapshot(&self) -> Vec<(String, i64)> {
        let mut entries: Vec<_> = self
            .counters
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        entries.sort();
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_overwrites_previous_value() {
        let sink = StatsSink::new();
        sink.set("spam-filter", "known-spammers/known_spammers", 3);
        sink.set("spam-filter", "known-spammers/known_spammers", 5);
        assert_eq!(sink.get("spam-filter", "known-spammers/known_spammers"), Some(5));
    }

    #[test]
    fn snapshot_is_sorted() {
        let sink = StatsSink::new();
        sink.set("s", "b", 2);
        sink.set("s", "a", 1);
        let snapshot = sink.snapshot();
        assert_eq!(snapshot, vec![("s/a".to_string(), 1), ("s/b".to_string(), 2)]);
    }
}
