use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Counters for one I/O management session (or the sum of several).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoStats {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub invalidations: u64,
    pub ingested_entries: u64,
    pub refreshes: u64,
    pub buffered_writes: u64,
    pub flushes: u64,
    pub flushed_entries: u64,

    /// Calls that reached the wire, keyed by `service/method`. Only filled
    /// when traffic logging is enabled.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub wire_calls: BTreeMap<String, u64>,
}

impl IoStats {
    /// Fraction of cache lookups served locally.
    pub fn hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            self.cache_hits as f64 / total as f64
        }
    }

    pub fn record_wire_call(&mut self, service: &str, method: &str) {
        *self
            .wire_calls
            .entry(format!("{service}/{method}"))
            .or_default() += 1;
    }

    pub fn total_wire_calls(&self) -> u64 {
        self.wire_calls.values().sum()
    }

    pub fn merge(&mut self, other: &IoStats) {
        self.cache_hits += other.cache_hits;
        self.cache_misses += other.cache_misses;
        self.invalidations += other.invalidations;
        self.ingested_entries += other.ingested_entries;
        self.refreshes += other.refreshes;
        self.buffered_writes += other.buffered_writes;
        self.flushes += other.flushes;
        self.flushed_entries += other.flushed_entries;
        for (name, count) in &other.wire_calls {
            *self.wire_calls.entry(name.clone()).or_default() += count;
        }
    }
}
