// SPDX-License-Identifier: MIT OR Apache-2.0

// src/core/util/stats.rs
// Hierarchical activity counters. A save under "SaveType.Config.Curve"
// increments "SaveType", "SaveType.Config" and "SaveType.Config.Curve".

use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Default)]
pub struct StatsCounters {
    counters: Mutex<HashMap<String, i64>>,
}

impl StatsCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment the counter at `path` and every dot-separated prefix of it.
    pub fn add_to_hierarchy(&self, path: &str) {
        let mut counters = self.counters.lock().unwrap();
        let mut prefix = String::with_capacity(path.len());
        for part in path.split('.') {
            if !prefix.is_empty() {
                prefix.push('.');
            }
            prefix.push_str(part);
            *counters.entry(prefix.clone()).or_insert(0) += 1;
        }
    }

    pub fn get(&self, path: &str) -> i64 {
        self.counters.lock().unwrap().get(path).copied().unwrap_or(0)
    }

    pub fn snapshot(&self) -> HashMap<String, i64> {
        self.counters.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hierarchy_levels_all_incremented() {
        let stats = StatsCounters::new();
        stats.add_to_hierarchy("SaveType.Config.Curve");
        stats.add_to_hierarchy("SaveType.Config.Surface");
        assert_eq!(stats.get("SaveType"), 2);
        assert_eq!(stats.get("SaveType.Config"), 2);
        assert_eq!(stats.get("SaveType.Config.Curve"), 1);
        assert_eq!(stats.get("SaveType.Trade"), 0);
    }
}
