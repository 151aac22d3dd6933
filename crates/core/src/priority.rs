//! Mapping from application job priorities to broker priority tags.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Priority tag attached to a published notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerPriority {
    High,
    Normal,
    Low,
    Bulk,
}

impl BrokerPriority {
    /// All priorities, most urgent first.
    pub const ALL: [BrokerPriority; 4] = [
        BrokerPriority::High,
        BrokerPriority::Normal,
        BrokerPriority::Low,
        BrokerPriority::Bulk,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BrokerPriority::High => "high",
            BrokerPriority::Normal => "normal",
            BrokerPriority::Low => "low",
            BrokerPriority::Bulk => "bulk",
        }
    }
}

impl Default for BrokerPriority {
    fn default() -> Self {
        Self::Normal
    }
}

impl core::fmt::Display for BrokerPriority {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Table of numeric job priority → broker priority.
///
/// Unmapped values resolve to [`BrokerPriority::Normal`]; callers decide
/// whether that is worth a warning (see [`PriorityMap::lookup`]).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PriorityMap {
    entries: HashMap<i32, BrokerPriority>,
}

impl PriorityMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, job_priority: i32, priority: BrokerPriority) -> Self {
        self.insert(job_priority, priority);
        self
    }

    pub fn insert(&mut self, job_priority: i32, priority: BrokerPriority) {
        self.entries.insert(job_priority, priority);
    }

    /// The mapped priority, if any.
    pub fn lookup(&self, job_priority: i32) -> Option<BrokerPriority> {
        self.entries.get(&job_priority).copied()
    }

    pub fn resolve(&self, job_priority: i32) -> BrokerPriority {
        self.lookup(job_priority).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_known_and_defaults_unknown() {
        let map = PriorityMap::new()
            .with(-10, BrokerPriority::Bulk)
            .with(10, BrokerPriority::High);

        assert_eq!(map.resolve(-10), BrokerPriority::Bulk);
        assert_eq!(map.resolve(10), BrokerPriority::High);
        assert_eq!(map.lookup(99), None);
        assert_eq!(map.resolve(99), BrokerPriority::Normal);
    }

    #[test]
    fn all_is_ordered_by_urgency() {
        let mut sorted = BrokerPriority::ALL;
        sorted.sort();
        assert_eq!(sorted, BrokerPriority::ALL);
    }
}
