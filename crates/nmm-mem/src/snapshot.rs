//! Serialized memory usage snapshots for diagnostics.

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Point-in-time usage of one manager, or an aggregate of several.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub name: String,
    pub used_bytes: u64,
    pub peak_bytes: u64,
    /// Reservation granularity; 0 for aggregates.
    pub block_size: u64,
    pub reservations: u64,
    pub shrinks: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<UsageSnapshot>,
}

impl UsageSnapshot {
    /// Build an aggregate node whose counters sum its children.
    pub fn aggregate(name: impl Into<String>, mut children: Vec<UsageSnapshot>) -> Self {
        children.sort_by(|a, b| a.name.cmp(&b.name));
        let sum = |f: fn(&UsageSnapshot) -> u64| children.iter().map(f).sum::<u64>();
        Self {
            name: name.into(),
            used_bytes: sum(|c| c.used_bytes),
            peak_bytes: sum(|c| c.peak_bytes),
            block_size: 0,
            reservations: sum(|c| c.reservations),
            shrinks: sum(|c| c.shrinks),
            children,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn find(&self, name: &str) -> Option<&UsageSnapshot> {
        if self.name == name {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find(name))
    }
}
