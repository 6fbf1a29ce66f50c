use std::collections::HashMap;

use dqs_common::SetIdentifier;
use serde::{Deserialize, Serialize};

/// Row count and byte size of one dataset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableStats {
    pub rows: u64,
    pub bytes: u64,
}

impl TableStats {
    pub fn new(rows: u64, bytes: u64) -> Self {
        Self { rows, bytes }
    }

    /// Sum of two partial figures (one worker's contribution plus another's).
    pub fn merge(self, other: TableStats) -> TableStats {
        TableStats {
            rows: self.rows.saturating_add(other.rows),
            bytes: self.bytes.saturating_add(other.bytes),
        }
    }
}

/// Best known figure for a set and whether it was observed or estimated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsEstimate {
    pub rows: u64,
    pub bytes: u64,
    pub is_actual: bool,
}

impl StatsEstimate {
    pub fn stats(&self) -> TableStats {
        TableStats::new(self.rows, self.bytes)
    }
}

#[derive(Debug, Clone, Default)]
struct SetStatistics {
    estimated: Option<TableStats>,
    actual: Option<TableStats>,
}

/// Per-set estimated and actual statistics consulted by the planner.
///
/// Once [`StatisticsStore::record_actual`] ran for a set, every later
/// [`StatisticsStore::estimate`] for it returns the actual figure; new
/// estimates never shadow it.
#[derive(Debug, Clone)]
pub struct StatisticsStore {
    sets: HashMap<SetIdentifier, SetStatistics>,
    default: TableStats,
}

impl StatisticsStore {
    pub fn new(default: TableStats) -> Self {
        Self {
            sets: HashMap::new(),
            default,
        }
    }

    pub fn record_estimate(&mut self, set: &SetIdentifier, stats: TableStats) {
        self.sets.entry(set.clone()).or_default().estimated = Some(stats);
    }

    pub fn record_actual(&mut self, set: &SetIdentifier, rows: u64, bytes: u64) {
        self.sets.entry(set.clone()).or_default().actual = Some(TableStats::new(rows, bytes));
    }

    /// Actual if present, else the last estimate, else the configured default.
    pub fn estimate(&self, set: &SetIdentifier) -> StatsEstimate {
        match self.sets.get(set) {
            Some(SetStatistics {
                actual: Some(a), ..
            }) => StatsEstimate {
                rows: a.rows,
                bytes: a.bytes,
                is_actual: true,
            },
            Some(SetStatistics {
                estimated: Some(e),
                ..
            }) => StatsEstimate {
                rows: e.rows,
                bytes: e.bytes,
                is_actual: false,
            },
            _ => StatsEstimate {
                rows: self.default.rows,
                bytes: self.default.bytes,
                is_actual: false,
            },
        }
    }

    pub fn actual(&self, set: &SetIdentifier) -> Option<TableStats> {
        self.sets.get(set).and_then(|s| s.actual)
    }

    /// Drop everything known about a set (after it was deleted from storage).
    pub fn forget(&mut self, set: &SetIdentifier) {
        self.sets.remove(set);
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }
}

impl Default for StatisticsStore {
    fn default() -> Self {
        Self::new(TableStats::new(10_000, 10 * 1024 * 1024))
    }
}
