use dqs_common::{Result, SetIdentifier};

use crate::stats::TableStats;

/// Statistics reported by storage for one set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProvidedStats {
    /// Row/byte figures.
    pub stats: TableStats,
    /// Whether the figures were counted (`true`) or sampled/guessed.
    pub is_actual: bool,
}

/// Storage/catalog boundary consulted before planning (`getStatistics`).
///
/// Implementations are backend-specific; the scheduler only needs size and
/// row-count figures for the job's source sets.
pub trait StatisticsProvider: Send + Sync {
    /// Returns `Ok(None)` for sets storage knows nothing about; the planner
    /// then falls back to its configured defaults.
    ///
    /// # Errors
    /// Returns an error when the backend cannot be queried at all.
    fn get_statistics(&self, set: &SetIdentifier) -> Result<Option<ProvidedStats>>;
}
