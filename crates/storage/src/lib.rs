//! Planner-facing storage collaborators: statistics, worker resources and the
//! source-set catalog.

pub mod catalog;
pub mod learning;
pub mod provider;
pub mod resources;
pub mod stats;

pub use catalog::*;
pub use learning::{InMemoryStatisticsCache, JsonFileStatisticsCache, LearnedStatistics};
pub use provider::*;
pub use resources::*;
pub use stats::*;
