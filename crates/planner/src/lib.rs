//! Lazy, statistics-driven planning of a logical DAG into waves of physical
//! job stages.

pub mod analyzer;
pub mod cost;
pub mod explain;
pub mod logical_plan;
pub mod stage;

pub use analyzer::{PlanAnalyzer, Wave};
pub use cost::CostModel;
pub use explain::{explain_plan, explain_stages, explain_wave};
pub use logical_plan::*;
pub use stage::*;
