//! Shared configuration, error types, IDs, and observability primitives for the
//! scheduler crates.
//!
//! Architecture role:
//! - defines [`SchedulerConfig`] passed across planner/dispatcher/scheduler
//! - provides the common [`DqsError`] / [`Result`] contracts
//! - hosts typed identifiers ([`SetIdentifier`], [`StageId`], [`JobId`]) and
//!   the injectable [`SequenceGenerator`]
//! - hosts metrics and the optional exporter
//!
//! Feature flags:
//! - `profiling`: enables the metrics HTTP exporter helpers.

pub mod config;
pub mod error;
pub mod ids;
pub mod metrics;
#[cfg(feature = "profiling")]
pub mod metrics_exporter;

pub use config::SchedulerConfig;
pub use error::{DqsError, Result};
pub use ids::*;
pub use metrics::MetricsRegistry;
#[cfg(feature = "profiling")]
pub use metrics_exporter::run_metrics_exporter;
