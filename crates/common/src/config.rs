use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DqsError, Result};

/// Scheduler behavior/configuration knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Partitions per available worker core for partitioned joins/aggregations.
    pub partition_to_core_ratio: f64,
    /// Fold actual statistics from completed waves back into planning.
    ///
    /// When disabled every decision uses pre-execution estimates; actual
    /// figures still show up in the job trace.
    pub dynamic_planning: bool,
    /// Delete an intermediate set as soon as all of its consumers completed.
    pub remove_intermediate_data_early: bool,
    /// Persist actual statistics across job runs keyed by logical set name.
    pub self_learning: bool,
    /// All workers share one host; kept for deployments that co-locate nodes.
    pub pseudo_cluster_mode: bool,
    /// Build sides strictly smaller than this are broadcast.
    pub broadcast_threshold_bytes: u64,
    /// Cap on the broadcast build side as a fraction of the smallest worker's
    /// memory. `<= 0` disables the cap.
    pub broadcast_memory_fraction: f64,
    /// Row count assumed for a set nothing is known about.
    pub default_row_count: u64,
    /// Byte size assumed for a set nothing is known about.
    pub default_byte_size: u64,
    /// Fraction of rows surviving a filter in the cost model.
    pub filter_selectivity: f64,
    /// Output/input row ratio of an aggregation in the cost model.
    pub aggregation_reduction: f64,
    /// Bound on every worker call made by the dispatcher.
    pub dispatch_timeout_ms: u64,
    /// JSON file backing the self-learning statistics cache.
    pub statistics_cache_path: Option<PathBuf>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            partition_to_core_ratio: 0.75,
            dynamic_planning: true,
            remove_intermediate_data_early: false,
            self_learning: false,
            pseudo_cluster_mode: false,
            broadcast_threshold_bytes: 64 * 1024 * 1024,
            broadcast_memory_fraction: 0.25,
            default_row_count: 10_000,
            default_byte_size: 10 * 1024 * 1024,
            filter_selectivity: 0.5,
            aggregation_reduction: 0.1,
            dispatch_timeout_ms: 30_000,
            statistics_cache_path: None,
        }
    }
}

impl SchedulerConfig {
    /// Defaults overridden by `DQS_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let d = Self::default();
        let cfg = Self {
            partition_to_core_ratio: env_or("DQS_PARTITION_TO_CORE_RATIO", d.partition_to_core_ratio)?,
            dynamic_planning: env_or("DQS_DYNAMIC_PLANNING", d.dynamic_planning)?,
            remove_intermediate_data_early: env_or(
                "DQS_REMOVE_INTERMEDIATE_DATA_EARLY",
                d.remove_intermediate_data_early,
            )?,
            self_learning: env_or("DQS_SELF_LEARNING", d.self_learning)?,
            pseudo_cluster_mode: env_or("DQS_PSEUDO_CLUSTER_MODE", d.pseudo_cluster_mode)?,
            broadcast_threshold_bytes: env_or(
                "DQS_BROADCAST_THRESHOLD_BYTES",
                d.broadcast_threshold_bytes,
            )?,
            broadcast_memory_fraction: env_or(
                "DQS_BROADCAST_MEMORY_FRACTION",
                d.broadcast_memory_fraction,
            )?,
            default_row_count: env_or("DQS_DEFAULT_ROW_COUNT", d.default_row_count)?,
            default_byte_size: env_or("DQS_DEFAULT_BYTE_SIZE", d.default_byte_size)?,
            filter_selectivity: env_or("DQS_FILTER_SELECTIVITY", d.filter_selectivity)?,
            aggregation_reduction: env_or("DQS_AGGREGATION_REDUCTION", d.aggregation_reduction)?,
            dispatch_timeout_ms: env_or("DQS_DISPATCH_TIMEOUT_MS", d.dispatch_timeout_ms)?,
            statistics_cache_path: env::var("DQS_STATISTICS_CACHE_PATH").ok().map(PathBuf::from),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject values that would make planning meaningless.
    pub fn validate(&self) -> Result<()> {
        if !(self.partition_to_core_ratio > 0.0) {
            return Err(DqsError::InvalidConfig(format!(
                "partition_to_core_ratio must be > 0, got {}",
                self.partition_to_core_ratio
            )));
        }
        for (name, v) in [
            ("filter_selectivity", self.filter_selectivity),
            ("aggregation_reduction", self.aggregation_reduction),
        ] {
            if !(v > 0.0 && v <= 1.0) {
                return Err(DqsError::InvalidConfig(format!(
                    "{name} must be in (0, 1], got {v}"
                )));
            }
        }
        if self.dispatch_timeout_ms == 0 {
            return Err(DqsError::InvalidConfig(
                "dispatch_timeout_ms must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch_timeout_ms)
    }
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| DqsError::InvalidConfig(format!("{key}={raw}: {e}"))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::SchedulerConfig;

    #[test]
    fn defaults_are_valid() {
        SchedulerConfig::default().validate().expect("valid defaults");
    }

    #[test]
    fn rejects_non_positive_ratio() {
        let cfg = SchedulerConfig {
            partition_to_core_ratio: 0.0,
            ..SchedulerConfig::default()
        };
        let err = cfg.validate().expect_err("invalid ratio");
        assert!(err.to_string().contains("partition_to_core_ratio"));
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let cfg: SchedulerConfig =
            serde_json::from_str(r#"{"self_learning": true}"#).expect("decode");
        assert!(cfg.self_learning);
        assert_eq!(cfg.partition_to_core_ratio, 0.75);
    }
}
