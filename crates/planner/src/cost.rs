//! Output-size estimation for planning decisions.
//!
//! Figures are used to rank alternatives (which join side is smaller, which
//! ready stage materializes less). Filters and aggregations scale their input
//! by a configured factor; joins are bounded by their inputs.

use dqs_common::SchedulerConfig;
use dqs_storage::{ResourceSnapshot, TableStats};

use crate::logical_plan::Operator;

#[derive(Debug, Clone, Copy)]
pub struct CostModel {
    pub filter_selectivity: f64,
    pub aggregation_reduction: f64,
}

impl CostModel {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            filter_selectivity: config.filter_selectivity,
            aggregation_reduction: config.aggregation_reduction,
        }
    }

    /// Estimated output of one operator given its input figures.
    pub fn operator_output(&self, op: &Operator, inputs: &[TableStats]) -> TableStats {
        let first = inputs.first().copied().unwrap_or_default();
        match op {
            Operator::Filter { .. } => scale(first, self.filter_selectivity),
            Operator::Project { .. } | Operator::Apply { .. } => first,
            Operator::Aggregate { .. } => scale(first, self.aggregation_reduction),
            Operator::Join { .. } => {
                let rows = inputs.iter().map(|s| s.rows).max().unwrap_or(0);
                let bytes = inputs
                    .iter()
                    .fold(0u64, |acc, s| acc.saturating_add(s.bytes));
                TableStats::new(rows, bytes)
            }
        }
    }

    /// Fold a fused operator chain: the head sees `inputs`, every later
    /// operator sees its predecessor's output.
    pub fn pipeline_output<'a>(
        &self,
        ops: impl IntoIterator<Item = &'a Operator>,
        inputs: &[TableStats],
    ) -> TableStats {
        let mut ops = ops.into_iter();
        let Some(head) = ops.next() else {
            return inputs.first().copied().unwrap_or_default();
        };
        let mut out = self.operator_output(head, inputs);
        for op in ops {
            out = self.operator_output(op, &[out]);
        }
        out
    }
}

/// Largest build side still eligible for a broadcast join on `snapshot`.
pub fn broadcast_threshold(config: &SchedulerConfig, snapshot: &ResourceSnapshot) -> u64 {
    let cap = if config.broadcast_memory_fraction > 0.0 {
        snapshot
            .min_memory_bytes()
            .map(|m| (m as f64 * config.broadcast_memory_fraction) as u64)
    } else {
        None
    };
    match cap {
        Some(cap) => config.broadcast_threshold_bytes.min(cap),
        None => config.broadcast_threshold_bytes,
    }
}

fn scale(stats: TableStats, factor: f64) -> TableStats {
    let shrink = |v: u64| {
        if v == 0 {
            0
        } else {
            ((v as f64 * factor).round() as u64).max(1)
        }
    };
    TableStats::new(shrink(stats.rows), shrink(stats.bytes))
}
