use std::fmt;

use dqs_common::{SetIdentifier, StageId};
use serde::{Deserialize, Serialize};

use crate::logical_plan::Operator;

/// Physical execution unit dispatched to workers.
///
/// Every variant carries a unique [`StageId`], its ordered inputs and one
/// output set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum AbstractJobStage {
    /// Row-at-a-time pipeline, optionally probing a previously built hash table.
    TupleSet(TupleSetStage),
    /// Group-by combine over a key partitioning shared by all workers.
    Aggregation(AggregationStage),
    /// Hash table over the small join side, replicated to every worker.
    BroadcastJoinBuild(BroadcastJoinBuildStage),
    /// Hash table over a join side, one partition per owning worker.
    HashPartitionedJoinBuild(HashPartitionedJoinBuildStage),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StageKind {
    TupleSet,
    Aggregation,
    BroadcastJoinBuild,
    HashPartitionedJoinBuild,
}

impl StageKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            StageKind::TupleSet => "TupleSetStage",
            StageKind::Aggregation => "AggregationStage",
            StageKind::BroadcastJoinBuild => "BroadcastJoinBuildStage",
            StageKind::HashPartitionedJoinBuild => "HashPartitionedJoinBuildStage",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl AbstractJobStage {
    pub fn id(&self) -> StageId {
        match self {
            AbstractJobStage::TupleSet(s) => s.id,
            AbstractJobStage::Aggregation(s) => s.id,
            AbstractJobStage::BroadcastJoinBuild(s) => s.id,
            AbstractJobStage::HashPartitionedJoinBuild(s) => s.id,
        }
    }

    pub fn inputs(&self) -> &[SetIdentifier] {
        match self {
            AbstractJobStage::TupleSet(s) => &s.inputs,
            AbstractJobStage::Aggregation(s) => &s.inputs,
            AbstractJobStage::BroadcastJoinBuild(s) => &s.inputs,
            AbstractJobStage::HashPartitionedJoinBuild(s) => &s.inputs,
        }
    }

    pub fn output(&self) -> &SetIdentifier {
        match self {
            AbstractJobStage::TupleSet(s) => &s.output,
            AbstractJobStage::Aggregation(s) => &s.output,
            AbstractJobStage::BroadcastJoinBuild(s) => &s.output,
            AbstractJobStage::HashPartitionedJoinBuild(s) => &s.output,
        }
    }

    pub fn kind(&self) -> StageKind {
        match self {
            AbstractJobStage::TupleSet(_) => StageKind::TupleSet,
            AbstractJobStage::Aggregation(_) => StageKind::Aggregation,
            AbstractJobStage::BroadcastJoinBuild(_) => StageKind::BroadcastJoinBuild,
            AbstractJobStage::HashPartitionedJoinBuild(_) => StageKind::HashPartitionedJoinBuild,
        }
    }

    /// Number of output partitions for stages that redistribute data.
    pub fn partitions(&self) -> Option<u32> {
        match self {
            AbstractJobStage::Aggregation(s) => Some(s.partitions),
            AbstractJobStage::HashPartitionedJoinBuild(s) => Some(s.partitions),
            _ => None,
        }
    }
}

/// Operator fused into a [`TupleSetStage`] pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PipelineOp {
    Filter { predicate: String },
    Project { columns: Vec<String> },
    Apply { function: String },
}

impl PipelineOp {
    /// `None` for operators that need their own stage.
    pub fn from_operator(op: &Operator) -> Option<Self> {
        match op {
            Operator::Filter { predicate } => Some(PipelineOp::Filter {
                predicate: predicate.clone(),
            }),
            Operator::Project { columns } => Some(PipelineOp::Project {
                columns: columns.clone(),
            }),
            Operator::Apply { function } => Some(PipelineOp::Apply {
                function: function.clone(),
            }),
            Operator::Aggregate { .. } | Operator::Join { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinStrategy {
    Broadcast,
    HashPartitioned,
}

/// Hash-table lookup at the head of a probe pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinProbe {
    pub hash_table: SetIdentifier,
    pub strategy: JoinStrategy,
    /// Keys of the streamed (probe) side.
    pub keys: Vec<String>,
    /// Stage that built `hash_table`.
    pub build_stage: StageId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TupleSetStage {
    pub id: StageId,
    pub inputs: Vec<SetIdentifier>,
    pub output: SetIdentifier,
    /// Applied in order after the optional probe.
    pub operators: Vec<PipelineOp>,
    #[serde(default)]
    pub probe: Option<JoinProbe>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationStage {
    pub id: StageId,
    pub inputs: Vec<SetIdentifier>,
    pub output: SetIdentifier,
    pub group_keys: Vec<String>,
    pub aggregates: Vec<String>,
    pub partitions: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastJoinBuildStage {
    pub id: StageId,
    pub inputs: Vec<SetIdentifier>,
    /// Hash-table set.
    pub output: SetIdentifier,
    pub keys: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HashPartitionedJoinBuildStage {
    pub id: StageId,
    pub inputs: Vec<SetIdentifier>,
    /// Hash-table set.
    pub output: SetIdentifier,
    pub keys: Vec<String>,
    pub partitions: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accessors_cover_every_variant() {
        let out = SetIdentifier::scoped("db", "ht", 1);
        let stage = AbstractJobStage::HashPartitionedJoinBuild(HashPartitionedJoinBuildStage {
            id: StageId(4),
            inputs: vec![SetIdentifier::new("d", "s")],
            output: out.clone(),
            keys: vec!["k".to_string()],
            partitions: 6,
        });
        assert_eq!(stage.id(), StageId(4));
        assert_eq!(stage.output(), &out);
        assert_eq!(stage.partitions(), Some(6));
        assert_eq!(stage.kind().to_string(), "HashPartitionedJoinBuildStage");
    }

    #[test]
    fn only_row_operators_fuse() {
        assert!(PipelineOp::from_operator(&Operator::Filter {
            predicate: "a > 1".to_string()
        })
        .is_some());
        assert!(PipelineOp::from_operator(&Operator::Aggregate {
            group_keys: vec![],
            aggregates: vec![]
        })
        .is_none());
    }

    #[test]
    fn stage_json_is_tagged_by_variant() {
        let stage = AbstractJobStage::BroadcastJoinBuild(BroadcastJoinBuildStage {
            id: StageId(2),
            inputs: vec![SetIdentifier::new("d", "small")],
            output: SetIdentifier::scoped("db", "j_ht", 1),
            keys: vec!["k".to_string()],
        });
        let json = serde_json::to_value(&stage).expect("encode");
        assert_eq!(json["stage"], "broadcast_join_build");
        let back: AbstractJobStage = serde_json::from_value(json).expect("decode");
        assert_eq!(back, stage);
    }
}
