use crate::analyzer::Wave;
use crate::logical_plan::{LogicalPlan, Operator};
use crate::stage::{AbstractJobStage, PipelineOp};

/// Render the logical DAG as human-readable multiline text.
pub fn explain_plan(plan: &LogicalPlan) -> String {
    let mut s = format!("Plan database={}\n", plan.database);
    for src in &plan.sources {
        s.push_str(&format!("  Source {} := {}\n", src.name, src.set));
    }
    for node in &plan.nodes {
        s.push_str(&format!(
            "  {} {} <- [{}]",
            node.op.name(),
            node.name,
            node.inputs.join(", ")
        ));
        match &node.op {
            Operator::Filter { predicate } => s.push_str(&format!(" predicate={predicate}")),
            Operator::Project { columns } => s.push_str(&format!(" columns={columns:?}")),
            Operator::Apply { function } => s.push_str(&format!(" function={function}")),
            Operator::Aggregate {
                group_keys,
                aggregates,
            } => s.push_str(&format!(" group_by={group_keys:?} aggs={aggregates:?}")),
            Operator::Join {
                left_keys,
                right_keys,
            } => s.push_str(&format!(" on={left_keys:?}={right_keys:?}")),
        }
        if let Some(sink) = &node.sink {
            s.push_str(&format!(" sink={sink}"));
        }
        s.push('\n');
    }
    s
}

/// Stage listing, one block per stage in dispatch order.
pub fn explain_stages(stages: &[AbstractJobStage]) -> String {
    let mut s = String::new();
    for stage in stages {
        fmt_stage(stage, &mut s);
    }
    s
}

/// [`explain_stages`] headed by the wave index, with partition layouts.
pub fn explain_wave(wave: &Wave) -> String {
    let mut s = format!("Wave {} stages={}\n", wave.index, wave.len());
    for stage in &wave.stages {
        fmt_stage(stage, &mut s);
        if let Some(estimate) = wave.estimates.get(&stage.id()) {
            s.push_str(&format!(
                "    estimate rows={} bytes={}\n",
                estimate.rows, estimate.bytes
            ));
        }
        if let Some(shuffle) = wave.shuffle_for(stage.id()) {
            let layout = shuffle
                .participants()
                .iter()
                .map(|n| format!("{}:{}", n, shuffle.partitions_for(n).len()))
                .collect::<Vec<_>>();
            s.push_str(&format!(
                "    shuffle partitions={} nodes=[{}]\n",
                shuffle.partition_count(),
                layout.join(", ")
            ));
        }
    }
    s
}

fn fmt_stage(stage: &AbstractJobStage, out: &mut String) {
    let inputs = stage
        .inputs()
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    out.push_str(&format!(
        "  {} id={} inputs=[{}] output={}\n",
        stage.kind(),
        stage.id(),
        inputs,
        stage.output()
    ));
    match stage {
        AbstractJobStage::TupleSet(t) => {
            if let Some(p) = &t.probe {
                out.push_str(&format!(
                    "    probe {} strategy={:?} keys={:?} build_stage={}\n",
                    p.hash_table, p.strategy, p.keys, p.build_stage
                ));
            }
            for op in &t.operators {
                out.push_str(&format!("    {}\n", fmt_op(op)));
            }
        }
        AbstractJobStage::Aggregation(a) => out.push_str(&format!(
            "    group_by={:?} aggs={:?} partitions={}\n",
            a.group_keys, a.aggregates, a.partitions
        )),
        AbstractJobStage::BroadcastJoinBuild(b) => {
            out.push_str(&format!("    keys={:?}\n", b.keys))
        }
        AbstractJobStage::HashPartitionedJoinBuild(h) => out.push_str(&format!(
            "    keys={:?} partitions={}\n",
            h.keys, h.partitions
        )),
    }
}

fn fmt_op(op: &PipelineOp) -> String {
    match op {
        PipelineOp::Filter { predicate } => format!("Filter {predicate}"),
        PipelineOp::Project { columns } => format!("Project {columns:?}"),
        PipelineOp::Apply { function } => format!("Apply {function}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logical_plan::PlanNode;
    use crate::stage::TupleSetStage;
    use dqs_common::{SetIdentifier, StageId};

    #[test]
    fn plan_listing_shows_every_node() {
        let plan = LogicalPlan::new("db")
            .with_source("s", SetIdentifier::new("d", "s"))
            .with_node(
                PlanNode::filter("f", "s", "x > 1").with_sink(SetIdentifier::new("d", "out")),
            );
        let text = explain_plan(&plan);
        assert!(text.contains("Source s := d.s"));
        assert!(text.contains("Filter f <- [s] predicate=x > 1 sink=d.out"));
    }

    #[test]
    fn stage_listing_includes_operators() {
        let stage = AbstractJobStage::TupleSet(TupleSetStage {
            id: StageId(7),
            inputs: vec![SetIdentifier::new("d", "s")],
            output: SetIdentifier::scoped("db", "f", 3),
            operators: vec![PipelineOp::Filter {
                predicate: "x > 1".to_string(),
            }],
            probe: None,
        });
        let text = explain_stages(&[stage]);
        assert!(text.contains("TupleSetStage id=7 inputs=[d.s] output=db.f#3"));
        assert!(text.contains("Filter x > 1"));
    }
}
