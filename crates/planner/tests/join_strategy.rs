use std::sync::Arc;

use dqs_common::{JobId, SchedulerConfig, SequenceGenerator, SetIdentifier};
use dqs_planner::{AbstractJobStage, JoinStrategy, LogicalPlan, PlanAnalyzer, PlanNode, StageKind};
use dqs_storage::{NodeResource, StaticResources, StatisticsStore, TableStats};

const MB: u64 = 1024 * 1024;

fn eight_core_cluster() -> StaticResources {
    StaticResources::new(vec![
        NodeResource::new("w1:8108", 4, 16 * 1024 * MB),
        NodeResource::new("w2:8108", 4, 16 * 1024 * MB),
    ])
}

fn job(instance: u64) -> JobId {
    JobId {
        name: format!("Job-test_{instance}"),
        instance,
    }
}

fn join_plan() -> LogicalPlan {
    LogicalPlan::new("db")
        .with_source("left", SetIdentifier::new("d", "left"))
        .with_source("right", SetIdentifier::new("d", "right"))
        .with_node(PlanNode::join("j", "left", "right", &["id"], &["id"]))
}

#[test]
fn small_left_side_is_broadcast() {
    let config = SchedulerConfig {
        broadcast_threshold_bytes: 100 * MB,
        ..SchedulerConfig::default()
    };
    let mut stats = StatisticsStore::default();
    stats.record_estimate(&SetIdentifier::new("d", "left"), TableStats::new(500_000, 50 * MB));
    stats.record_estimate(
        &SetIdentifier::new("d", "right"),
        TableStats::new(20_000_000, 2048 * MB),
    );

    let mut analyzer =
        PlanAnalyzer::new(&join_plan(), &job(1), &config, Arc::new(SequenceGenerator::new()))
            .expect("analyzer");
    let wave = analyzer
        .next_wave(&mut stats, &eight_core_cluster(), None)
        .expect("wave");

    assert_eq!(wave.len(), 1);
    let AbstractJobStage::BroadcastJoinBuild(build) = &wave.stages[0] else {
        panic!("expected broadcast build, got {:?}", wave.stages[0].kind());
    };
    assert_eq!(build.inputs, vec![SetIdentifier::new("d", "left")]);
    assert_eq!(build.output, SetIdentifier::scoped("db", "j_ht", 1));
    assert!(wave.shuffles.is_empty());
}

#[test]
fn partitioned_aggregation_uses_core_ratio() {
    let plan = LogicalPlan::new("db")
        .with_source("s", SetIdentifier::new("d", "s"))
        .with_node(PlanNode::aggregate("g", "s", &["k"], &["sum(v)"]));
    let mut analyzer = PlanAnalyzer::new(
        &plan,
        &job(1),
        &SchedulerConfig::default(),
        Arc::new(SequenceGenerator::new()),
    )
    .expect("analyzer");
    let wave = analyzer
        .next_wave(&mut StatisticsStore::default(), &eight_core_cluster(), None)
        .expect("wave");

    let stage = &wave.stages[0];
    assert_eq!(stage.kind(), StageKind::Aggregation);
    assert_eq!(stage.partitions(), Some(6));
    let shuffle = wave.shuffle_for(stage.id()).expect("mapping");
    assert_eq!(shuffle.partition_count(), 6);
    assert_eq!(shuffle.participants().len(), 2);
}

#[test]
fn observed_size_flips_join_to_broadcast() {
    let plan = LogicalPlan::new("db")
        .with_source("big", SetIdentifier::new("d", "big"))
        .with_source("other", SetIdentifier::new("d", "other"))
        .with_node(PlanNode::filter("f", "big", "rare(x)"))
        .with_node(PlanNode::join("j", "f", "other", &["k"], &["k"]));
    let mut stats = StatisticsStore::default();
    stats.record_estimate(&SetIdentifier::new("d", "big"), TableStats::new(1 << 24, 2048 * MB));
    stats.record_estimate(&SetIdentifier::new("d", "other"), TableStats::new(1 << 24, 1536 * MB));
    let cluster = eight_core_cluster();

    let mut analyzer = PlanAnalyzer::new(
        &plan,
        &job(2),
        &SchedulerConfig::default(),
        Arc::new(SequenceGenerator::new()),
    )
    .expect("analyzer");
    let w1 = analyzer.next_wave(&mut stats, &cluster, None).expect("w1");
    let filtered = w1.stages[0].output().clone();
    assert_eq!(stats.estimate(&filtered).bytes, 1024 * MB);

    stats.record_actual(&filtered, 1_000, MB);
    analyzer.mark_completed(&[w1.stages[0].id()]);

    let w2 = analyzer.next_wave(&mut stats, &cluster, None).expect("w2");
    assert_eq!(w2.stages[0].kind(), StageKind::BroadcastJoinBuild);
    assert_eq!(w2.stages[0].inputs(), [filtered.clone()]);
    analyzer.mark_completed(&[w2.stages[0].id()]);

    let w3 = analyzer.next_wave(&mut stats, &cluster, None).expect("w3");
    let AbstractJobStage::TupleSet(probe) = &w3.stages[0] else {
        panic!("expected probe stage");
    };
    let probe_info = probe.probe.as_ref().expect("probe");
    assert_eq!(probe_info.strategy, JoinStrategy::Broadcast);
    assert_eq!(probe.inputs[0], SetIdentifier::new("d", "other"));
}

#[test]
fn large_sides_are_hash_partitioned() {
    let mut stats = StatisticsStore::default();
    stats.record_estimate(&SetIdentifier::new("d", "left"), TableStats::new(1, 4096 * MB));
    stats.record_estimate(&SetIdentifier::new("d", "right"), TableStats::new(1, 2048 * MB));
    let mut analyzer = PlanAnalyzer::new(
        &join_plan(),
        &job(1),
        &SchedulerConfig::default(),
        Arc::new(SequenceGenerator::new()),
    )
    .expect("analyzer");
    let wave = analyzer
        .next_wave(&mut stats, &eight_core_cluster(), None)
        .expect("wave");
    let AbstractJobStage::HashPartitionedJoinBuild(build) = &wave.stages[0] else {
        panic!("expected partitioned build");
    };
    assert_eq!(build.inputs, vec![SetIdentifier::new("d", "right")]);
    assert_eq!(build.partitions, 6);
    assert!(wave.shuffle_for(build.id).is_some());
}

fn first_stage_kind(left_bytes: u64, threshold: u64) -> StageKind {
    let config = SchedulerConfig {
        broadcast_threshold_bytes: threshold,
        ..SchedulerConfig::default()
    };
    let mut stats = StatisticsStore::default();
    stats.record_estimate(&SetIdentifier::new("d", "left"), TableStats::new(1_000, left_bytes));
    stats.record_estimate(&SetIdentifier::new("d", "right"), TableStats::new(1, 2048 * MB));
    let mut analyzer =
        PlanAnalyzer::new(&join_plan(), &job(1), &config, Arc::new(SequenceGenerator::new()))
            .expect("analyzer");
    let wave = analyzer
        .next_wave(&mut stats, &eight_core_cluster(), None)
        .expect("wave");
    wave.stages[0].kind()
}

#[test]
fn build_side_at_threshold_is_not_broadcast() {
    assert_eq!(
        first_stage_kind(100 * MB, 100 * MB),
        StageKind::HashPartitionedJoinBuild
    );
    assert_eq!(
        first_stage_kind(100 * MB - 1, 100 * MB),
        StageKind::BroadcastJoinBuild
    );
}
