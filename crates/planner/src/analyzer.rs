use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use dqs_common::{
    DqsError, JobId, Result, SchedulerConfig, SequenceGenerator, SetIdentifier, StageId,
};
use dqs_shuffle::ShuffleInfo;
use dqs_storage::{
    LearnedStatistics, ResourceProvider, ResourceSnapshot, StatisticsStore, TableStats,
};
use tracing::debug;

use crate::cost::{broadcast_threshold, CostModel};
use crate::logical_plan::{LogicalPlan, Operator};
use crate::stage::{
    AbstractJobStage, AggregationStage, BroadcastJoinBuildStage, HashPartitionedJoinBuildStage,
    JoinProbe, JoinStrategy, PipelineOp, TupleSetStage,
};

/// One batch of mutually independent stages, dispatched together.
#[derive(Debug, Clone, Default)]
pub struct Wave {
    /// 1-based position within the job.
    pub index: u32,
    /// Stages in dispatch order.
    pub stages: Vec<AbstractJobStage>,
    /// Partition mapping needed by a stage, keyed by that stage.
    pub shuffles: HashMap<StageId, ShuffleInfo>,
    /// Planner estimate of each stage's output.
    pub estimates: HashMap<StageId, TableStats>,
}

impl Wave {
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn shuffle_for(&self, stage: StageId) -> Option<&ShuffleInfo> {
        self.shuffles.get(&stage)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnitKind {
    Pipeline,
    Aggregate,
    Join,
}

/// Which stage a ready unit needs next.
#[derive(Debug, Clone, Copy)]
enum Phase {
    Pipeline,
    Aggregate,
    JoinBuild,
    JoinProbe,
}

#[derive(Debug, Clone)]
struct JoinBuild {
    stage: StageId,
    hash_table: SetIdentifier,
    probe_input: SetIdentifier,
    strategy: JoinStrategy,
    probe_keys: Vec<String>,
}

#[derive(Debug, Clone)]
enum UnitState {
    Pending,
    Building(JoinBuild),
    Built(JoinBuild),
    Running(StageId),
    Completed,
}

/// Plan nodes executed by one stage (two for joins): a head operator plus
/// the row operators fused behind it.
#[derive(Debug, Clone)]
struct Unit {
    nodes: Vec<usize>,
    kind: UnitKind,
    inputs: Vec<SetIdentifier>,
    output: SetIdentifier,
    /// Output survives the job (explicit sink or terminal node).
    is_output: bool,
    hash_table: Option<SetIdentifier>,
    state: UnitState,
}

#[derive(Debug, Clone)]
struct LiveShuffle {
    info: ShuffleInfo,
    /// Stage whose completion ends the mapping's lifetime.
    release_on: Option<StageId>,
}

/// Lazily turns a [`LogicalPlan`] into waves of physical stages.
///
/// Each call to [`PlanAnalyzer::next_wave`] plans only the units whose inputs
/// are materialized, using the statistics known at that moment, so figures
/// observed in earlier waves drive join strategy and partition counts of
/// later ones.
#[derive(Debug)]
pub struct PlanAnalyzer {
    plan: LogicalPlan,
    job: JobId,
    config: SchedulerConfig,
    cost: CostModel,
    sequence: Arc<SequenceGenerator>,
    units: Vec<Unit>,
    /// Sources plus outputs of completed stages.
    materialized: HashSet<SetIdentifier>,
    completed: BTreeSet<StageId>,
    in_flight: BTreeMap<StageId, usize>,
    shuffles: BTreeMap<StageId, LiveShuffle>,
    released: HashSet<SetIdentifier>,
    waves: u32,
}

impl PlanAnalyzer {
    /// Validate `plan` and group its nodes into schedulable units.
    ///
    /// # Errors
    /// [`DqsError::Plan`] for any structural problem reported by
    /// [`LogicalPlan::validate`].
    pub fn new(
        plan: &LogicalPlan,
        job: &JobId,
        config: &SchedulerConfig,
        sequence: Arc<SequenceGenerator>,
    ) -> Result<Self> {
        plan.validate()?;
        let order = plan.topological_order()?;
        let consumers = plan.consumers();

        let mut unit_of: HashMap<usize, usize> = HashMap::new();
        let mut groups: Vec<Vec<usize>> = Vec::new();
        for idx in order {
            let node = &plan.nodes[idx];
            let fuse_into = if node.op.is_pipelined() {
                plan.node_index(&node.inputs[0])
                    .filter(|p| {
                        let parent = &plan.nodes[*p];
                        parent.sink.is_none()
                            && !matches!(parent.op, Operator::Aggregate { .. })
                            && consumers.get(parent.name.as_str()).map_or(0, |c| c.len()) == 1
                    })
                    .and_then(|p| unit_of.get(&p).copied())
            } else {
                None
            };
            match fuse_into {
                Some(u) => {
                    groups[u].push(idx);
                    unit_of.insert(idx, u);
                }
                None => {
                    unit_of.insert(idx, groups.len());
                    groups.push(vec![idx]);
                }
            }
        }

        let output_of = |tail: usize| {
            let node = &plan.nodes[tail];
            node.sink.clone().unwrap_or_else(|| {
                SetIdentifier::scoped(plan.database.clone(), node.name.clone(), job.instance)
            })
        };
        let mut units = Vec::with_capacity(groups.len());
        for nodes in groups {
            let head = &plan.nodes[nodes[0]];
            let tail_idx = nodes[nodes.len() - 1];
            let tail = &plan.nodes[tail_idx];
            let mut inputs = Vec::with_capacity(head.inputs.len());
            for name in &head.inputs {
                let set = match plan.source(name) {
                    Some(src) => src.set.clone(),
                    None => {
                        let producer = plan.node_index(name).ok_or_else(|| {
                            DqsError::Plan(format!("set '{name}' has no producer"))
                        })?;
                        output_of(producer)
                    }
                };
                inputs.push(set);
            }
            let kind = match head.op {
                Operator::Aggregate { .. } => UnitKind::Aggregate,
                Operator::Join { .. } => UnitKind::Join,
                _ => UnitKind::Pipeline,
            };
            units.push(Unit {
                kind,
                inputs,
                output: output_of(tail_idx),
                is_output: tail.sink.is_some()
                    || consumers.get(tail.name.as_str()).map_or(true, |c| c.is_empty()),
                hash_table: None,
                state: UnitState::Pending,
                nodes,
            });
        }

        Ok(Self {
            plan: plan.clone(),
            job: job.clone(),
            config: config.clone(),
            cost: CostModel::from_config(config),
            sequence,
            units,
            materialized: plan.sources.iter().map(|s| s.set.clone()).collect(),
            completed: BTreeSet::new(),
            in_flight: BTreeMap::new(),
            shuffles: BTreeMap::new(),
            released: HashSet::new(),
            waves: 0,
        })
    }

    /// Plan every stage whose inputs are materialized.
    ///
    /// Stages are ordered by estimated output size, then by how soon their
    /// output is consumed, then by plan order. Estimates are recorded in
    /// `stats`; `resources` is consulted only when a ready stage needs a
    /// partition count or a broadcast decision.
    ///
    /// An empty wave means nothing is ready; after all stages completed
    /// that is the normal end of the job.
    pub fn next_wave(
        &mut self,
        stats: &mut StatisticsStore,
        resources: &dyn ResourceProvider,
        learned: Option<&dyn LearnedStatistics>,
    ) -> Result<Wave> {
        let mut ready = (0..self.units.len())
            .filter(|u| self.phase_if_ready(*u).is_some())
            .map(|u| (u, self.estimate_unit(u, stats, learned)))
            .collect::<Vec<_>>();
        if ready.is_empty() {
            return Ok(Wave {
                index: self.waves,
                ..Wave::default()
            });
        }
        ready.sort_by_key(|(u, est)| (est.bytes, self.consumer_distance(*u), *u));

        let mut wave = Wave {
            index: self.waves + 1,
            ..Wave::default()
        };
        let mut snapshot = None;
        for (u, estimate) in ready {
            let Some(phase) = self.phase_if_ready(u) else {
                continue;
            };
            let stage = match phase {
                Phase::Pipeline => self.plan_pipeline(u),
                Phase::Aggregate => self.plan_aggregation(u, resources, &mut snapshot, &mut wave)?,
                Phase::JoinBuild => {
                    self.plan_join_build(u, stats, resources, &mut snapshot, &mut wave)?
                }
                Phase::JoinProbe => self.plan_join_probe(u, &mut wave)?,
            };
            debug_assert!(stage.inputs().iter().all(|i| self.materialized.contains(i)));
            stats.record_estimate(stage.output(), estimate);
            wave.estimates.insert(stage.id(), estimate);
            self.in_flight.insert(stage.id(), u);
            wave.stages.push(stage);
        }
        self.waves += 1;
        Ok(wave)
    }

    /// Record successful completion of `stages`; their outputs become
    /// readable by later waves. Unknown or already completed ids are ignored.
    pub fn mark_completed(&mut self, stages: &[StageId]) {
        for id in stages {
            let Some(u) = self.in_flight.remove(id) else {
                continue;
            };
            self.completed.insert(*id);
            let unit = &mut self.units[u];
            let state = std::mem::replace(&mut unit.state, UnitState::Pending);
            unit.state = match state {
                UnitState::Building(build) => {
                    self.materialized.insert(build.hash_table.clone());
                    UnitState::Built(build)
                }
                UnitState::Running(_) => {
                    self.materialized.insert(unit.output.clone());
                    UnitState::Completed
                }
                other => other,
            };
        }
    }

    /// Intermediate sets whose consumers have all completed.
    ///
    /// Empty unless `remove_intermediate_data_early` is set. Each set is
    /// returned at most once.
    pub fn releasable_sets(&mut self) -> Vec<SetIdentifier> {
        if !self.config.remove_intermediate_data_early {
            return Vec::new();
        }
        let mut out = Vec::new();
        for set in self.remaining_intermediates() {
            let consumed = self
                .units
                .iter()
                .filter(|u| u.inputs.contains(&set) || u.hash_table.as_ref() == Some(&set))
                .all(|u| matches!(u.state, UnitState::Completed));
            if consumed {
                self.released.insert(set.clone());
                out.push(set);
            }
        }
        out
    }

    /// Take back sets handed out by [`PlanAnalyzer::releasable_sets`] that
    /// could not be deleted; they are offered again and stay in
    /// [`PlanAnalyzer::remaining_intermediates`].
    pub fn restore_released(&mut self, sets: &[SetIdentifier]) {
        for set in sets {
            self.released.remove(set);
        }
    }

    /// Drop partition mappings whose last user completed; returns the ids of
    /// the stages that created them.
    pub fn release_shuffles(&mut self) -> Vec<StageId> {
        let done = self
            .shuffles
            .iter()
            .filter(|(_, s)| s.release_on.is_some_and(|id| self.completed.contains(&id)))
            .map(|(id, _)| *id)
            .collect::<Vec<_>>();
        for id in &done {
            self.shuffles.remove(id);
        }
        done
    }

    pub fn live_shuffles(&self) -> usize {
        self.shuffles.len()
    }

    pub fn is_complete(&self) -> bool {
        self.units
            .iter()
            .all(|u| matches!(u.state, UnitState::Completed))
    }

    /// Sets surviving the job, in plan order.
    pub fn outputs(&self) -> Vec<SetIdentifier> {
        self.units
            .iter()
            .filter(|u| u.is_output)
            .map(|u| u.output.clone())
            .collect()
    }

    /// Materialized job-scoped intermediates not yet handed out for deletion.
    pub fn remaining_intermediates(&self) -> Vec<SetIdentifier> {
        let mut out = Vec::new();
        for unit in &self.units {
            if let Some(ht) = &unit.hash_table {
                out.push(ht.clone());
            }
            if !unit.is_output && unit.output.is_job_scoped() {
                out.push(unit.output.clone());
            }
        }
        out.retain(|s| self.materialized.contains(s) && !self.released.contains(s));
        out
    }

    pub fn completed_stages(&self) -> Vec<StageId> {
        self.completed.iter().copied().collect()
    }

    pub fn waves_planned(&self) -> u32 {
        self.waves
    }

    pub fn job(&self) -> &JobId {
        &self.job
    }

    fn phase_if_ready(&self, u: usize) -> Option<Phase> {
        let unit = &self.units[u];
        let inputs_ready = || unit.inputs.iter().all(|i| self.materialized.contains(i));
        match (&unit.state, unit.kind) {
            (UnitState::Pending, UnitKind::Pipeline) if inputs_ready() => Some(Phase::Pipeline),
            (UnitState::Pending, UnitKind::Aggregate) if inputs_ready() => Some(Phase::Aggregate),
            (UnitState::Pending, UnitKind::Join) if inputs_ready() => Some(Phase::JoinBuild),
            (UnitState::Built(b), _) if self.materialized.contains(&b.hash_table) => {
                Some(Phase::JoinProbe)
            }
            _ => None,
        }
    }

    fn estimate_unit(
        &self,
        u: usize,
        stats: &StatisticsStore,
        learned: Option<&dyn LearnedStatistics>,
    ) -> TableStats {
        let unit = &self.units[u];
        let inputs = unit
            .inputs
            .iter()
            .map(|s| stats.estimate(s).stats())
            .collect::<Vec<_>>();
        if unit.kind == UnitKind::Join && matches!(unit.state, UnitState::Pending) {
            return inputs[build_side(&inputs)];
        }
        if let Some(figure) = learned.and_then(|l| l.get(&unit.output.logical_name())) {
            return figure;
        }
        self.cost.pipeline_output(
            unit.nodes.iter().map(|n| &self.plan.nodes[*n].op),
            &inputs,
        )
    }

    /// Fewest other unmaterialized inputs among the consumers of `u`'s output.
    fn consumer_distance(&self, u: usize) -> usize {
        let unit = &self.units[u];
        if unit.kind == UnitKind::Join && matches!(unit.state, UnitState::Pending) {
            return 0;
        }
        self.units
            .iter()
            .filter(|c| c.inputs.contains(&unit.output))
            .map(|c| {
                c.inputs
                    .iter()
                    .filter(|i| **i != unit.output && !self.materialized.contains(*i))
                    .count()
            })
            .min()
            .unwrap_or(usize::MAX)
    }

    fn plan_pipeline(&mut self, u: usize) -> AbstractJobStage {
        let id = self.sequence.next_stage_id();
        let operators = self.unit_operators(u, 0);
        let unit = &mut self.units[u];
        unit.state = UnitState::Running(id);
        AbstractJobStage::TupleSet(TupleSetStage {
            id,
            inputs: unit.inputs.clone(),
            output: unit.output.clone(),
            operators,
            probe: None,
        })
    }

    fn plan_aggregation(
        &mut self,
        u: usize,
        resources: &dyn ResourceProvider,
        snapshot: &mut Option<ResourceSnapshot>,
        wave: &mut Wave,
    ) -> Result<AbstractJobStage> {
        let Operator::Aggregate {
            group_keys,
            aggregates,
        } = self.plan.nodes[self.units[u].nodes[0]].op.clone()
        else {
            return Err(DqsError::Plan("aggregation unit without aggregate".to_string()));
        };
        let snap = refresh(snapshot, resources)?;
        let partitions = snap.partition_count(self.config.partition_to_core_ratio);
        let output = self.units[u].output.clone();
        let shuffle = ShuffleInfo::compute_mapping(&output, partitions, snap)?;
        let id = self.sequence.next_stage_id();
        debug!(
            job_id = %self.job,
            stage_id = id.0,
            partitions,
            output = %output,
            operator = "AnalyzerPlanAggregation",
            "planned partitioned aggregation"
        );
        wave.shuffles.insert(id, shuffle.clone());
        self.shuffles.insert(
            id,
            LiveShuffle {
                info: shuffle,
                release_on: Some(id),
            },
        );
        let unit = &mut self.units[u];
        unit.state = UnitState::Running(id);
        Ok(AbstractJobStage::Aggregation(AggregationStage {
            id,
            inputs: unit.inputs.clone(),
            output,
            group_keys,
            aggregates,
            partitions,
        }))
    }

    fn plan_join_build(
        &mut self,
        u: usize,
        stats: &StatisticsStore,
        resources: &dyn ResourceProvider,
        snapshot: &mut Option<ResourceSnapshot>,
        wave: &mut Wave,
    ) -> Result<AbstractJobStage> {
        let head = &self.plan.nodes[self.units[u].nodes[0]];
        let Operator::Join {
            left_keys,
            right_keys,
        } = head.op.clone()
        else {
            return Err(DqsError::Plan(format!("join unit '{}' without join", head.name)));
        };
        let hash_table = SetIdentifier::scoped(
            self.plan.database.clone(),
            format!("{}_ht", head.name),
            self.job.instance,
        );
        let inputs = self.units[u].inputs.clone();
        let sizes = inputs
            .iter()
            .map(|s| stats.estimate(s).stats())
            .collect::<Vec<_>>();
        let side = build_side(&sizes);
        let (build_input, probe_input) = (inputs[side].clone(), inputs[1 - side].clone());
        let (build_keys, probe_keys) = if side == 0 {
            (left_keys, right_keys)
        } else {
            (right_keys, left_keys)
        };

        let snap = refresh(snapshot, resources)?;
        let threshold = broadcast_threshold(&self.config, snap);
        let id = self.sequence.next_stage_id();
        let (stage, strategy) = if sizes[side].bytes < threshold {
            let stage = AbstractJobStage::BroadcastJoinBuild(BroadcastJoinBuildStage {
                id,
                inputs: vec![build_input.clone()],
                output: hash_table.clone(),
                keys: build_keys,
            });
            (stage, JoinStrategy::Broadcast)
        } else {
            let partitions = snap.partition_count(self.config.partition_to_core_ratio);
            let shuffle = ShuffleInfo::compute_mapping(&hash_table, partitions, snap)?;
            wave.shuffles.insert(id, shuffle.clone());
            self.shuffles.insert(
                id,
                LiveShuffle {
                    info: shuffle,
                    release_on: None,
                },
            );
            let stage = AbstractJobStage::HashPartitionedJoinBuild(HashPartitionedJoinBuildStage {
                id,
                inputs: vec![build_input.clone()],
                output: hash_table.clone(),
                keys: build_keys,
                partitions,
            });
            (stage, JoinStrategy::HashPartitioned)
        };
        debug!(
            job_id = %self.job,
            stage_id = id.0,
            build = %build_input,
            build_bytes = sizes[side].bytes,
            threshold,
            strategy = ?strategy,
            operator = "AnalyzerPlanJoin",
            "planned join build"
        );

        let unit = &mut self.units[u];
        unit.hash_table = Some(hash_table.clone());
        unit.state = UnitState::Building(JoinBuild {
            stage: id,
            hash_table,
            probe_input,
            strategy,
            probe_keys,
        });
        Ok(stage)
    }

    fn plan_join_probe(&mut self, u: usize, wave: &mut Wave) -> Result<AbstractJobStage> {
        let UnitState::Built(build) = self.units[u].state.clone() else {
            return Err(DqsError::Plan("join probe planned before its build".to_string()));
        };
        let id = self.sequence.next_stage_id();
        if let Some(live) = self.shuffles.get_mut(&build.stage) {
            live.release_on = Some(id);
            wave.shuffles.insert(id, live.info.clone());
        }
        let operators = self.unit_operators(u, 1);
        let unit = &mut self.units[u];
        unit.state = UnitState::Running(id);
        Ok(AbstractJobStage::TupleSet(TupleSetStage {
            id,
            inputs: vec![build.probe_input, build.hash_table.clone()],
            output: unit.output.clone(),
            operators,
            probe: Some(JoinProbe {
                hash_table: build.hash_table,
                strategy: build.strategy,
                keys: build.probe_keys,
                build_stage: build.stage,
            }),
        }))
    }

    fn unit_operators(&self, u: usize, skip: usize) -> Vec<PipelineOp> {
        self.units[u]
            .nodes
            .iter()
            .skip(skip)
            .filter_map(|n| PipelineOp::from_operator(&self.plan.nodes[*n].op))
            .collect()
    }
}

/// Index of the smaller input; the left side wins ties.
fn build_side(sizes: &[TableStats]) -> usize {
    match sizes {
        [left, right] if right.bytes < left.bytes => 1,
        _ => 0,
    }
}

fn refresh<'a>(
    cache: &'a mut Option<ResourceSnapshot>,
    resources: &dyn ResourceProvider,
) -> Result<&'a ResourceSnapshot> {
    if cache.is_none() {
        let snap = resources.snapshot()?;
        snap.require_live()?;
        *cache = Some(snap);
    }
    cache
        .as_ref()
        .ok_or_else(|| DqsError::Resource("resource snapshot unavailable".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logical_plan::PlanNode;
    use crate::stage::StageKind;
    use dqs_storage::{NodeResource, StaticResources};

    const MB: u64 = 1024 * 1024;

    fn job() -> JobId {
        JobId {
            name: "Job-test_1".to_string(),
            instance: 1,
        }
    }

    fn cluster() -> StaticResources {
        StaticResources::new(vec![
            NodeResource::new("w1", 4, 1 << 34),
            NodeResource::new("w2", 4, 1 << 34),
        ])
    }

    fn analyzer(plan: &LogicalPlan, config: &SchedulerConfig) -> PlanAnalyzer {
        PlanAnalyzer::new(plan, &job(), config, Arc::new(SequenceGenerator::new())).expect("plan")
    }

    fn complete(a: &mut PlanAnalyzer, wave: &Wave) {
        let ids = wave.stages.iter().map(|s| s.id()).collect::<Vec<_>>();
        a.mark_completed(&ids);
    }

    #[test]
    fn row_operators_fuse_into_one_stage() {
        let plan = LogicalPlan::new("db")
            .with_source("s", SetIdentifier::new("d", "s"))
            .with_node(PlanNode::filter("f", "s", "a > 1"))
            .with_node(PlanNode::project("p", "f", &["a"]))
            .with_node(PlanNode::apply("m", "p", "udf"));
        let mut a = analyzer(&plan, &SchedulerConfig::default());
        let mut stats = StatisticsStore::default();
        let wave = a.next_wave(&mut stats, &cluster(), None).expect("wave");
        assert_eq!(wave.len(), 1);
        let AbstractJobStage::TupleSet(stage) = &wave.stages[0] else {
            panic!("expected tuple set stage");
        };
        assert_eq!(stage.operators.len(), 3);
        assert_eq!(stage.output, SetIdentifier::scoped("db", "m", 1));
        complete(&mut a, &wave);
        assert!(a.is_complete());
        assert_eq!(a.outputs(), vec![SetIdentifier::scoped("db", "m", 1)]);
        assert!(a.remaining_intermediates().is_empty());
    }

    #[test]
    fn shared_intermediate_is_materialized_once() {
        let plan = LogicalPlan::new("db")
            .with_source("s", SetIdentifier::new("d", "s"))
            .with_node(PlanNode::filter("f", "s", "a > 1"))
            .with_node(PlanNode::project("p1", "f", &["a"]))
            .with_node(PlanNode::project("p2", "f", &["b"]));
        let mut a = analyzer(&plan, &SchedulerConfig::default());
        let mut stats = StatisticsStore::default();
        let w1 = a.next_wave(&mut stats, &cluster(), None).expect("w1");
        assert_eq!(w1.len(), 1);
        complete(&mut a, &w1);
        let w2 = a.next_wave(&mut stats, &cluster(), None).expect("w2");
        assert_eq!(w2.len(), 2);
        assert!(w2
            .stages
            .iter()
            .all(|s| s.inputs() == [SetIdentifier::scoped("db", "f", 1)]));
    }

    #[test]
    fn partitioned_join_releases_shuffle_after_probe() {
        let plan = LogicalPlan::new("db")
            .with_source("l", SetIdentifier::new("d", "l"))
            .with_source("r", SetIdentifier::new("d", "r"))
            .with_node(PlanNode::join("j", "l", "r", &["lk"], &["rk"]));
        let mut stats = StatisticsStore::default();
        stats.record_estimate(&SetIdentifier::new("d", "l"), TableStats::new(1, 900 * MB));
        stats.record_estimate(&SetIdentifier::new("d", "r"), TableStats::new(1, 800 * MB));
        let mut a = analyzer(&plan, &SchedulerConfig::default());

        let build = a.next_wave(&mut stats, &cluster(), None).expect("build");
        assert_eq!(build.stages[0].kind(), StageKind::HashPartitionedJoinBuild);
        assert_eq!(build.stages[0].inputs(), [SetIdentifier::new("d", "r")]);
        assert_eq!(build.stages[0].partitions(), Some(6));
        let build_id = build.stages[0].id();
        complete(&mut a, &build);
        assert!(a.release_shuffles().is_empty());

        let probe = a.next_wave(&mut stats, &cluster(), None).expect("probe");
        let AbstractJobStage::TupleSet(stage) = &probe.stages[0] else {
            panic!("expected probe pipeline");
        };
        let join_probe = stage.probe.as_ref().expect("probe");
        assert_eq!(join_probe.keys, vec!["lk".to_string()]);
        assert_eq!(join_probe.build_stage, build_id);
        assert!(probe.shuffle_for(stage.id).is_some());
        complete(&mut a, &probe);
        assert_eq!(a.release_shuffles(), vec![build_id]);
        assert_eq!(a.live_shuffles(), 0);
        assert!(a.is_complete());
    }

    #[test]
    fn early_release_waits_for_every_consumer() {
        let plan = LogicalPlan::new("db")
            .with_source("s", SetIdentifier::new("d", "s"))
            .with_node(PlanNode::aggregate("g", "s", &["k"], &["sum(v)"]))
            .with_node(PlanNode::project("p1", "g", &["k"]))
            .with_node(PlanNode::join("j", "p1", "g", &["k"], &["k"]));
        let config = SchedulerConfig {
            remove_intermediate_data_early: true,
            ..SchedulerConfig::default()
        };
        let mut a = analyzer(&plan, &config);
        let mut stats = StatisticsStore::default();
        let g = SetIdentifier::scoped("db", "g", 1);

        let w1 = a.next_wave(&mut stats, &cluster(), None).expect("w1");
        complete(&mut a, &w1);
        let w2 = a.next_wave(&mut stats, &cluster(), None).expect("w2");
        complete(&mut a, &w2);
        assert!(a.releasable_sets().is_empty());
        let w3 = a.next_wave(&mut stats, &cluster(), None).expect("w3");
        complete(&mut a, &w3);
        let w4 = a.next_wave(&mut stats, &cluster(), None).expect("w4");
        complete(&mut a, &w4);
        assert!(a.is_complete());

        let released = a.releasable_sets();
        assert!(released.contains(&g));
        assert!(released.contains(&SetIdentifier::scoped("db", "p1", 1)));
        assert!(released.contains(&SetIdentifier::scoped("db", "j_ht", 1)));
        assert!(a.releasable_sets().is_empty());
        assert!(a.remaining_intermediates().is_empty());
    }

    #[test]
    fn undeleted_sets_return_to_tracking() {
        let plan = LogicalPlan::new("db")
            .with_source("s", SetIdentifier::new("d", "s"))
            .with_node(PlanNode::filter("f", "s", "x > 1"))
            .with_node(PlanNode::aggregate("g", "f", &["k"], &["count(*)"]));
        let config = SchedulerConfig {
            remove_intermediate_data_early: true,
            ..SchedulerConfig::default()
        };
        let mut a = analyzer(&plan, &config);
        let mut stats = StatisticsStore::default();
        let f = SetIdentifier::scoped("db", "f", 1);

        let w1 = a.next_wave(&mut stats, &cluster(), None).expect("w1");
        complete(&mut a, &w1);
        let w2 = a.next_wave(&mut stats, &cluster(), None).expect("w2");
        complete(&mut a, &w2);

        assert_eq!(a.releasable_sets(), vec![f.clone()]);
        assert!(a.remaining_intermediates().is_empty());
        a.restore_released(&[f.clone()]);
        assert_eq!(a.remaining_intermediates(), vec![f.clone()]);
        assert_eq!(a.releasable_sets(), vec![f]);
    }

    #[test]
    fn empty_cluster_is_a_resource_error_for_partitioned_stages() {
        let plan = LogicalPlan::new("db")
            .with_source("s", SetIdentifier::new("d", "s"))
            .with_node(PlanNode::aggregate("g", "s", &["k"], &["count(*)"]));
        let mut a = analyzer(&plan, &SchedulerConfig::default());
        let err = a
            .next_wave(&mut StatisticsStore::default(), &StaticResources::default(), None)
            .expect_err("no workers");
        assert_eq!(err.kind(), "resource");
    }
}
