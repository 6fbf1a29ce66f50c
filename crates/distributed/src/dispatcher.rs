//! Wave fan-out to worker nodes.
//!
//! A wave is sent to every participating worker concurrently, one task per
//! worker; within a worker the wave's stages run strictly in wave order. The
//! dispatcher joins every task before returning, so callers observe a
//! barrier per wave.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dqs_common::metrics::global_metrics;
use dqs_common::{DqsError, JobId, NodeAddress, SetIdentifier, StageId};
use dqs_planner::{StageKind, Wave};
use dqs_storage::{ResourceSnapshot, TableStats};
use futures::future::join_all;
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::worker::{StageDescriptor, WorkerClient, WorkerConnector};

/// Aggregated acknowledgment of one stage across its workers.
#[derive(Debug, Clone, PartialEq)]
pub struct StageOutcome {
    pub stage_id: StageId,
    pub kind: StageKind,
    pub output: SetIdentifier,
    pub rows: u64,
    pub bytes: u64,
    /// Wave start until the slowest worker acknowledged.
    pub elapsed: Duration,
    pub workers: usize,
}

/// Successful wave, outcomes in wave order.
#[derive(Debug, Clone)]
pub struct WaveResult {
    pub wave: u32,
    pub outcomes: Vec<StageOutcome>,
}

/// Failed wave. Nothing from it may be committed.
#[derive(Debug)]
pub struct WaveFailure {
    /// Earliest observed error.
    pub first: DqsError,
    /// Every worker that failed, in address order.
    pub failed_workers: Vec<String>,
}

impl From<WaveFailure> for DqsError {
    fn from(f: WaveFailure) -> Self {
        f.first
    }
}

struct WorkerReport {
    node: NodeAddress,
    acks: Vec<(StageId, TableStats, Duration)>,
    failure: Option<(Duration, DqsError)>,
}

/// Sends waves to workers over connections held for the lifetime of one job.
pub struct StageDispatcher {
    connector: Arc<dyn WorkerConnector>,
    connections: HashMap<NodeAddress, Arc<dyn WorkerClient>>,
    call_timeout: Duration,
}

impl std::fmt::Debug for StageDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageDispatcher")
            .field("connections", &self.connections.len())
            .field("call_timeout", &self.call_timeout)
            .finish()
    }
}

impl StageDispatcher {
    pub fn new(connector: Arc<dyn WorkerConnector>, call_timeout: Duration) -> Self {
        Self {
            connector,
            connections: HashMap::new(),
            call_timeout,
        }
    }

    /// Number of open worker connections.
    pub fn connections(&self) -> usize {
        self.connections.len()
    }

    /// Run every stage of `wave` on its target workers and wait for all of
    /// them.
    ///
    /// Partitioned join builds go to the owners of their partitions; every
    /// other stage goes to all nodes of `snapshot`. The wave succeeds only if
    /// every targeted worker acknowledged every stage.
    pub async fn dispatch_wave(
        &mut self,
        job: &JobId,
        wave: &Wave,
        snapshot: &ResourceSnapshot,
    ) -> std::result::Result<WaveResult, WaveFailure> {
        snapshot.require_live().map_err(|first| WaveFailure {
            first,
            failed_workers: Vec::new(),
        })?;

        let mut per_node: BTreeMap<NodeAddress, Vec<StageDescriptor>> = BTreeMap::new();
        for stage in &wave.stages {
            let shuffle = wave.shuffle_for(stage.id()).cloned();
            let targets = match (stage.kind(), &shuffle) {
                (StageKind::HashPartitionedJoinBuild, Some(s)) => s.participants(),
                _ => snapshot.addresses(),
            };
            let descriptor = StageDescriptor {
                job_id: job.name.clone(),
                job_instance: job.instance,
                wave: wave.index,
                stage: stage.clone(),
                shuffle,
            };
            for node in targets {
                per_node.entry(node).or_default().push(descriptor.clone());
            }
        }
        info!(
            job_id = %job,
            wave = wave.index,
            stages = wave.len(),
            workers = per_node.len(),
            operator = "DispatcherWave",
            "dispatching wave"
        );

        let nodes = per_node.keys().cloned().collect::<Vec<_>>();
        self.ensure_connected(&nodes).await?;

        let started = Instant::now();
        let mut handles = Vec::with_capacity(per_node.len());
        for (node, descriptors) in per_node {
            let Some(client) = self.connections.get(&node).cloned() else {
                continue;
            };
            let call_timeout = self.call_timeout;
            handles.push((
                node.clone(),
                tokio::spawn(run_worker(node, client, descriptors, call_timeout, started)),
            ));
        }

        let mut reports = Vec::with_capacity(handles.len());
        for (node, handle) in handles {
            match handle.await {
                Ok(report) => reports.push(report),
                Err(e) => reports.push(WorkerReport {
                    failure: Some((
                        started.elapsed(),
                        DqsError::Dispatch {
                            worker: node.to_string(),
                            message: format!("dispatch task join error: {e}"),
                        },
                    )),
                    node,
                    acks: Vec::new(),
                }),
            }
        }

        let mut failures = reports
            .iter_mut()
            .filter_map(|r| r.failure.take().map(|(at, e)| (at, r.node.clone(), e)))
            .collect::<Vec<_>>();
        if !failures.is_empty() {
            let metrics = global_metrics();
            for (_, node, e) in &failures {
                metrics.inc_dispatch_failures(node.as_str(), e.kind());
            }
            let failed_workers = failures
                .iter()
                .map(|(_, n, _)| n.to_string())
                .collect::<Vec<_>>();
            failures.sort_by_key(|(at, _, _)| *at);
            let (_, _, first) = failures.remove(0);
            error!(
                job_id = %job,
                wave = wave.index,
                failed_workers = ?failed_workers,
                error = %first,
                operator = "DispatcherWave",
                "wave failed"
            );
            return Err(WaveFailure {
                first,
                failed_workers,
            });
        }

        let outcomes = aggregate(wave, &reports);
        let metrics = global_metrics();
        for o in &outcomes {
            metrics.record_stage(&job.name, o.kind.as_str(), o.elapsed.as_secs_f64());
        }
        info!(
            job_id = %job,
            wave = wave.index,
            elapsed_ms = started.elapsed().as_millis() as u64,
            operator = "DispatcherWave",
            "wave acknowledged by all workers"
        );
        Ok(WaveResult {
            wave: wave.index,
            outcomes,
        })
    }

    /// Best-effort removal of `sets` from every node of `snapshot`.
    ///
    /// Returns the sets that could not be removed from at least one node.
    pub async fn delete_sets(
        &mut self,
        sets: &[SetIdentifier],
        snapshot: &ResourceSnapshot,
    ) -> Vec<SetIdentifier> {
        if sets.is_empty() {
            return Vec::new();
        }
        let nodes = snapshot.addresses();
        if self.ensure_connected(&nodes).await.is_err() {
            return sets.to_vec();
        }
        let call_timeout = self.call_timeout;
        let calls = nodes.iter().filter_map(|n| self.connections.get(n)).flat_map(|client| {
            sets.iter().map(move |set| async move {
                let outcome = timeout(call_timeout, client.delete_set(set)).await;
                (set, outcome)
            })
        });
        let mut failed = Vec::new();
        for (set, outcome) in join_all(calls).await {
            let reason = match outcome {
                Ok(Ok(_)) => continue,
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!("timed out after {}ms", call_timeout.as_millis()),
            };
            warn!(
                set = %set,
                error = %reason,
                operator = "DispatcherDeleteSet",
                "failed to delete intermediate set"
            );
            if !failed.contains(set) {
                failed.push(set.clone());
            }
        }
        failed
    }

    async fn ensure_connected(
        &mut self,
        nodes: &[NodeAddress],
    ) -> std::result::Result<(), WaveFailure> {
        let missing = nodes
            .iter()
            .filter(|n| !self.connections.contains_key(*n))
            .cloned()
            .collect::<Vec<_>>();
        if missing.is_empty() {
            return Ok(());
        }
        let call_timeout = self.call_timeout;
        let attempts = join_all(missing.into_iter().map(|node| {
            let connector = Arc::clone(&self.connector);
            async move {
                let outcome = timeout(call_timeout, connector.connect(&node)).await;
                (node, outcome)
            }
        }))
        .await;

        let mut failed_workers = Vec::new();
        let mut first = None;
        for (node, outcome) in attempts {
            let err = match outcome {
                Ok(Ok(client)) => {
                    self.connections.insert(node, client);
                    continue;
                }
                Ok(Err(e)) => e,
                Err(_) => DqsError::Dispatch {
                    worker: node.to_string(),
                    message: format!("connect timed out after {}ms", call_timeout.as_millis()),
                },
            };
            global_metrics().inc_dispatch_failures(node.as_str(), err.kind());
            failed_workers.push(node.to_string());
            first.get_or_insert(err);
        }
        match first {
            None => Ok(()),
            Some(first) => Err(WaveFailure {
                first,
                failed_workers,
            }),
        }
    }
}

async fn run_worker(
    node: NodeAddress,
    client: Arc<dyn WorkerClient>,
    descriptors: Vec<StageDescriptor>,
    call_timeout: Duration,
    started: Instant,
) -> WorkerReport {
    let mut report = WorkerReport {
        node: node.clone(),
        acks: Vec::with_capacity(descriptors.len()),
        failure: None,
    };
    for d in &descriptors {
        let stage_id = d.stage.id();
        let err = match timeout(call_timeout, client.run_stage(d)).await {
            Ok(Ok(ack)) if ack.success => {
                report.acks.push((
                    stage_id,
                    TableStats::new(ack.actual_row_count, ack.actual_byte_size),
                    started.elapsed(),
                ));
                continue;
            }
            Ok(Ok(ack)) => DqsError::WorkerExecution {
                worker: node.to_string(),
                stage_id: stage_id.0,
                message: ack
                    .error_detail
                    .unwrap_or_else(|| "stage reported failure".to_string()),
            },
            Ok(Err(e)) => e,
            Err(_) => DqsError::Dispatch {
                worker: node.to_string(),
                message: format!(
                    "stage {stage_id} timed out after {}ms",
                    call_timeout.as_millis()
                ),
            },
        };
        report.failure = Some((started.elapsed(), err));
        break;
    }
    report
}

/// One statistics figure per stage output: worker contributions are summed,
/// except broadcast builds whose table is replicated on every worker.
fn aggregate(wave: &Wave, reports: &[WorkerReport]) -> Vec<StageOutcome> {
    wave.stages
        .iter()
        .map(|stage| {
            let id = stage.id();
            let acks = reports
                .iter()
                .flat_map(|r| r.acks.iter().filter(move |a| a.0 == id))
                .collect::<Vec<_>>();
            let stats = if stage.kind() == StageKind::BroadcastJoinBuild {
                TableStats::new(
                    acks.iter().map(|a| a.1.rows).max().unwrap_or(0),
                    acks.iter().map(|a| a.1.bytes).max().unwrap_or(0),
                )
            } else {
                acks.iter()
                    .fold(TableStats::default(), |total, a| total.merge(a.1))
            };
            StageOutcome {
                stage_id: id,
                kind: stage.kind(),
                output: stage.output().clone(),
                rows: stats.rows,
                bytes: stats.bytes,
                elapsed: acks.iter().map(|a| a.2).max().unwrap_or_default(),
                workers: acks.len(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::{InProcessCluster, NodeFault};
    use dqs_planner::{AbstractJobStage, BroadcastJoinBuildStage, TupleSetStage};
    use dqs_storage::NodeResource;

    fn job() -> JobId {
        JobId {
            name: "Job-t_1".to_string(),
            instance: 1,
        }
    }

    fn snapshot() -> ResourceSnapshot {
        ResourceSnapshot::new(vec![
            NodeResource::new("w1", 2, 1 << 30),
            NodeResource::new("w2", 2, 1 << 30),
        ])
    }

    fn wave() -> Wave {
        Wave {
            index: 1,
            stages: vec![
                AbstractJobStage::BroadcastJoinBuild(BroadcastJoinBuildStage {
                    id: StageId(1),
                    inputs: vec![SetIdentifier::new("d", "small")],
                    output: SetIdentifier::scoped("db", "j_ht", 1),
                    keys: vec!["k".to_string()],
                }),
                AbstractJobStage::TupleSet(TupleSetStage {
                    id: StageId(2),
                    inputs: vec![SetIdentifier::new("d", "s")],
                    output: SetIdentifier::scoped("db", "f", 1),
                    operators: vec![],
                    probe: None,
                }),
            ],
            ..Wave::default()
        }
    }

    #[tokio::test]
    async fn sums_partials_and_keeps_broadcast_max() {
        let cluster = InProcessCluster::new().with_stats_rule(|node, _| {
            if node.as_str() == "w1" {
                (10, 100)
            } else {
                (30, 300)
            }
        });
        let mut d = StageDispatcher::new(Arc::new(cluster.clone()), Duration::from_secs(1));
        let result = d
            .dispatch_wave(&job(), &wave(), &snapshot())
            .await
            .expect("wave");
        assert_eq!((result.outcomes[0].rows, result.outcomes[0].bytes), (30, 300));
        assert_eq!((result.outcomes[1].rows, result.outcomes[1].bytes), (40, 400));
        assert_eq!(result.outcomes[1].workers, 2);

        // stage order is preserved per worker
        let w1 = cluster
            .calls()
            .into_iter()
            .filter(|c| c.node.as_str() == "w1")
            .map(|c| c.descriptor.stage.id())
            .collect::<Vec<_>>();
        assert_eq!(w1, vec![StageId(1), StageId(2)]);
    }

    #[tokio::test]
    async fn connections_are_reused_across_waves() {
        let cluster = InProcessCluster::new();
        let mut d = StageDispatcher::new(Arc::new(cluster.clone()), Duration::from_secs(1));
        d.dispatch_wave(&job(), &wave(), &snapshot()).await.expect("w1");
        d.dispatch_wave(&job(), &wave(), &snapshot()).await.expect("w2");
        assert_eq!(cluster.connects().len(), 2);
        assert_eq!(d.connections(), 2);
    }

    #[tokio::test]
    async fn one_failing_worker_fails_the_wave() {
        let cluster = InProcessCluster::new().with_fault("w2", NodeFault::FailStage(StageId(1)));
        let mut d = StageDispatcher::new(Arc::new(cluster.clone()), Duration::from_secs(1));
        let failure = d
            .dispatch_wave(&job(), &wave(), &snapshot())
            .await
            .expect_err("wave fails");
        assert_eq!(failure.failed_workers, vec!["w2".to_string()]);
        assert_eq!(failure.first.kind(), "worker_execution");
        assert_eq!(failure.first.worker(), Some("w2"));
        // w2 stops after its first failure
        let w2_calls = cluster
            .calls()
            .iter()
            .filter(|c| c.node.as_str() == "w2")
            .count();
        assert_eq!(w2_calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_worker_times_out() {
        let cluster = InProcessCluster::new().with_fault("w1", NodeFault::Hang);
        let mut d = StageDispatcher::new(Arc::new(cluster), Duration::from_millis(500));
        let failure = d
            .dispatch_wave(&job(), &wave(), &snapshot())
            .await
            .expect_err("timeout");
        assert_eq!(failure.first.kind(), "dispatch");
        assert!(failure.first.to_string().contains("timed out"));
        assert_eq!(failure.failed_workers, vec!["w1".to_string()]);
    }

    #[tokio::test]
    async fn empty_cluster_fails_before_dispatch() {
        let cluster = InProcessCluster::new();
        let mut d = StageDispatcher::new(Arc::new(cluster.clone()), Duration::from_secs(1));
        let failure = d
            .dispatch_wave(&job(), &wave(), &ResourceSnapshot::default())
            .await
            .expect_err("no workers");
        assert_eq!(failure.first.kind(), "resource");
        assert!(cluster.calls().is_empty());
    }

    #[tokio::test]
    async fn deletes_reach_every_node() {
        let cluster = InProcessCluster::new();
        let mut d = StageDispatcher::new(Arc::new(cluster.clone()), Duration::from_secs(1));
        let sets = vec![SetIdentifier::scoped("db", "f", 1)];
        assert!(d.delete_sets(&sets, &snapshot()).await.is_empty());
        assert_eq!(cluster.deleted_sets().len(), 2);
    }
}
