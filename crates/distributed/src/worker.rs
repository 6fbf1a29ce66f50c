//! Worker-node contract used by the dispatcher.
//!
//! Responsibilities:
//! - define the stage descriptor/acknowledgment payloads exchanged with a
//!   worker (`runStage`, `deleteSet`);
//! - abstract connection establishment behind [`WorkerConnector`] so the
//!   transport stays outside the scheduler;
//! - provide [`InProcessCluster`], a scripted in-memory cluster used by tests
//!   and the `dqs-simulate` dry run.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use dqs_common::{DqsError, NodeAddress, Result, SetIdentifier, StageId};
use dqs_planner::AbstractJobStage;
use dqs_shuffle::ShuffleInfo;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Everything a worker needs to run one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDescriptor {
    /// Human-readable job id (`Job-...`).
    pub job_id: String,
    /// Job-instance id namespacing the job's intermediate sets.
    pub job_instance: u64,
    /// Wave the stage belongs to.
    pub wave: u32,
    pub stage: AbstractJobStage,
    /// Partition mapping shared by every participant, for stages that
    /// redistribute data.
    #[serde(default)]
    pub shuffle: Option<ShuffleInfo>,
}

impl StageDescriptor {
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| DqsError::Plan(format!("stage descriptor encode failed: {e}")))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| DqsError::Plan(format!("stage descriptor decode failed: {e}")))
    }
}

/// Worker reply to `run_stage`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageAck {
    pub success: bool,
    /// Rows this worker contributed to the stage output.
    pub actual_row_count: u64,
    /// Bytes this worker contributed to the stage output.
    pub actual_byte_size: u64,
    #[serde(default)]
    pub error_detail: Option<String>,
}

impl StageAck {
    pub fn ok(rows: u64, bytes: u64) -> Self {
        Self {
            success: true,
            actual_row_count: rows,
            actual_byte_size: bytes,
            error_detail: None,
        }
    }

    pub fn failed(detail: impl Into<String>) -> Self {
        Self {
            success: false,
            actual_row_count: 0,
            actual_byte_size: 0,
            error_detail: Some(detail.into()),
        }
    }
}

#[async_trait]
/// One logical connection to a worker node.
pub trait WorkerClient: Send + Sync {
    /// Run a stage and report this worker's contribution.
    ///
    /// `Err` means the call itself failed (transport); operator failures come
    /// back as an unsuccessful [`StageAck`].
    async fn run_stage(&self, descriptor: &StageDescriptor) -> Result<StageAck>;
    /// Remove this worker's part of `set`; `Ok(false)` when nothing was deleted.
    async fn delete_set(&self, set: &SetIdentifier) -> Result<bool>;
}

#[async_trait]
/// Opens [`WorkerClient`] connections.
pub trait WorkerConnector: Send + Sync {
    async fn connect(&self, node: &NodeAddress) -> Result<Arc<dyn WorkerClient>>;
}

/// Scripted misbehavior of one simulated node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeFault {
    /// `connect` fails.
    RefuseConnect,
    /// Every `run_stage` call returns a transport error.
    Unreachable,
    /// Every `run_stage` call never returns.
    Hang,
    /// `run_stage` never returns for stages of this wave.
    HangAtWave(u32),
    /// The worker reports an operator failure for stages of this wave.
    FailAtWave(u32),
    /// The worker reports an operator failure for this stage.
    FailStage(StageId),
    /// `delete_set` calls fail; stages still run.
    RejectDelete,
}

/// Per-worker statistics reported by the simulated cluster.
pub type StatsRule = Arc<dyn Fn(&NodeAddress, &StageDescriptor) -> (u64, u64) + Send + Sync>;

/// One `run_stage` call observed by the simulated cluster.
#[derive(Debug, Clone)]
pub struct StageCall {
    pub node: NodeAddress,
    pub descriptor: StageDescriptor,
}

#[derive(Default)]
struct ClusterState {
    faults: HashMap<NodeAddress, Vec<NodeFault>>,
    rule: Option<StatsRule>,
    calls: Vec<StageCall>,
    deleted: Vec<(NodeAddress, SetIdentifier)>,
    connects: Vec<NodeAddress>,
}

/// In-memory cluster of simulated workers.
///
/// Every node succeeds unless a [`NodeFault`] is scripted for it. Cloning
/// shares the same state, so a test can keep a handle for assertions while
/// the scheduler owns the connector.
#[derive(Clone, Default)]
pub struct InProcessCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl fmt::Debug for InProcessCluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("InProcessCluster")
            .field("faults", &state.faults)
            .field("calls", &state.calls.len())
            .finish()
    }
}

impl InProcessCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fault(self, node: &str, fault: NodeFault) -> Self {
        self.lock()
            .faults
            .entry(NodeAddress::new(node))
            .or_default()
            .push(fault);
        self
    }

    /// Statistics every worker reports for a stage; defaults to 1000 rows of
    /// 64 bytes per worker.
    pub fn with_stats_rule(
        self,
        rule: impl Fn(&NodeAddress, &StageDescriptor) -> (u64, u64) + Send + Sync + 'static,
    ) -> Self {
        self.lock().rule = Some(Arc::new(rule));
        self
    }

    pub fn calls(&self) -> Vec<StageCall> {
        self.lock().calls.clone()
    }

    pub fn deleted_sets(&self) -> Vec<(NodeAddress, SetIdentifier)> {
        self.lock().deleted.clone()
    }

    /// Nodes in the order connections were opened.
    pub fn connects(&self) -> Vec<NodeAddress> {
        self.lock().connects.clone()
    }

    fn lock(&self) -> MutexGuard<'_, ClusterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl WorkerConnector for InProcessCluster {
    async fn connect(&self, node: &NodeAddress) -> Result<Arc<dyn WorkerClient>> {
        let mut state = self.lock();
        if state
            .faults
            .get(node)
            .is_some_and(|f| f.contains(&NodeFault::RefuseConnect))
        {
            return Err(DqsError::Dispatch {
                worker: node.to_string(),
                message: "connection refused".to_string(),
            });
        }
        state.connects.push(node.clone());
        Ok(Arc::new(InProcessWorker {
            node: node.clone(),
            state: Arc::clone(&self.state),
        }))
    }
}

struct InProcessWorker {
    node: NodeAddress,
    state: Arc<Mutex<ClusterState>>,
}

enum Scripted {
    Reply(StageAck),
    Unreachable,
    Hang,
}

impl InProcessWorker {
    fn script(&self, descriptor: &StageDescriptor) -> Scripted {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.calls.push(StageCall {
            node: self.node.clone(),
            descriptor: descriptor.clone(),
        });
        let stage_id = descriptor.stage.id();
        for fault in state.faults.get(&self.node).into_iter().flatten() {
            match fault {
                NodeFault::Unreachable => return Scripted::Unreachable,
                NodeFault::Hang => return Scripted::Hang,
                NodeFault::HangAtWave(w) if *w == descriptor.wave => return Scripted::Hang,
                NodeFault::FailAtWave(w) if *w == descriptor.wave => {
                    return Scripted::Reply(StageAck::failed(format!(
                        "injected failure in wave {w}"
                    )))
                }
                NodeFault::FailStage(id) if *id == stage_id => {
                    return Scripted::Reply(StageAck::failed(format!(
                        "injected failure in stage {id}"
                    )))
                }
                _ => {}
            }
        }
        let (rows, bytes) = match &state.rule {
            Some(rule) => rule(&self.node, descriptor),
            None => (1_000, 64_000),
        };
        Scripted::Reply(StageAck::ok(rows, bytes))
    }
}

#[async_trait]
impl WorkerClient for InProcessWorker {
    async fn run_stage(&self, descriptor: &StageDescriptor) -> Result<StageAck> {
        debug!(
            worker = %self.node,
            job_id = %descriptor.job_id,
            stage_id = descriptor.stage.id().0,
            kind = %descriptor.stage.kind(),
            operator = "InProcessWorkerRunStage",
            "simulated stage received"
        );
        // simulated workers see exactly what a remote one would receive
        let received = StageDescriptor::decode(&descriptor.encode()?)?;
        match self.script(&received) {
            Scripted::Reply(ack) => Ok(ack),
            Scripted::Unreachable => Err(DqsError::Dispatch {
                worker: self.node.to_string(),
                message: "worker unreachable".to_string(),
            }),
            Scripted::Hang => {
                futures::future::pending::<()>().await;
                Err(DqsError::Dispatch {
                    worker: self.node.to_string(),
                    message: "worker hung".to_string(),
                })
            }
        }
    }

    async fn delete_set(&self, set: &SetIdentifier) -> Result<bool> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state
            .faults
            .get(&self.node)
            .is_some_and(|f| {
                f.contains(&NodeFault::Unreachable) || f.contains(&NodeFault::RejectDelete)
            })
        {
            return Err(DqsError::Dispatch {
                worker: self.node.to_string(),
                message: format!("could not delete {set}"),
            });
        }
        state.deleted.push((self.node.clone(), set.clone()));
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dqs_planner::TupleSetStage;

    fn descriptor(wave: u32) -> StageDescriptor {
        StageDescriptor {
            job_id: "Job-x_1".to_string(),
            job_instance: 1,
            wave,
            stage: AbstractJobStage::TupleSet(TupleSetStage {
                id: StageId(3),
                inputs: vec![SetIdentifier::new("d", "s")],
                output: SetIdentifier::scoped("db", "f", 1),
                operators: vec![],
                probe: None,
            }),
            shuffle: None,
        }
    }

    #[test]
    fn descriptor_survives_the_wire() {
        let d = descriptor(2);
        let back = StageDescriptor::decode(&d.encode().expect("encode")).expect("decode");
        assert_eq!(back, d);
    }

    #[tokio::test]
    async fn scripted_faults_apply_per_wave() {
        let cluster = InProcessCluster::new()
            .with_fault("w2", NodeFault::FailAtWave(2))
            .with_stats_rule(|_, _| (5, 50));
        let w1 = cluster.connect(&NodeAddress::new("w1")).await.expect("w1");
        let w2 = cluster.connect(&NodeAddress::new("w2")).await.expect("w2");

        assert_eq!(w1.run_stage(&descriptor(2)).await.expect("ack"), StageAck::ok(5, 50));
        assert_eq!(w2.run_stage(&descriptor(1)).await.expect("ack"), StageAck::ok(5, 50));
        let ack = w2.run_stage(&descriptor(2)).await.expect("ack");
        assert!(!ack.success);
        assert_eq!(cluster.calls().len(), 3);
    }

    #[tokio::test]
    async fn refused_connection_is_a_dispatch_error() {
        let cluster = InProcessCluster::new().with_fault("w1", NodeFault::RefuseConnect);
        let err = cluster
            .connect(&NodeAddress::new("w1"))
            .await
            .err()
            .expect("refused");
        assert_eq!(err.kind(), "dispatch");
        assert!(cluster.connects().is_empty());
    }
}
