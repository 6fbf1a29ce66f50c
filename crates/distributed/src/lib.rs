//! Master-side scheduling runtime: wave dispatch to workers and the job
//! orchestration loop.

pub mod dispatcher;
pub mod scheduler;
pub mod worker;

pub use dispatcher::{StageDispatcher, StageOutcome, WaveFailure, WaveResult};
pub use scheduler::{JobReport, JobState, JobStatus, Scheduler, SchedulerSession, StageTrace};
pub use worker::{
    InProcessCluster, NodeFault, StageAck, StageCall, StageDescriptor, WorkerClient,
    WorkerConnector,
};
