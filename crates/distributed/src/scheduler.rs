//! Wave-by-wave job orchestration.
//!
//! Per job the scheduler loops `Planning -> Dispatching -> Collecting` until
//! the plan is exhausted (`Done`) or a wave fails (`Failed`):
//! - planning asks [`PlanAnalyzer`] for the stages whose inputs exist now;
//! - dispatching hands the wave to [`StageDispatcher`] and waits for every
//!   worker;
//! - collecting folds actual statistics back into the session store, marks
//!   stages completed and releases shuffles and intermediates nobody needs.
//!
//! Only one job is planned/dispatched at a time per scheduler. Failed waves
//! are never committed and never retried; intermediates of failed jobs are
//! left in place and reported as orphaned.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use dqs_common::metrics::global_metrics;
use dqs_common::{
    DqsError, JobId, Result, SchedulerConfig, SequenceGenerator, SetIdentifier, StageId,
};
use dqs_planner::{explain_wave, LogicalPlan, PlanAnalyzer, StageKind, Wave};
use dqs_storage::{
    InMemoryStatisticsCache, JsonFileStatisticsCache, LearnedStatistics, ResourceProvider,
    StatisticsProvider, StatisticsStore, TableStats,
};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::dispatcher::{StageDispatcher, WaveResult};
use crate::worker::WorkerConnector;

const STAGE_KIND_LABELS: [&str; 4] = [
    StageKind::TupleSet.as_str(),
    StageKind::Aggregation.as_str(),
    StageKind::BroadcastJoinBuild.as_str(),
    StageKind::HashPartitionedJoinBuild.as_str(),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
/// Lifecycle state of one job.
pub enum JobState {
    Planning,
    Dispatching,
    Collecting,
    Done,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Done | JobState::Failed)
    }

    fn label(&self) -> &'static str {
        match self {
            JobState::Planning => "planning",
            JobState::Dispatching => "dispatching",
            JobState::Collecting => "collecting",
            JobState::Done => "done",
            JobState::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
/// Externally visible job status (`getStageStatus`).
pub struct JobStatus {
    pub job_id: JobId,
    pub state: JobState,
    pub completed_stages: Vec<StageId>,
    pub last_error: Option<String>,
    /// Workers that failed the last wave.
    pub failed_workers: Vec<String>,
    /// Intermediates the job left in storage: everything not yet deleted
    /// when it failed, or sets whose deletion failed after `Done`. Deleting
    /// them is up to the caller.
    pub orphaned_sets: Vec<SetIdentifier>,
    /// Waves dispatched so far.
    pub waves: u32,
}

#[derive(Debug, Clone, Serialize)]
/// Execution record of one completed stage.
pub struct StageTrace {
    pub stage_id: StageId,
    pub kind: StageKind,
    pub wave: u32,
    pub elapsed_ms: u64,
    pub output: SetIdentifier,
    pub rows: u64,
    pub bytes: u64,
    pub estimated_rows: u64,
    pub estimated_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
/// Outcome of a finished job.
pub struct JobReport {
    pub job_id: JobId,
    pub outputs: Vec<SetIdentifier>,
    pub trace: Vec<StageTrace>,
    pub waves: u32,
}

/// Planning state shared by the jobs of one scheduler.
///
/// The stage-id sequence is injected so independent sessions can either
/// share one sequence or each own a private one.
#[derive(Debug)]
pub struct SchedulerSession {
    stage_sequence: Arc<SequenceGenerator>,
    job_sequence: SequenceGenerator,
    statistics: StatisticsStore,
}

impl SchedulerSession {
    pub fn new(stage_sequence: Arc<SequenceGenerator>) -> Self {
        Self {
            stage_sequence,
            job_sequence: SequenceGenerator::new(),
            statistics: StatisticsStore::default(),
        }
    }

    /// Session whose statistics fall back to the configured defaults.
    pub fn with_config(stage_sequence: Arc<SequenceGenerator>, config: &SchedulerConfig) -> Self {
        Self {
            statistics: StatisticsStore::new(TableStats::new(
                config.default_row_count,
                config.default_byte_size,
            )),
            ..Self::new(stage_sequence)
        }
    }

    /// `Job-<YYYY>_<MM>_<DD>_<hh>_<mm>_<ss>_<seq>` in UTC.
    pub fn next_job_id(&self) -> JobId {
        let instance = self.job_sequence.next_id();
        JobId {
            name: format!("Job-{}_{instance}", Utc::now().format("%Y_%m_%d_%H_%M_%S")),
            instance,
        }
    }

    pub fn statistics(&self) -> &StatisticsStore {
        &self.statistics
    }

    pub fn statistics_mut(&mut self) -> &mut StatisticsStore {
        &mut self.statistics
    }

    pub fn stage_sequence(&self) -> Arc<SequenceGenerator> {
        Arc::clone(&self.stage_sequence)
    }
}

struct JobRecord {
    status: JobStatus,
    report: Option<JobReport>,
    cancel: Arc<AtomicBool>,
}

/// Drives jobs to completion against a cluster of workers.
pub struct Scheduler {
    config: SchedulerConfig,
    session: Mutex<SchedulerSession>,
    run_lock: tokio::sync::Mutex<()>,
    jobs: Mutex<HashMap<JobId, JobRecord>>,
    resources: Arc<dyn ResourceProvider>,
    catalog: Arc<dyn StatisticsProvider>,
    connector: Arc<dyn WorkerConnector>,
    learned: Option<Arc<dyn LearnedStatistics>>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.config)
            .field("jobs", &self.lock_jobs().len())
            .field("self_learning", &self.learned.is_some())
            .finish()
    }
}

impl Scheduler {
    /// Build a scheduler; with `self_learning` enabled the statistics cache
    /// is opened from `statistics_cache_path`, or kept in memory without one.
    ///
    /// # Errors
    /// [`DqsError::InvalidConfig`] for invalid settings or an unreadable
    /// statistics cache.
    pub fn new(
        config: SchedulerConfig,
        session: SchedulerSession,
        resources: Arc<dyn ResourceProvider>,
        catalog: Arc<dyn StatisticsProvider>,
        connector: Arc<dyn WorkerConnector>,
    ) -> Result<Self> {
        config.validate()?;
        let learned: Option<Arc<dyn LearnedStatistics>> = if !config.self_learning {
            None
        } else if let Some(path) = &config.statistics_cache_path {
            Some(Arc::new(JsonFileStatisticsCache::open(path)?))
        } else {
            Some(Arc::new(InMemoryStatisticsCache::new()))
        };
        Ok(Self {
            config,
            session: Mutex::new(session),
            run_lock: tokio::sync::Mutex::new(()),
            jobs: Mutex::new(HashMap::new()),
            resources,
            catalog,
            connector,
            learned,
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Submit `plan` and run it in the background; poll with
    /// [`Scheduler::get_stage_status`].
    pub fn schedule_query(self: &Arc<Self>, plan: LogicalPlan) -> JobId {
        let (job, cancel) = self.register_job();
        let this = Arc::clone(self);
        let spawned = job.clone();
        tokio::spawn(async move {
            let _ = this.execute(&spawned, &plan, &cancel).await;
        });
        job
    }

    /// Submit `plan` and wait for it to finish.
    pub async fn run_query(&self, plan: &LogicalPlan) -> Result<JobReport> {
        let (job, cancel) = self.register_job();
        self.execute(&job, plan, &cancel).await
    }

    pub fn get_stage_status(&self, job: &JobId) -> Option<JobStatus> {
        self.lock_jobs().get(job).map(|r| r.status.clone())
    }

    /// Trace of a job that reached `Done`.
    pub fn job_report(&self, job: &JobId) -> Option<JobReport> {
        self.lock_jobs().get(job).and_then(|r| r.report.clone())
    }

    /// Ask a running job to stop before its next wave.
    ///
    /// The in-flight wave drains first; worker-side work is not interrupted.
    /// Returns `false` for unknown or already finished jobs.
    pub fn cancel_job(&self, job: &JobId) -> bool {
        let jobs = self.lock_jobs();
        match jobs.get(job) {
            Some(r) if !r.status.state.is_terminal() => {
                r.cancel.store(true, Ordering::SeqCst);
                info!(job_id = %job, operator = "SchedulerCancel", "job cancellation requested");
                true
            }
            _ => false,
        }
    }

    /// Copy of the session statistics store.
    pub fn statistics(&self) -> StatisticsStore {
        self.lock_session().statistics().clone()
    }

    fn register_job(&self) -> (JobId, Arc<AtomicBool>) {
        let job = self.lock_session().next_job_id();
        let cancel = Arc::new(AtomicBool::new(false));
        self.lock_jobs().insert(
            job.clone(),
            JobRecord {
                status: JobStatus {
                    job_id: job.clone(),
                    state: JobState::Planning,
                    completed_stages: Vec::new(),
                    last_error: None,
                    failed_workers: Vec::new(),
                    orphaned_sets: Vec::new(),
                    waves: 0,
                },
                report: None,
                cancel: Arc::clone(&cancel),
            },
        );
        (job, cancel)
    }

    async fn execute(
        &self,
        job: &JobId,
        plan: &LogicalPlan,
        cancel: &AtomicBool,
    ) -> Result<JobReport> {
        let _running = self.run_lock.lock().await;
        info!(
            job_id = %job,
            sources = plan.sources.len(),
            nodes = plan.nodes.len(),
            operator = "SchedulerRun",
            "job started"
        );
        let analyzer = match PlanAnalyzer::new(
            plan,
            job,
            &self.config,
            self.lock_session().stage_sequence(),
        ) {
            Ok(a) => a,
            Err(e) => return Err(self.fail(job, e, Vec::new(), Vec::new())),
        };
        if let Err(e) = self.seed_sources(plan) {
            return Err(self.fail(job, e, Vec::new(), Vec::new()));
        }
        self.drive(job, analyzer, cancel).await
    }

    /// Seed source statistics from storage before the first wave.
    fn seed_sources(&self, plan: &LogicalPlan) -> Result<()> {
        for src in &plan.sources {
            let Some(provided) = self.catalog.get_statistics(&src.set)? else {
                continue;
            };
            let mut session = self.lock_session();
            let store = session.statistics_mut();
            if provided.is_actual {
                store.record_actual(&src.set, provided.stats.rows, provided.stats.bytes);
            } else {
                store.record_estimate(&src.set, provided.stats);
            }
        }
        Ok(())
    }

    async fn drive(
        &self,
        job: &JobId,
        mut analyzer: PlanAnalyzer,
        cancel: &AtomicBool,
    ) -> Result<JobReport> {
        let mut dispatcher =
            StageDispatcher::new(Arc::clone(&self.connector), self.config.dispatch_timeout());
        let mut trace = Vec::new();
        let metrics = global_metrics();
        loop {
            if cancel.load(Ordering::SeqCst) {
                let err = DqsError::Canceled(format!("job {job} canceled"));
                return Err(self.fail(job, err, Vec::new(), analyzer.remaining_intermediates()));
            }
            self.update(job, |s| s.state = JobState::Planning);
            let planned = {
                let mut session = self.lock_session();
                analyzer.next_wave(
                    session.statistics_mut(),
                    self.resources.as_ref(),
                    self.learned.as_deref(),
                )
            };
            let wave = match planned {
                Ok(w) => w,
                Err(e) => {
                    return Err(self.fail(job, e, Vec::new(), analyzer.remaining_intermediates()))
                }
            };
            if wave.is_empty() {
                if analyzer.is_complete() {
                    break;
                }
                let err = DqsError::Plan("no stage is runnable but the plan is unfinished".into());
                return Err(self.fail(job, err, Vec::new(), analyzer.remaining_intermediates()));
            }
            debug!(job_id = %job, operator = "SchedulerPlan", "planned:\n{}", explain_wave(&wave));

            self.update(job, |s| {
                s.state = JobState::Dispatching;
                s.waves = wave.index;
            });
            metrics.inc_waves(&job.name);
            let snapshot = match self.resources.snapshot() {
                Ok(s) => s,
                Err(e) => {
                    return Err(self.fail(job, e, Vec::new(), analyzer.remaining_intermediates()))
                }
            };
            let result = match dispatcher.dispatch_wave(job, &wave, &snapshot).await {
                Ok(r) => r,
                Err(f) => {
                    return Err(self.fail(
                        job,
                        f.first,
                        f.failed_workers,
                        analyzer.remaining_intermediates(),
                    ))
                }
            };

            self.update(job, |s| s.state = JobState::Collecting);
            self.collect(job, &mut analyzer, &wave, &result, &mut trace);
            analyzer.release_shuffles();
            let releasable = analyzer.releasable_sets();
            if !releasable.is_empty() {
                info!(
                    job_id = %job,
                    sets = releasable.len(),
                    operator = "SchedulerRelease",
                    "deleting consumed intermediates"
                );
                let undeleted = dispatcher.delete_sets(&releasable, &snapshot).await;
                analyzer.restore_released(&undeleted);
                let mut session = self.lock_session();
                for set in releasable.iter().filter(|s| !undeleted.contains(s)) {
                    session.statistics_mut().forget(set);
                }
            }
            let completed = analyzer.completed_stages();
            self.update(job, |s| s.completed_stages = completed);
            metrics.set_intermediate_sets_live(
                &job.name,
                analyzer.remaining_intermediates().len() as u64,
            );
        }

        let leftovers = analyzer.remaining_intermediates();
        let mut undeleted = Vec::new();
        if !leftovers.is_empty() {
            undeleted = match self.resources.snapshot() {
                Ok(snapshot) => dispatcher.delete_sets(&leftovers, &snapshot).await,
                Err(e) => {
                    warn!(
                        job_id = %job,
                        error = %e,
                        operator = "SchedulerCleanup",
                        "skipping intermediate cleanup"
                    );
                    leftovers.clone()
                }
            };
            if !undeleted.is_empty() {
                warn!(
                    job_id = %job,
                    sets = undeleted.len(),
                    operator = "SchedulerCleanup",
                    "some intermediates could not be deleted"
                );
            }
            let mut session = self.lock_session();
            for set in leftovers.iter().filter(|s| !undeleted.contains(s)) {
                session.statistics_mut().forget(set);
            }
        }
        metrics.clear_job(&job.name, &STAGE_KIND_LABELS);

        let report = JobReport {
            job_id: job.clone(),
            outputs: analyzer.outputs(),
            trace,
            waves: analyzer.waves_planned(),
        };
        self.update(job, |s| {
            s.state = JobState::Done;
            s.orphaned_sets = undeleted;
        });
        if let Some(r) = self.lock_jobs().get_mut(job) {
            r.report = Some(report.clone());
        }
        metrics.inc_jobs(JobState::Done.label());
        info!(
            job_id = %job,
            waves = report.waves,
            stages = report.trace.len(),
            operator = "SchedulerRun",
            "job done"
        );
        Ok(report)
    }

    fn collect(
        &self,
        job: &JobId,
        analyzer: &mut PlanAnalyzer,
        wave: &Wave,
        result: &WaveResult,
        trace: &mut Vec<StageTrace>,
    ) {
        let mut session = self.lock_session();
        for o in &result.outcomes {
            if self.config.dynamic_planning {
                session
                    .statistics_mut()
                    .record_actual(&o.output, o.rows, o.bytes);
            }
            if let Some(learned) = &self.learned {
                let actual = TableStats::new(o.rows, o.bytes);
                if let Err(e) = learned.put(&o.output.logical_name(), actual) {
                    warn!(
                        job_id = %job,
                        set = %o.output,
                        error = %e,
                        operator = "SchedulerLearn",
                        "failed to record learned statistics"
                    );
                }
            }
            let estimate = wave.estimates.get(&o.stage_id).copied().unwrap_or_default();
            trace.push(StageTrace {
                stage_id: o.stage_id,
                kind: o.kind,
                wave: result.wave,
                elapsed_ms: o.elapsed.as_millis() as u64,
                output: o.output.clone(),
                rows: o.rows,
                bytes: o.bytes,
                estimated_rows: estimate.rows,
                estimated_bytes: estimate.bytes,
            });
        }
        let ids = result.outcomes.iter().map(|o| o.stage_id).collect::<Vec<_>>();
        analyzer.mark_completed(&ids);
    }

    /// Record a terminal failure and hand the error back.
    fn fail(
        &self,
        job: &JobId,
        err: DqsError,
        failed_workers: Vec<String>,
        orphaned_sets: Vec<SetIdentifier>,
    ) -> DqsError {
        error!(
            job_id = %job,
            kind = err.kind(),
            error = %err,
            failed_workers = ?failed_workers,
            orphaned_sets = orphaned_sets.len(),
            operator = "SchedulerRun",
            "job failed"
        );
        let message = err.to_string();
        self.update(job, |s| {
            s.state = JobState::Failed;
            s.last_error = Some(message);
            s.failed_workers = failed_workers;
            s.orphaned_sets = orphaned_sets;
        });
        let metrics = global_metrics();
        metrics.inc_jobs(JobState::Failed.label());
        metrics.clear_job(&job.name, &STAGE_KIND_LABELS);
        err
    }

    fn update(&self, job: &JobId, f: impl FnOnce(&mut JobStatus)) {
        if let Some(r) = self.lock_jobs().get_mut(job) {
            f(&mut r.status);
        }
    }

    fn lock_jobs(&self) -> MutexGuard<'_, HashMap<JobId, JobRecord>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_session(&self) -> MutexGuard<'_, SchedulerSession> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
