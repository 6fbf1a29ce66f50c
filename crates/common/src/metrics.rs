use std::sync::{Arc, OnceLock};

use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};

#[derive(Clone, Debug)]
pub struct MetricsRegistry {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    registry: Registry,
    scheduler_waves: CounterVec,
    stages_dispatched: CounterVec,
    dispatch_failures: CounterVec,
    stage_seconds: HistogramVec,
    intermediate_sets_live: GaugeVec,
    jobs: CounterVec,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::new()),
        }
    }

    pub fn inc_waves(&self, job_id: &str) {
        self.inner
            .scheduler_waves
            .with_label_values(&[job_id])
            .inc();
    }

    pub fn record_stage(&self, job_id: &str, kind: &str, secs: f64) {
        self.inner
            .stages_dispatched
            .with_label_values(&[job_id, kind])
            .inc();
        self.inner
            .stage_seconds
            .with_label_values(&[kind])
            .observe(secs.max(0.0));
    }

    pub fn inc_dispatch_failures(&self, worker: &str, kind: &str) {
        self.inner
            .dispatch_failures
            .with_label_values(&[worker, kind])
            .inc();
    }

    pub fn set_intermediate_sets_live(&self, job_id: &str, live: u64) {
        self.inner
            .intermediate_sets_live
            .with_label_values(&[job_id])
            .set(live as f64);
    }

    /// Drop the per-job series of a finished job.
    pub fn clear_job(&self, job_id: &str, stage_kinds: &[&str]) {
        let inner = &self.inner;
        let _ = inner.scheduler_waves.remove_label_values(&[job_id]);
        let _ = inner.intermediate_sets_live.remove_label_values(&[job_id]);
        for kind in stage_kinds {
            let _ = inner.stages_dispatched.remove_label_values(&[job_id, kind]);
        }
    }

    pub fn inc_jobs(&self, state: &str) {
        self.inner.jobs.with_label_values(&[state]).inc();
    }

    pub fn render_prometheus(&self) -> String {
        let metric_families = self.inner.registry.gather();
        let mut out = Vec::new();
        let enc = TextEncoder::new();
        if enc.encode(&metric_families, &mut out).is_err() {
            return String::new();
        }
        String::from_utf8_lossy(&out).to_string()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsInner {
    fn new() -> Self {
        let registry = Registry::new();

        let scheduler_waves = counter_vec(
            &registry,
            "dqs_scheduler_waves_total",
            "Waves dispatched per job",
            &["job_id"],
        );
        let stages_dispatched = counter_vec(
            &registry,
            "dqs_stages_dispatched_total",
            "Stages completed per job and stage kind",
            &["job_id", "kind"],
        );
        let dispatch_failures = counter_vec(
            &registry,
            "dqs_dispatch_failures_total",
            "Failed worker calls by worker and error kind",
            &["worker", "kind"],
        );
        let stage_seconds = histogram_vec(
            &registry,
            "dqs_stage_seconds",
            "Wall time from wave dispatch to stage acknowledgment",
            &["kind"],
        );
        let intermediate_sets_live = gauge_vec(
            &registry,
            "dqs_intermediate_sets_live",
            "Materialized intermediate sets not yet deleted",
            &["job_id"],
        );
        let jobs = counter_vec(
            &registry,
            "dqs_jobs_total",
            "Jobs reaching a terminal state",
            &["state"],
        );

        Self {
            registry,
            scheduler_waves,
            stages_dispatched,
            dispatch_failures,
            stage_seconds,
            intermediate_sets_live,
            jobs,
        }
    }
}

fn counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> CounterVec {
    let c = CounterVec::new(Opts::new(name, help), labels).expect("counter vec");
    registry
        .register(Box::new(c.clone()))
        .expect("register counter");
    c
}

fn gauge_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> GaugeVec {
    let g = GaugeVec::new(Opts::new(name, help), labels).expect("gauge vec");
    registry
        .register(Box::new(g.clone()))
        .expect("register gauge");
    g
}

fn histogram_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> HistogramVec {
    let h = HistogramVec::new(HistogramOpts::new(name, help), labels).expect("histogram vec");
    registry
        .register(Box::new(h.clone()))
        .expect("register histogram");
    h
}

static GLOBAL_METRICS: OnceLock<MetricsRegistry> = OnceLock::new();

pub fn global_metrics() -> &'static MetricsRegistry {
    GLOBAL_METRICS.get_or_init(MetricsRegistry::new)
}
