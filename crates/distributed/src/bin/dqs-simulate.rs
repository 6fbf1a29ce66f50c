use std::env;
use std::sync::Arc;

use dqs_common::{SchedulerConfig, SequenceGenerator};
use dqs_distributed::{InProcessCluster, Scheduler, SchedulerSession};
use dqs_planner::{explain_plan, LogicalPlan};
use dqs_storage::{Catalog, NodeResource, StaticResources};
use tracing_subscriber::EnvFilter;

fn env_or_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_u32_or_default(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(default)
}

fn load_plan(path: &str) -> Result<LogicalPlan, Box<dyn std::error::Error>> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

fn load_catalog(path: Option<String>) -> Result<Catalog, Box<dyn std::error::Error>> {
    match path {
        Some(p) => Ok(Catalog::load(&p)?),
        None => Ok(Catalog::new()),
    }
}

/// Pseudo-cluster mode co-locates `DQS_PSEUDO_NODES` workers on localhost;
/// otherwise the cluster is read from `DQS_CLUSTER_PATH`.
fn load_cluster(
    config: &SchedulerConfig,
    path: Option<String>,
) -> Result<StaticResources, Box<dyn std::error::Error>> {
    if let Some(p) = path.filter(|_| !config.pseudo_cluster_mode) {
        return Ok(StaticResources::load_from_json(&p)?);
    }
    let nodes = env_u32_or_default("DQS_PSEUDO_NODES", 2).max(1);
    let cores = env_u32_or_default("DQS_PSEUDO_CORES", 4);
    Ok(StaticResources::new(
        (0..nodes)
            .map(|i| NodeResource::new(format!("127.0.0.1:{}", 8109 + i), cores, 4 << 30))
            .collect(),
    ))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let plan_path = match env::args().nth(1) {
        Some(p) => p,
        None => env_or_default("DQS_PLAN_PATH", "plan.json"),
    };
    let config = SchedulerConfig::from_env()?;
    let plan = load_plan(&plan_path)?;
    let catalog = load_catalog(env::var("DQS_CATALOG_PATH").ok())?;
    let cluster = load_cluster(&config, env::var("DQS_CLUSTER_PATH").ok())?;

    println!("{}", explain_plan(&plan));

    let session = SchedulerSession::with_config(Arc::new(SequenceGenerator::new()), &config);
    let scheduler = Scheduler::new(
        config,
        session,
        Arc::new(cluster),
        Arc::new(catalog),
        Arc::new(InProcessCluster::new()),
    )?;
    let report = scheduler.run_query(&plan).await?;

    println!("{} finished in {} wave(s)", report.job_id, report.waves);
    for t in &report.trace {
        println!(
            "  wave={} stage={} kind={} output={} rows={} bytes={} est_rows={} est_bytes={} elapsed_ms={}",
            t.wave,
            t.stage_id,
            t.kind,
            t.output,
            t.rows,
            t.bytes,
            t.estimated_rows,
            t.estimated_bytes,
            t.elapsed_ms
        );
    }
    for out in &report.outputs {
        println!("  output {out}");
    }
    Ok(())
}
