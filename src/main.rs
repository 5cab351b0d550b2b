//! troupe node binary

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use troupe::{Engine, EngineBuilder, TroupeConfig, WorkflowSubmission};
use troupe_cluster::{
    ElectorConfig, LeaderElector, LifecycleConfig, MemoryCoordinator, NodeLifecycle,
    NodeRegistration,
};
use troupe_lanes::RedisLaneSettings;

#[derive(Parser)]
#[command(
    name = "troupe",
    version,
    about = "Multi-agent workflow orchestration engine"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a node and run until interrupted
    Run {
        /// Configuration file (TOML)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Compile a workflow submission and print its execution plan
    Validate {
        /// Submission file (JSON)
        file: PathBuf,
    },
    /// Execute a workflow submission locally and print its status
    Submit {
        /// Submission file (JSON)
        file: PathBuf,
        /// Configuration file (TOML)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_submission(path: &PathBuf) -> anyhow::Result<WorkflowSubmission> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading submission file {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing submission {}", path.display()))
}

fn build_engine(config: &TroupeConfig) -> anyhow::Result<Arc<Engine>> {
    let mut builder = EngineBuilder::new().with_settings(troupe::engine::EngineSettings {
        max_concurrent_workflows: config.engine.max_concurrent_workflows,
        signal_buffer: config.engine.signal_buffer,
        default_task_timeout: config.default_task_timeout(),
    });
    if let Some(redis) = &config.redis {
        let mut settings = RedisLaneSettings::new(redis.url.clone(), config.node.id.clone());
        settings.key_prefix = redis.key_prefix.clone();
        builder = builder.with_redis(settings);
    }
    for (name, lane) in &config.lanes {
        builder = builder.lane(name.clone(), lane.clone());
    }
    Ok(builder.build()?)
}

async fn run_node(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let config = TroupeConfig::load(config_path.as_deref())?;
    let engine = build_engine(&config)?;

    let recovered = engine.recover().await?;
    if recovered > 0 {
        tracing::info!(recovered, "requeued non-terminal workflows");
    }

    // Single-process deployments still run the coordination loops so a
    // node's behavior does not change shape when a shared backend is
    // wired in.
    let coordinator = Arc::new(MemoryCoordinator::new());
    let coordination = &config.coordination;
    let lifecycle = NodeLifecycle::start(
        coordinator.clone(),
        NodeRegistration::new(config.node.id.clone(), config.node.address.clone()),
        LifecycleConfig {
            ttl: std::time::Duration::from_millis(coordination.ttl_ms),
            heartbeat_interval: std::time::Duration::from_millis(
                coordination.heartbeat_interval_ms,
            ),
            failure_threshold: coordination.failure_threshold,
        },
    )
    .await?;
    let elector = LeaderElector::start(
        coordinator,
        config.node.id.clone(),
        ElectorConfig {
            lease_ttl: std::time::Duration::from_millis(coordination.leader_ttl_ms),
            retry_interval: std::time::Duration::from_millis(coordination.retry_interval_ms),
            renew_interval: std::time::Duration::from_millis(coordination.renew_interval_ms),
        },
    );

    tracing::info!(node = %config.node.id, "node running, ctrl-c to stop");
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    tracing::info!("shutting down");

    engine.shutdown().await;
    elector.stop().await;
    lifecycle.stop().await;
    Ok(())
}

async fn validate(file: PathBuf) -> anyhow::Result<()> {
    let submission = load_submission(&file)?;
    let mut graph = submission.build_graph()?;
    let plan = graph.compile()?;

    println!("workflow: {}", submission.name);
    println!("tasks: {}  layers: {}", plan.len(), plan.depth());
    for (depth, layer) in plan.layers().iter().enumerate() {
        println!("  layer {}: {}", depth, layer.join(", "));
    }
    println!("critical path: {}", plan.critical_path().join(" -> "));
    Ok(())
}

async fn submit(file: PathBuf, config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let config = TroupeConfig::load(config_path.as_deref())?;
    let engine = build_engine(&config)?;
    let submission = load_submission(&file)?;

    let status = engine.execute(submission).await?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    engine.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    match cli.command {
        Commands::Run { config } => run_node(config).await,
        Commands::Validate { file } => validate(file).await,
        Commands::Submit { file, config } => submit(file, config).await,
    }
}
