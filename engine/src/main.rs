use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use foreman_core::{
    ApprovalManager, CheckpointStore, ConfigStore, CreditLedger, EventBus, LocalBatchSink,
    ReducedLoopRunner, RunOrchestrator, SessionRegistry, Storage, SubagentPool, ValidationGate,
    DEFAULT_ENGINE_HOST, DEFAULT_ENGINE_PORT,
};
use foreman_observability::{
    canonical_logs_dir_from_root, init_process_logging, ProcessKind,
};
use foreman_providers::ProviderRegistry;
use foreman_server::{serve, AppState};
use foreman_tools::ToolRegistry;

const LOG_RETENTION_DAYS: u64 = 14;
const SUBAGENT_LOOP_ITERATIONS: u64 = 8;

#[derive(Parser, Debug)]
#[command(name = "foreman-engine")]
#[command(about = "Headless Foreman agent runtime")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP engine.
    Serve {
        #[arg(long, alias = "host", default_value = DEFAULT_ENGINE_HOST)]
        hostname: String,
        #[arg(long, default_value_t = DEFAULT_ENGINE_PORT)]
        port: u16,
        /// Engine state directory (runs, checkpoints, logs, config).
        #[arg(long, env = "FOREMAN_STATE_DIR")]
        state_dir: Option<PathBuf>,
        /// Workspace the run's tools operate on.
        #[arg(long, env = "FOREMAN_WORKSPACE", default_value = ".")]
        workspace: PathBuf,
        /// Hold validated mutations until a human approves the commit.
        #[arg(long, default_value_t = false)]
        require_commit_approval: bool,
    },
    /// Inspect or seed configuration.
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// Print the effective configuration.
    Show {
        #[arg(long, env = "FOREMAN_STATE_DIR")]
        state_dir: Option<PathBuf>,
    },
    /// Write default limits into the config file.
    Seed {
        #[arg(long, env = "FOREMAN_STATE_DIR")]
        state_dir: Option<PathBuf>,
    },
}

fn resolve_state_dir(explicit: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    if let Some(dir) = explicit {
        return Ok(dir);
    }
    let base = dirs::data_dir().context("no data directory available for engine state")?;
    Ok(base.join("foreman"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Serve {
            hostname,
            port,
            state_dir,
            workspace,
            require_commit_approval,
        } => run_serve(hostname, port, state_dir, workspace, require_commit_approval).await,
        Command::Config { command } => match command {
            ConfigCommand::Show { state_dir } => {
                let state_dir = resolve_state_dir(state_dir)?;
                let config = ConfigStore::new(state_dir.join("config.json")).await?;
                let effective = config.get_effective_value().await;
                println!("{}", serde_json::to_string_pretty(&effective)?);
                Ok(())
            }
            ConfigCommand::Seed { state_dir } => {
                let state_dir = resolve_state_dir(state_dir)?;
                let config = ConfigStore::new(state_dir.join("config.json")).await?;
                let limits = foreman_core::LimitsConfig::default();
                config
                    .patch_file(serde_json::json!({"limits": limits}))
                    .await?;
                println!("seeded default limits into {}", state_dir.display());
                Ok(())
            }
        },
    }
}

async fn run_serve(
    hostname: String,
    port: u16,
    state_dir: Option<PathBuf>,
    workspace: PathBuf,
    require_commit_approval: bool,
) -> anyhow::Result<()> {
    let state_dir = resolve_state_dir(state_dir)?;
    let workspace = workspace
        .canonicalize()
        .with_context(|| format!("workspace `{}` not found", workspace.display()))?;

    let logs_dir = canonical_logs_dir_from_root(&state_dir);
    let (_log_guard, log_info) =
        init_process_logging(ProcessKind::Engine, &logs_dir, LOG_RETENTION_DAYS)?;
    info!(
        logs_dir = %log_info.logs_dir,
        workspace = %workspace.display(),
        "foreman engine starting"
    );

    let config = ConfigStore::new(state_dir.join("config.json")).await?;
    let engine_config = config.get().await;
    let limits = engine_config.limits.clone();

    let storage = Arc::new(Storage::new(state_dir.join("state")).await?);
    let event_bus = EventBus::new();
    let providers = ProviderRegistry::new(engine_config.providers);
    let tools = ToolRegistry::new(&workspace);
    let ledger = CreditLedger::new(event_bus.clone());
    let checkpoints = CheckpointStore::new(&state_dir, &workspace).await?;
    let validation = ValidationGate::new(&workspace);
    let commit_sink = Arc::new(LocalBatchSink::new(&state_dir).await?);
    let approvals = ApprovalManager::new(event_bus.clone());
    let subagent_runner = Arc::new(ReducedLoopRunner::new(
        providers.clone(),
        tools.clone(),
        SUBAGENT_LOOP_ITERATIONS,
    ));
    let subagents = SubagentPool::new(
        limits.subagent_concurrency,
        subagent_runner,
        storage.clone(),
        event_bus.clone(),
    );
    let sessions = SessionRegistry::new();

    let orchestrator = RunOrchestrator::new(
        storage.clone(),
        event_bus.clone(),
        providers,
        tools,
        ledger,
        checkpoints,
        validation,
        Some(commit_sink),
        approvals,
        subagents,
        sessions.clone(),
        config.clone(),
    )
    .with_commit_approval(require_commit_approval);

    // Idle-session reaper: stale mutual-exclusion slots are cleared so an
    // abandoned run cannot block its actor forever.
    let idle_ms = limits.idle_session_timeout_ms;
    let reaper_sessions = sessions.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(60));
        loop {
            ticker.tick().await;
            for (actor_id, run) in reaper_sessions.reap_stale(idle_ms).await {
                tracing::warn!(actor_id, run_id = %run.run_id, "reaped stale run slot");
            }
        }
    });

    let addr: SocketAddr = format!("{hostname}:{port}")
        .parse()
        .with_context(|| format!("invalid listen address {hostname}:{port}"))?;
    let state = AppState::new(orchestrator, storage, event_bus, config);
    serve(addr, state).await
}
