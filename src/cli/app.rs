use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;
use slotguard::{
    BackendLauncher, ClaimInfo, CleanupCoordinator, CommandSchemaTeardown, ProcessLifecycleManager,
    SlotAllocator, SlotAssignment, SlotClaimStore, SlotConfig, SlotNamespace, StopOutcome,
    WorkerIdentity, process::read_pid_file,
};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "slotguard")]
#[command(about = "Worker slot coordination for parallel integration test runs")]
struct Cli {
    /// Overrides SLOTGUARD_STATE_DIR
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    /// Overrides SLOTGUARD_MAX_WORKERS
    #[arg(long, global = true)]
    max_workers: Option<u32>,

    /// Overrides SLOTGUARD_WORKER_INDEX
    #[arg(long, global = true)]
    worker_index: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Claim a slot and print its namespace as JSON
    Resolve {
        /// Keep the claim for this long before releasing it
        #[arg(long, default_value_t = 0)]
        hold_ms: u64,
    },
    /// Claim a slot, run a backend bound to it until interrupted
    Run {
        #[arg(long, default_value_t = 30_000)]
        ready_timeout_ms: u64,
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Show claims and pid files for every slot
    Status,
    /// Stop a process: SIGTERM, then SIGKILL after the grace period
    Stop { pid: u32 },
    /// Stop all slot backends, tear down schemas and reset the pool
    Cleanup {
        /// Shell command run per slot with TEST_RUN_ID and SCHEMA_PREFIX set
        #[arg(long)]
        teardown_cmd: Option<String>,
    },
}

#[derive(Serialize)]
struct ResolveOutput {
    pid: u32,
    assignment: SlotAssignment,
    namespace: SlotNamespace,
}

#[derive(Serialize)]
struct SlotStatus {
    slot: u32,
    claim: Option<ClaimInfo>,
    claim_stale: Option<bool>,
    backend_pid: Option<u32>,
    backend_alive: Option<bool>,
}

pub struct App {
    cli: Cli,
}

impl App {
    pub fn from_args() -> Self {
        Self { cli: Cli::parse() }
    }

    pub async fn run(self) -> Result<()> {
        let config = self.config()?;

        match self.cli.command {
            Command::Resolve { hold_ms } => resolve(&config, hold_ms).await,
            Command::Run {
                ready_timeout_ms,
                command,
            } => run_backend(&config, &command, Duration::from_millis(ready_timeout_ms)).await,
            Command::Status => status(&config).await,
            Command::Stop { pid } => stop(pid).await,
            Command::Cleanup { teardown_cmd } => cleanup(config, teardown_cmd).await,
        }
    }

    fn config(&self) -> Result<SlotConfig> {
        let mut config = SlotConfig::from_env().context("failed to load configuration")?;
        if let Some(dir) = &self.cli.state_dir {
            config = config.state_dir(dir.clone());
        }
        if let Some(max_workers) = self.cli.max_workers {
            config = config.max_workers(max_workers);
        }
        if let Some(index) = self.cli.worker_index {
            config = config.worker_index(index);
        }
        config.validate().context("invalid configuration")?;
        Ok(config)
    }
}

async fn claim(config: &SlotConfig) -> Result<(SlotAllocator, SlotAssignment, SlotNamespace)> {
    let allocator = SlotAllocator::from_config(config);
    let assignment = allocator
        .resolve_slot(config.max_workers, &WorkerIdentity::detect())
        .await
        .context("failed to resolve slot")?;
    let namespace = SlotNamespace::derive(config, assignment.slot)?;
    Ok((allocator, assignment, namespace))
}

async fn resolve(config: &SlotConfig, hold_ms: u64) -> Result<()> {
    let (allocator, assignment, namespace) = claim(config).await?;
    print_json(&ResolveOutput {
        pid: std::process::id(),
        assignment,
        namespace,
    })?;

    if hold_ms > 0 {
        tokio::time::sleep(Duration::from_millis(hold_ms)).await;
    }
    allocator.release().await?;
    Ok(())
}

async fn run_backend(config: &SlotConfig, command: &[String], ready_timeout: Duration) -> Result<()> {
    let Some((program, args)) = command.split_first() else {
        bail!("missing backend command");
    };

    let (allocator, assignment, namespace) = claim(config).await?;
    let launcher = args
        .iter()
        .fold(BackendLauncher::new(program.as_str()), |launcher, arg| launcher.arg(arg.as_str()));
    let backend = launcher.launch(&namespace).await?;

    let lifecycle = ProcessLifecycleManager::new();
    if let Err(err) = backend.wait_until_ready(ready_timeout).await {
        error!(error = %err, "backend did not become ready");
        backend.stop(&lifecycle).await?;
        allocator.release().await?;
        return Err(err.into());
    }

    print_json(&ResolveOutput {
        pid: backend.pid(),
        assignment,
        namespace,
    })?;

    shutdown_signal().await;
    info!("shutdown requested");

    let outcome = backend.stop(&lifecycle).await?;
    allocator.release().await?;
    if outcome == StopOutcome::StillAlive {
        bail!("backend survived SIGKILL");
    }
    Ok(())
}

async fn status(config: &SlotConfig) -> Result<()> {
    let store = SlotClaimStore::from_config(config);
    let lifecycle = ProcessLifecycleManager::new();

    let mut slots = Vec::with_capacity(config.max_workers as usize);
    for slot in 1..=config.max_workers {
        let claim = store.inspect(slot).await?;
        let claim_stale = claim.as_ref().map(|info| store.is_stale(info));
        let namespace = SlotNamespace::derive(config, slot)?;
        let backend_pid = read_pid_file(&namespace.pid_file)?;
        slots.push(SlotStatus {
            slot,
            claim,
            claim_stale,
            backend_pid,
            backend_alive: backend_pid.map(|pid| lifecycle.is_alive(pid)),
        });
    }
    print_json(&slots)
}

async fn stop(pid: u32) -> Result<()> {
    let outcome = ProcessLifecycleManager::new().stop(pid).await;
    print_json(&outcome)?;
    if !outcome.is_stopped() {
        bail!("process {pid} is still alive");
    }
    Ok(())
}

async fn cleanup(config: SlotConfig, teardown_cmd: Option<String>) -> Result<()> {
    let mut coordinator = CleanupCoordinator::new(config);
    if let Some(command) = teardown_cmd {
        coordinator = coordinator.schema_teardown(CommandSchemaTeardown::new(command));
    }

    let report = coordinator.run().await.context("slot cleanup failed")?;
    print_json(&report)?;
    if !report.is_clean() {
        bail!("cleanup finished with errors");
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "unable to install ctrl+c handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "unable to install sigterm handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
