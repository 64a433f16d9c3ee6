//! End-of-run sweep over every slot of the pool.
//!
//! Runs once per test run, after all workers are done: stops lingering
//! backends, deletes their pid files, tears down per-slot schemas and finally
//! wipes the claim directory so the next run starts from a clean pool.

use crate::config::SlotConfig;
use crate::core::{Result, SlotError};
use crate::namespace::SlotNamespace;
use crate::process::{
    ProcessLifecycleManager, ProcessSignaler, StopOutcome, UnixSignaler, read_pid_file,
    remove_pid_file,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io::ErrorKind;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Drops whatever database objects a slot created.
#[async_trait]
pub trait SchemaTeardown: Send + Sync {
    async fn teardown(&self, test_run_id: &str, schema_prefix: &str) -> Result<()>;
}

/// For runs without a database.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSchemaTeardown;

#[async_trait]
impl SchemaTeardown for NoopSchemaTeardown {
    async fn teardown(&self, _test_run_id: &str, _schema_prefix: &str) -> Result<()> {
        Ok(())
    }
}

/// Runs a shell command with `TEST_RUN_ID` and `SCHEMA_PREFIX` exported.
#[derive(Debug, Clone)]
pub struct CommandSchemaTeardown {
    command: String,
}

impl CommandSchemaTeardown {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl SchemaTeardown for CommandSchemaTeardown {
    async fn teardown(&self, test_run_id: &str, schema_prefix: &str) -> Result<()> {
        let output = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .env("TEST_RUN_ID", test_run_id)
            .env("SCHEMA_PREFIX", schema_prefix)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|err| SlotError::TeardownError {
                schema_prefix: schema_prefix.to_string(),
                reason: format!("failed to run '{}': {}", self.command, err),
            })?;

        if output.status.success() {
            return Ok(());
        }

        Err(SlotError::TeardownError {
            schema_prefix: schema_prefix.to_string(),
            reason: format!(
                "'{}' exited with {}: {}",
                self.command,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        })
    }
}

/// Per-slot result of the sweep.
#[derive(Debug, Clone, Serialize)]
pub struct SlotCleanup {
    pub slot: u32,
    pub pid: Option<u32>,
    pub stop: Option<StopOutcome>,
    pub pid_file_removed: bool,
    pub errors: Vec<String>,
}

impl SlotCleanup {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty() && self.stop.is_none_or(|outcome| outcome.is_stopped())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CleanupReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub slots: Vec<SlotCleanup>,
    pub claim_dir_removed: bool,
    pub claim_dir_error: Option<String>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.claim_dir_error.is_none() && self.slots.iter().all(SlotCleanup::is_clean)
    }

    /// Pids that were still running after both shutdown windows.
    pub fn surviving_pids(&self) -> Vec<u32> {
        self.slots
            .iter()
            .filter(|entry| entry.stop == Some(StopOutcome::StillAlive))
            .filter_map(|entry| entry.pid)
            .collect()
    }
}

pub struct CleanupCoordinator<S = UnixSignaler> {
    config: SlotConfig,
    lifecycle: ProcessLifecycleManager<S>,
    teardown: Box<dyn SchemaTeardown>,
}

impl CleanupCoordinator<UnixSignaler> {
    pub fn new(config: SlotConfig) -> Self {
        Self::with_lifecycle(config, ProcessLifecycleManager::new())
    }
}

impl<S: ProcessSignaler> CleanupCoordinator<S> {
    pub fn with_lifecycle(config: SlotConfig, lifecycle: ProcessLifecycleManager<S>) -> Self {
        Self {
            config,
            lifecycle,
            teardown: Box::new(NoopSchemaTeardown),
        }
    }

    pub fn schema_teardown(mut self, teardown: impl SchemaTeardown + 'static) -> Self {
        self.teardown = Box::new(teardown);
        self
    }

    /// Sweeps slots `1..=max_workers`, then removes the claim directory.
    /// Failures are recorded in the report and never stop the sweep.
    pub async fn run(&self) -> Result<CleanupReport> {
        self.config.validate()?;
        let started_at = Utc::now();

        let mut slots = Vec::with_capacity(self.config.max_workers as usize);
        for slot in 1..=self.config.max_workers {
            let namespace = SlotNamespace::derive(&self.config, slot)?;
            slots.push(self.sweep_slot(&namespace).await);
        }

        let claim_dir = self.config.claim_dir();
        let (claim_dir_removed, claim_dir_error) =
            match tokio::fs::remove_dir_all(&claim_dir).await {
                Ok(()) => (true, None),
                Err(err) if err.kind() == ErrorKind::NotFound => (false, None),
                Err(err) => {
                    let err = SlotError::io(&claim_dir, err);
                    warn!(error = %err, "failed to reset claim directory");
                    (false, Some(err.to_string()))
                }
            };

        let report = CleanupReport {
            started_at,
            finished_at: Utc::now(),
            slots,
            claim_dir_removed,
            claim_dir_error,
        };
        info!(
            slots = report.slots.len(),
            clean = report.is_clean(),
            "slot cleanup finished"
        );
        Ok(report)
    }

    async fn sweep_slot(&self, namespace: &SlotNamespace) -> SlotCleanup {
        let slot = namespace.slot;
        let mut entry = SlotCleanup {
            slot,
            pid: None,
            stop: None,
            pid_file_removed: false,
            errors: Vec::new(),
        };

        match read_pid_file(&namespace.pid_file) {
            Ok(Some(pid)) => {
                entry.pid = Some(pid);
                let outcome = self.lifecycle.stop(pid).await;
                if !outcome.is_stopped() {
                    warn!(slot, pid, "backend could not be stopped");
                }
                entry.stop = Some(outcome);
            }
            Ok(None) => {}
            Err(err) => {
                warn!(slot, error = %err, "unreadable pid file");
                entry.errors.push(err.to_string());
            }
        }

        // Removed even when the stop failed, so the next run does not retry it.
        match remove_pid_file(&namespace.pid_file) {
            Ok(removed) => entry.pid_file_removed = removed,
            Err(err) => {
                warn!(slot, error = %err, "failed to remove pid file");
                entry.errors.push(err.to_string());
            }
        }

        match self
            .teardown
            .teardown(&namespace.test_run_id, &namespace.schema_prefix)
            .await
        {
            Ok(()) => debug!(slot, schema_prefix = %namespace.schema_prefix, "schema torn down"),
            Err(err) => {
                warn!(slot, error = %err, "schema teardown failed");
                entry.errors.push(err.to_string());
            }
        }

        entry
    }
}
