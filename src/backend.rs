use crate::core::{Result, SlotError};
use crate::namespace::SlotNamespace;
use crate::process::{
    ProcessLifecycleManager, ProcessSignaler, StopOutcome, remove_pid_file, write_pid_file,
};
use std::process::Stdio;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::sync::watch;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Spawns the backend server bound to a slot's namespace.
///
/// The namespace reaches the backend through `SLOT`, `PORT`, `SCHEMA_PREFIX`
/// and `TEST_RUN_ID`; everything else about the backend is up to the command.
#[derive(Debug, Clone)]
pub struct BackendLauncher {
    program: String,
    args: Vec<String>,
    envs: Vec<(String, String)>,
}

impl BackendLauncher {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Starts the backend and records its pid in the slot's pid file.
    pub async fn launch(&self, namespace: &SlotNamespace) -> Result<BackendHandle> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(namespace.env_vars())
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null());

        let mut child = command.spawn().map_err(|err| {
            SlotError::BackendError(format!("failed to spawn '{}': {}", self.program, err))
        })?;
        let pid = child.id().ok_or_else(|| {
            SlotError::BackendError(format!("'{}' exited before reporting a pid", self.program))
        })?;

        if let Err(err) = write_pid_file(&namespace.pid_file, pid) {
            if let Err(kill_err) = child.kill().await {
                warn!(pid, error = %kill_err, "failed to kill unrecorded backend");
            }
            return Err(SlotError::BackendError(format!(
                "backend pid {pid} stopped, pid file not written: {err}"
            )));
        }

        // Reap in the background; an unreaped child would keep answering
        // liveness probes as a zombie.
        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(async move {
            let status = match child.wait().await {
                Ok(status) => status.to_string(),
                Err(err) => format!("wait failed: {err}"),
            };
            let _ = exit_tx.send(Some(status));
        });

        info!(
            slot = namespace.slot,
            pid,
            port = namespace.port,
            program = %self.program,
            "backend started"
        );

        Ok(BackendHandle {
            namespace: namespace.clone(),
            pid,
            exit_rx,
        })
    }
}

/// A running backend owned by this process.
#[derive(Debug)]
pub struct BackendHandle {
    namespace: SlotNamespace,
    pid: u32,
    exit_rx: watch::Receiver<Option<String>>,
}

impl BackendHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn namespace(&self) -> &SlotNamespace {
        &self.namespace
    }

    /// Exit status, once the backend has exited.
    pub fn exit_status(&self) -> Option<String> {
        self.exit_rx.borrow().clone()
    }

    /// Waits until the slot's port accepts TCP connections.
    pub async fn wait_until_ready(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = self.exit_status() {
                return Err(SlotError::BackendError(format!(
                    "backend for slot {} exited before becoming ready ({})",
                    self.namespace.slot, status
                )));
            }

            if TcpStream::connect(("127.0.0.1", self.namespace.port))
                .await
                .is_ok()
            {
                debug!(slot = self.namespace.slot, port = self.namespace.port, "backend ready");
                return Ok(());
            }

            if Instant::now() >= deadline {
                return Err(SlotError::BackendError(format!(
                    "backend for slot {} not listening on port {} after {} ms",
                    self.namespace.slot,
                    self.namespace.port,
                    timeout.as_millis()
                )));
            }
            sleep(READY_POLL_INTERVAL).await;
        }
    }

    /// Stops the backend and removes its pid file, whatever the outcome.
    pub async fn stop<S: ProcessSignaler>(
        self,
        lifecycle: &ProcessLifecycleManager<S>,
    ) -> Result<StopOutcome> {
        let outcome = lifecycle.stop(self.pid).await;
        remove_pid_file(&self.namespace.pid_file)?;
        info!(slot = self.namespace.slot, pid = self.pid, ?outcome, "backend stopped");
        Ok(outcome)
    }
}
