use crate::config::ENV_WORKER_INDEX;
use std::fmt;

pub const ENV_RUNNER_ID: &str = "SLOTGUARD_RUNNER_ID";

/// Diagnostic description of the worker holding a claim.
///
/// Recorded in claim files for humans only. Liveness decisions use the pid
/// written next to it, never this string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerIdentity(String);

impl WorkerIdentity {
    pub fn new(value: impl Into<String>) -> Self {
        Self(sanitize(&value.into()))
    }

    /// Builds `<runner>/<index>/<pid>` from whatever the environment offers.
    pub fn detect() -> Self {
        let runner = std::env::var(ENV_RUNNER_ID)
            .or_else(|_| std::env::var("HOSTNAME"))
            .ok();
        let index = std::env::var(ENV_WORKER_INDEX).ok();
        Self::from_parts(runner.as_deref(), index.as_deref(), std::process::id())
    }

    pub fn from_parts(runner: Option<&str>, index: Option<&str>, pid: u32) -> Self {
        let part = |value: Option<&str>| {
            value
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .unwrap_or("-")
                .to_string()
        };
        Self::new(format!("{}/{}/{}", part(runner), part(index), pid))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// Claim files are line oriented.
fn sanitize(value: &str) -> String {
    value.replace(['\n', '\r'], " ")
}
