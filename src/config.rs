use crate::core::{Result, SlotError};
use std::path::PathBuf;
use std::time::Duration;

pub const ENV_MAX_WORKERS: &str = "SLOTGUARD_MAX_WORKERS";
pub const ENV_BASE_PORT: &str = "SLOTGUARD_BASE_PORT";
pub const ENV_APP_TAG: &str = "SLOTGUARD_APP_TAG";
pub const ENV_RUN_ID: &str = "SLOTGUARD_RUN_ID";
pub const ENV_STATE_DIR: &str = "SLOTGUARD_STATE_DIR";
pub const ENV_WORKER_INDEX: &str = "SLOTGUARD_WORKER_INDEX";

const DEFAULT_MAX_WORKERS: u32 = 4;
const DEFAULT_BASE_PORT: u16 = 4101;
const DEFAULT_PORT_STRIDE: u16 = 10;
const DEFAULT_APP_TAG: &str = "app";
const DEFAULT_RUN_ID_TAG: &str = "e2e";
const DEFAULT_STALE_CLAIM_AFTER: Duration = Duration::from_millis(5000);

/// Worker pool configuration
///
/// Every field has a hardcoded default; the environment (or the builder
/// methods) only override them.
#[derive(Debug, Clone)]
pub struct SlotConfig {
    /// Size of the slot pool; slots are numbered `1..=max_workers`
    pub max_workers: u32,

    /// Port handed to slot 1
    pub base_port: u16,

    /// Distance between the ports of two consecutive slots
    pub port_stride: u16,

    /// Tag used to build schema prefixes (`{app_tag}_slot_{n}`)
    pub app_tag: String,

    /// Tag used to build run ids (`{run_id_tag}_slot_{n}`)
    pub run_id_tag: String,

    /// Directory holding claim files and pid files
    pub state_dir: PathBuf,

    /// Externally supplied worker index, used only for the fallback slot
    pub worker_index: Option<u64>,

    /// Age after which an unreadable claim is presumed abandoned
    pub stale_claim_after: Duration,
}

impl SlotConfig {
    pub fn new() -> Self {
        Self {
            max_workers: DEFAULT_MAX_WORKERS,
            base_port: DEFAULT_BASE_PORT,
            port_stride: DEFAULT_PORT_STRIDE,
            app_tag: DEFAULT_APP_TAG.to_string(),
            run_id_tag: DEFAULT_RUN_ID_TAG.to_string(),
            state_dir: std::env::temp_dir().join("slotguard"),
            worker_index: None,
            stale_claim_after: DEFAULT_STALE_CLAIM_AFTER,
        }
    }

    /// Load overrides from `SLOTGUARD_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::new();

        if let Some(value) = env_var(ENV_MAX_WORKERS) {
            config.max_workers = parse_env(ENV_MAX_WORKERS, &value)?;
        }
        if let Some(value) = env_var(ENV_BASE_PORT) {
            config.base_port = parse_env(ENV_BASE_PORT, &value)?;
        }
        if let Some(value) = env_var(ENV_APP_TAG) {
            config.app_tag = value;
        }
        if let Some(value) = env_var(ENV_RUN_ID) {
            config.run_id_tag = value;
        }
        if let Some(value) = env_var(ENV_STATE_DIR) {
            config.state_dir = PathBuf::from(value);
        }
        if let Some(value) = env_var(ENV_WORKER_INDEX) {
            config.worker_index = Some(parse_env(ENV_WORKER_INDEX, &value)?);
        }

        config.validate()?;
        Ok(config)
    }

    /// Set the pool size
    pub fn max_workers(mut self, max_workers: u32) -> Self {
        self.max_workers = max_workers;
        self
    }

    /// Set the base port
    pub fn base_port(mut self, port: u16) -> Self {
        self.base_port = port;
        self
    }

    /// Set the port stride
    pub fn port_stride(mut self, stride: u16) -> Self {
        self.port_stride = stride;
        self
    }

    /// Set the application tag
    pub fn app_tag(mut self, tag: &str) -> Self {
        self.app_tag = tag.to_string();
        self
    }

    /// Set the run id tag
    pub fn run_id_tag(mut self, tag: &str) -> Self {
        self.run_id_tag = tag.to_string();
        self
    }

    /// Set the state directory
    pub fn state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = dir.into();
        self
    }

    /// Set the external worker index
    pub fn worker_index(mut self, index: u64) -> Self {
        self.worker_index = Some(index);
        self
    }

    /// Set the staleness threshold for unreadable claims
    pub fn stale_claim_after(mut self, threshold: Duration) -> Self {
        self.stale_claim_after = threshold;
        self
    }

    /// Directory holding one claim file per slot
    pub fn claim_dir(&self) -> PathBuf {
        self.state_dir.join("slot-claims")
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(SlotError::InvalidConfig(
                "max_workers must be > 0".to_string(),
            ));
        }

        if self.port_stride == 0 {
            return Err(SlotError::InvalidConfig(
                "port_stride must be > 0".to_string(),
            ));
        }

        if self.app_tag.trim().is_empty() {
            return Err(SlotError::InvalidConfig(
                "app_tag cannot be empty".to_string(),
            ));
        }

        if self.run_id_tag.trim().is_empty() {
            return Err(SlotError::InvalidConfig(
                "run_id_tag cannot be empty".to_string(),
            ));
        }

        let highest_port = u64::from(self.base_port)
            + u64::from(self.max_workers - 1) * u64::from(self.port_stride);
        if highest_port > u64::from(u16::MAX) {
            return Err(SlotError::InvalidConfig(format!(
                "port range overflows: slot {} would need port {}",
                self.max_workers, highest_port
            )));
        }

        Ok(())
    }
}

impl Default for SlotConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse::<T>()
        .map_err(|_| SlotError::InvalidConfig(format!("{key} has invalid value '{value}'")))
}
