//! Resource identifiers derived from a slot number.
//!
//! Everything here is pure: the same slot and configuration always yield the
//! same port, schema prefix, run id and pid-file path, across restarts.

use crate::config::SlotConfig;
use crate::core::{Result, SlotError};
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Concrete resources owned by one slot. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotNamespace {
    pub slot: u32,
    pub port: u16,
    pub schema_prefix: String,
    pub test_run_id: String,
    pub pid_file: PathBuf,
}

impl SlotNamespace {
    /// Derives the namespace of `slot`, rejecting slots outside the pool.
    pub fn derive(config: &SlotConfig, slot: u32) -> Result<Self> {
        if slot == 0 || slot > config.max_workers {
            return Err(SlotError::SlotOutOfRange {
                slot,
                max_workers: config.max_workers,
            });
        }

        Ok(Self {
            slot,
            port: port(config.base_port, config.port_stride, slot)?,
            schema_prefix: schema_prefix(&config.app_tag, slot),
            test_run_id: test_run_id(&config.run_id_tag, slot),
            pid_file: pid_file_path(&config.state_dir, slot),
        })
    }

    /// Environment handed to a backend bound to this slot.
    pub fn env_vars(&self) -> Vec<(&'static str, String)> {
        vec![
            ("SLOT", self.slot.to_string()),
            ("PORT", self.port.to_string()),
            ("SCHEMA_PREFIX", self.schema_prefix.clone()),
            ("TEST_RUN_ID", self.test_run_id.clone()),
        ]
    }
}

/// `base + (slot - 1) * stride`
pub fn port(base_port: u16, stride: u16, slot: u32) -> Result<u16> {
    let offset = u64::from(slot.saturating_sub(1)) * u64::from(stride);
    u16::try_from(u64::from(base_port) + offset).map_err(|_| {
        SlotError::InvalidConfig(format!(
            "port for slot {slot} exceeds {} (base {base_port}, stride {stride})",
            u16::MAX
        ))
    })
}

pub fn schema_prefix(app_tag: &str, slot: u32) -> String {
    format!("{app_tag}_slot_{slot}")
}

pub fn test_run_id(run_id_tag: &str, slot: u32) -> String {
    format!("{run_id_tag}_slot_{slot}")
}

pub fn pid_file_path(state_dir: &Path, slot: u32) -> PathBuf {
    state_dir.join(format!("api-slot-{slot}.pid"))
}

pub fn claim_file_path(claim_dir: &Path, slot: u32) -> PathBuf {
    claim_dir.join(format!("slot-{slot}.lock"))
}
