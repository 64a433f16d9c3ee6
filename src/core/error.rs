use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SlotError {
    #[error("I/O error: {0}")]
    IoError(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Slot {slot} is outside the pool range 1..={max_workers}")]
    SlotOutOfRange { slot: u32, max_workers: u32 },

    #[error("Process error: {0}")]
    ProcessError(String),

    #[error("Schema teardown failed for '{schema_prefix}': {reason}")]
    TeardownError { schema_prefix: String, reason: String },

    #[error("Backend error: {0}")]
    BackendError(String),
}

pub type Result<T> = std::result::Result<T, SlotError>;

impl SlotError {
    /// Wraps an I/O failure together with the path it happened on.
    pub fn io(path: &Path, err: std::io::Error) -> Self {
        Self::IoError(format!("{}: {}", path.display(), err))
    }
}

impl From<std::io::Error> for SlotError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err.to_string())
    }
}
