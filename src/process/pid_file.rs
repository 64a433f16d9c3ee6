use crate::core::{Result, SlotError};
use std::io::{ErrorKind, Write};
use std::path::Path;
use tempfile::NamedTempFile;

/// Parses pid-file content: one decimal integer, surrounding whitespace allowed.
/// Zero, negative and malformed values yield `None`.
pub fn parse_pid(content: &str) -> Option<u32> {
    content.trim().parse::<u32>().ok().filter(|pid| *pid > 0)
}

/// Reads the pid recorded at `path`; a missing file is `Ok(None)`.
pub fn read_pid_file(path: &Path) -> Result<Option<u32>> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(parse_pid(&content)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(SlotError::io(path, err)),
    }
}

/// Records `pid` at `path`. The file appears complete or not at all.
pub fn write_pid_file(path: &Path, pid: u32) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| SlotError::IoError(format!("{} has no parent", path.display())))?;
    std::fs::create_dir_all(dir).map_err(|err| SlotError::io(dir, err))?;

    let mut temp = NamedTempFile::new_in(dir).map_err(|err| SlotError::io(dir, err))?;
    writeln!(temp, "{pid}").map_err(|err| SlotError::io(temp.path(), err))?;
    temp.persist(path)
        .map_err(|err| SlotError::io(path, err.error))?;
    Ok(())
}

/// Deletes the pid file. Returns whether a file was actually removed.
pub fn remove_pid_file(path: &Path) -> Result<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(SlotError::io(path, err)),
    }
}
