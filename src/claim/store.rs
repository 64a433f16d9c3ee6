use super::record::ClaimRecord;
use crate::config::SlotConfig;
use crate::core::{Result, SlotError};
use crate::identity::WorkerIdentity;
use crate::namespace::claim_file_path;
use crate::process::ProcessLifecycleManager;
use serde::Serialize;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// What a claim attempt found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The claim file was created by this attempt.
    Acquired,
    /// A stale claim was removed and replaced by ours.
    Reclaimed { previous: ClaimRecord },
    /// Someone else (possibly this very process) holds the slot.
    Held { record: ClaimRecord },
}

impl ClaimOutcome {
    pub fn is_acquired(&self) -> bool {
        matches!(self, ClaimOutcome::Acquired | ClaimOutcome::Reclaimed { .. })
    }
}

/// A claim file as seen on disk.
#[derive(Debug, Clone, Serialize)]
pub struct ClaimInfo {
    pub slot: u32,
    pub path: PathBuf,
    pub record: ClaimRecord,
    #[serde(rename = "age_ms", serialize_with = "serialize_millis")]
    pub age: Duration,
}

fn serialize_millis<S: serde::Serializer>(
    value: &Duration,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_u64(value.as_millis() as u64)
}

/// Filesystem mutual exclusion: one `slot-{n}.lock` file per slot.
///
/// Claims are only ever created (exclusively) or deleted, so the two races
/// that can happen are "create wins or loses" and "delete of a missing file".
#[derive(Debug, Clone)]
pub struct SlotClaimStore {
    claim_dir: PathBuf,
    owner_pid: u32,
    stale_after: Duration,
    lifecycle: ProcessLifecycleManager,
}

impl SlotClaimStore {
    pub fn new(claim_dir: impl Into<PathBuf>) -> Self {
        Self {
            claim_dir: claim_dir.into(),
            owner_pid: std::process::id(),
            stale_after: Duration::from_millis(5000),
            lifecycle: ProcessLifecycleManager::new(),
        }
    }

    pub fn from_config(config: &SlotConfig) -> Self {
        Self::new(config.claim_dir()).stale_after(config.stale_claim_after)
    }

    pub fn stale_after(mut self, threshold: Duration) -> Self {
        self.stale_after = threshold;
        self
    }

    /// Pid written into new claims. Defaults to the current process.
    pub fn with_owner_pid(mut self, pid: u32) -> Self {
        self.owner_pid = pid;
        self
    }

    pub fn owner_pid(&self) -> u32 {
        self.owner_pid
    }

    pub fn claim_dir(&self) -> &Path {
        &self.claim_dir
    }

    pub fn claim_path(&self, slot: u32) -> PathBuf {
        claim_file_path(&self.claim_dir, slot)
    }

    /// Tries to take `slot`, reclaiming it once if the current claim is stale.
    pub async fn claim(&self, slot: u32, identity: &WorkerIdentity) -> Result<ClaimOutcome> {
        fs::create_dir_all(&self.claim_dir)
            .await
            .map_err(|err| SlotError::io(&self.claim_dir, err))?;

        let path = self.claim_path(slot);
        let record = ClaimRecord::new(self.owner_pid, identity.as_str());

        if self.try_create(&path, &record).await? {
            info!(slot, pid = self.owner_pid, "slot claimed");
            return Ok(ClaimOutcome::Acquired);
        }

        let previous = match self.inspect(slot).await? {
            Some(existing) => {
                if !self.is_stale(&existing) {
                    debug!(slot, holder = ?existing.record.pid, "slot held");
                    return Ok(ClaimOutcome::Held {
                        record: existing.record,
                    });
                }
                self.remove_claim(&path).await?;
                existing.record
            }
            // Released between our create and our read.
            None => ClaimRecord::default(),
        };

        if self.try_create(&path, &record).await? {
            info!(slot, pid = self.owner_pid, stale_pid = ?previous.pid, "stale slot claim reclaimed");
            return Ok(ClaimOutcome::Reclaimed { previous });
        }

        // Lost the retry to a concurrent claimant.
        let record = self
            .inspect(slot)
            .await?
            .map(|info| info.record)
            .unwrap_or_default();
        debug!(slot, holder = ?record.pid, "slot taken during reclaim");
        Ok(ClaimOutcome::Held { record })
    }

    /// Reads the claim of `slot` without touching it.
    pub async fn inspect(&self, slot: u32) -> Result<Option<ClaimInfo>> {
        let path = self.claim_path(slot);

        let metadata = match fs::metadata(&path).await {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(SlotError::io(&path, err)),
        };
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            // Not valid UTF-8 yet; judged by age like any unparseable claim.
            Err(err) if err.kind() == ErrorKind::InvalidData => String::new(),
            Err(err) => return Err(SlotError::io(&path, err)),
        };

        let age = metadata
            .modified()
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok())
            .unwrap_or_default();

        Ok(Some(ClaimInfo {
            slot,
            path,
            record: ClaimRecord::parse(&content),
            age,
        }))
    }

    /// A claim is stale when its pid is dead, or when it has no readable pid
    /// and is older than the staleness threshold.
    pub fn is_stale(&self, info: &ClaimInfo) -> bool {
        match info.record.pid {
            Some(pid) => !self.lifecycle.is_alive(pid),
            None => info.age > self.stale_after,
        }
    }

    /// Deletes the claim of `slot`. Missing claims are fine.
    pub async fn release(&self, slot: u32) -> Result<()> {
        self.remove_claim(&self.claim_path(slot)).await?;
        debug!(slot, "slot claim released");
        Ok(())
    }

    /// Synchronous release for drop paths.
    pub fn release_blocking(&self, slot: u32) -> Result<()> {
        let path = self.claim_path(slot);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(SlotError::io(&path, err)),
        }
    }

    /// Slots that currently have a claim file, ascending.
    pub async fn claimed_slots(&self) -> Result<Vec<u32>> {
        let mut entries = match fs::read_dir(&self.claim_dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(SlotError::io(&self.claim_dir, err)),
        };

        let mut slots = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| SlotError::io(&self.claim_dir, err))?
        {
            let name = entry.file_name();
            let slot = name
                .to_str()
                .and_then(|name| name.strip_prefix("slot-"))
                .and_then(|rest| rest.strip_suffix(".lock"))
                .and_then(|number| number.parse::<u32>().ok());
            if let Some(slot) = slot {
                slots.push(slot);
            }
        }
        slots.sort_unstable();
        Ok(slots)
    }

    /// Exclusive create. `Ok(false)` when the file already exists.
    async fn try_create(&self, path: &Path, record: &ClaimRecord) -> Result<bool> {
        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await
        {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::AlreadyExists => return Ok(false),
            Err(err) => return Err(SlotError::io(path, err)),
        };

        let written = async {
            file.write_all(record.encode().as_bytes()).await?;
            file.flush().await
        }
        .await;

        if let Err(err) = written {
            let _ = fs::remove_file(path).await;
            return Err(SlotError::io(path, err));
        }
        Ok(true)
    }

    async fn remove_claim(&self, path: &Path) -> Result<()> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(SlotError::io(path, err)),
        }
    }
}
