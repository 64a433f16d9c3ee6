use crate::claim::{ClaimOutcome, SlotClaimStore};
use crate::config::SlotConfig;
use crate::core::{Result, SlotError};
use crate::identity::WorkerIdentity;
use crate::namespace::SlotNamespace;
use serde::Serialize;
use tokio::sync::{Mutex, OnceCell};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentSource {
    Claimed,
    Reclaimed,
    /// The claim already carried this process's pid.
    AlreadyOwned,
    /// Pool exhausted; derived from the worker index without a claim.
    Fallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SlotAssignment {
    pub slot: u32,
    pub source: AssignmentSource,
}

impl SlotAssignment {
    /// True when the claim file was created by the allocator that returned
    /// this assignment. `AlreadyOwned` claims belong to another allocator.
    pub fn created_claim(&self) -> bool {
        matches!(
            self.source,
            AssignmentSource::Claimed | AssignmentSource::Reclaimed
        )
    }
}

#[derive(Debug, Default)]
struct AllocatorState {
    resolved: Option<SlotAssignment>,
    /// Slot whose claim file this allocator created. Survives `reset`.
    created: Option<u32>,
}

/// Resolves this process's slot once and remembers it.
///
/// Dropping the allocator releases the claim it created, never one it merely
/// found carrying its pid. That release is best effort only; an abandoned
/// claim is recovered by stale detection.
#[derive(Debug)]
pub struct SlotAllocator {
    store: SlotClaimStore,
    worker_index: Option<u64>,
    state: Mutex<AllocatorState>,
}

impl SlotAllocator {
    pub fn new(store: SlotClaimStore) -> Self {
        Self {
            store,
            worker_index: None,
            state: Mutex::new(AllocatorState::default()),
        }
    }

    pub fn from_config(config: &SlotConfig) -> Self {
        let allocator = Self::new(SlotClaimStore::from_config(config));
        match config.worker_index {
            Some(index) => allocator.worker_index(index),
            None => allocator,
        }
    }

    /// Index used for the fallback slot when every slot is held.
    pub fn worker_index(mut self, index: u64) -> Self {
        self.worker_index = Some(index);
        self
    }

    pub fn store(&self) -> &SlotClaimStore {
        &self.store
    }

    /// Returns the memoized slot, claiming one on first call.
    ///
    /// Slots are tried in ascending order; the first successful claim wins.
    /// When all of them are held by live processes the fallback slot is
    /// returned instead of an error.
    pub async fn resolve_slot(
        &self,
        max_workers: u32,
        identity: &WorkerIdentity,
    ) -> Result<SlotAssignment> {
        if max_workers == 0 {
            return Err(SlotError::InvalidConfig(
                "max_workers must be > 0".to_string(),
            ));
        }

        let mut state = self.state.lock().await;
        if let Some(assignment) = state.resolved {
            return Ok(assignment);
        }

        let assignment = self.allocate(max_workers, identity).await?;
        if assignment.created_claim() {
            if let Some(previous) = state.created.replace(assignment.slot) {
                if previous != assignment.slot {
                    self.store.release(previous).await?;
                }
            }
        }
        state.resolved = Some(assignment);
        Ok(assignment)
    }

    /// Forgets the memoized slot without releasing its claim.
    pub async fn reset(&self) {
        self.state.lock().await.resolved = None;
    }

    /// Releases the claim created by this allocator, if any, and forgets the slot.
    pub async fn release(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.resolved = None;
        if let Some(slot) = state.created.take() {
            self.store.release(slot).await?;
        }
        Ok(())
    }

    async fn allocate(&self, max_workers: u32, identity: &WorkerIdentity) -> Result<SlotAssignment> {
        let own_pid = self.store.owner_pid();

        for slot in 1..=max_workers {
            let source = match self.store.claim(slot, identity).await? {
                ClaimOutcome::Acquired => AssignmentSource::Claimed,
                ClaimOutcome::Reclaimed { .. } => AssignmentSource::Reclaimed,
                ClaimOutcome::Held { record } if record.pid == Some(own_pid) => {
                    AssignmentSource::AlreadyOwned
                }
                ClaimOutcome::Held { .. } => continue,
            };
            info!(slot, ?source, worker = %identity, "slot resolved");
            return Ok(SlotAssignment { slot, source });
        }

        let index = self.worker_index.unwrap_or(u64::from(own_pid));
        let slot = fallback_slot(index, max_workers);
        warn!(
            slot,
            max_workers,
            worker_index = index,
            "all slots held, using fallback slot"
        );
        Ok(SlotAssignment {
            slot,
            source: AssignmentSource::Fallback,
        })
    }
}

impl Drop for SlotAllocator {
    fn drop(&mut self) {
        if let Some(slot) = self.state.get_mut().created.take() {
            if let Err(err) = self.store.release_blocking(slot) {
                warn!(slot, error = %err, "failed to release slot claim");
            }
        }
    }
}

/// The allocator owned by the current process, configured from the
/// environment on first use.
static PROCESS_ALLOCATOR: OnceCell<(SlotConfig, SlotAllocator)> = OnceCell::const_new();

async fn process_allocator() -> Result<&'static (SlotConfig, SlotAllocator)> {
    PROCESS_ALLOCATOR
        .get_or_try_init(|| async {
            let config = SlotConfig::from_env()?;
            let allocator = SlotAllocator::from_config(&config);
            Ok::<_, SlotError>((config, allocator))
        })
        .await
}

/// Resolves the slot of the current process and derives its namespace.
///
/// Every call in a process returns the same slot. The claim lives until
/// [`release_process_slot`] or until stale detection reclaims it after exit.
pub async fn claim_process_slot() -> Result<(SlotAssignment, SlotNamespace)> {
    let (config, allocator) = process_allocator().await?;
    let assignment = allocator
        .resolve_slot(config.max_workers, &WorkerIdentity::detect())
        .await?;
    let namespace = SlotNamespace::derive(config, assignment.slot)?;
    Ok((assignment, namespace))
}

/// Forgets the process slot so the next [`claim_process_slot`] resolves again.
pub async fn reset_process_slot() {
    if let Some((_, allocator)) = PROCESS_ALLOCATOR.get() {
        allocator.reset().await;
    }
}

/// Releases the claim created for the current process.
pub async fn release_process_slot() -> Result<()> {
    match PROCESS_ALLOCATOR.get() {
        Some((_, allocator)) => allocator.release().await,
        None => Ok(()),
    }
}

/// `(index - 1) mod max_workers + 1`, with index 0 treated like 1.
pub fn fallback_slot(index: u64, max_workers: u32) -> u32 {
    let max = u64::from(max_workers.max(1));
    // The remainder is below max_workers, so it fits in u32.
    (index.saturating_sub(1) % max) as u32 + 1
}
