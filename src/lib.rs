// ============================================================================
// slotguard: bounded worker-slot coordination for parallel test runs
// ============================================================================
//
// Worker processes share nothing but a state directory. Each one claims a
// numbered slot there, derives its private resources (port, schema prefix,
// run id, pid file) from the slot number, and the end-of-run sweep stops
// leftover backends and resets the pool.
//
// The claim store is single-host only: it relies on exclusive file creation
// in a local directory, not on a distributed lock.

pub mod allocator;
pub mod backend;
pub mod claim;
pub mod cleanup;
pub mod config;
pub mod core;
pub mod identity;
pub mod namespace;
pub mod process;

pub use allocator::{
    AssignmentSource, SlotAllocator, SlotAssignment, claim_process_slot, fallback_slot,
    release_process_slot, reset_process_slot,
};
pub use backend::{BackendHandle, BackendLauncher};
pub use claim::{ClaimInfo, ClaimOutcome, ClaimRecord, SlotClaimStore};
pub use cleanup::{
    CleanupCoordinator, CleanupReport, CommandSchemaTeardown, NoopSchemaTeardown, SchemaTeardown,
    SlotCleanup,
};
pub use config::SlotConfig;
pub use crate::core::{Result, SlotError};
pub use identity::WorkerIdentity;
pub use namespace::SlotNamespace;
pub use process::{
    LifecycleTimings, ProcessLifecycleManager, ProcessSignaler, SignalDelivery, StopOutcome,
    StopSignal, UnixSignaler,
};
