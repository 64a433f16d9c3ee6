pub mod lifecycle;
pub mod pid_file;

pub use lifecycle::{
    LifecycleTimings, ProcessLifecycleManager, ProcessSignaler, SignalDelivery, StopOutcome,
    StopSignal, UnixSignaler,
};
pub use pid_file::{parse_pid, read_pid_file, remove_pid_file, write_pid_file};
