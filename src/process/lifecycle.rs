use serde::Serialize;
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

/// Signals used by the two-step shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    Terminate,
    Kill,
}

/// Result of delivering a signal or a liveness probe to a pid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalDelivery {
    Delivered,
    NoSuchProcess,
    /// Any other failure (permission denied, invalid target, ...)
    Refused,
}

/// OS boundary of the lifecycle manager.
pub trait ProcessSignaler: Send + Sync {
    /// Sends the null signal: existence check only.
    fn probe(&self, pid: u32) -> SignalDelivery;

    fn send(&self, pid: u32, signal: StopSignal) -> SignalDelivery;
}

/// `kill(2)` through `nix`.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnixSignaler;

#[cfg(unix)]
impl UnixSignaler {
    fn deliver(pid: u32, signal: Option<nix::sys::signal::Signal>) -> SignalDelivery {
        use nix::errno::Errno;
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        // 0 and negative values address process groups, never a single process.
        let raw = match i32::try_from(pid) {
            Ok(raw) if raw > 0 => raw,
            _ => return SignalDelivery::NoSuchProcess,
        };

        match kill(Pid::from_raw(raw), signal) {
            Ok(()) => SignalDelivery::Delivered,
            Err(Errno::ESRCH) => SignalDelivery::NoSuchProcess,
            Err(_) => SignalDelivery::Refused,
        }
    }
}

#[cfg(unix)]
impl ProcessSignaler for UnixSignaler {
    fn probe(&self, pid: u32) -> SignalDelivery {
        Self::deliver(pid, None)
    }

    fn send(&self, pid: u32, signal: StopSignal) -> SignalDelivery {
        use nix::sys::signal::Signal;

        let signal = match signal {
            StopSignal::Terminate => Signal::SIGTERM,
            StopSignal::Kill => Signal::SIGKILL,
        };
        Self::deliver(pid, Some(signal))
    }
}

#[cfg(not(unix))]
impl ProcessSignaler for UnixSignaler {
    fn probe(&self, _pid: u32) -> SignalDelivery {
        SignalDelivery::Refused
    }

    fn send(&self, _pid: u32, _signal: StopSignal) -> SignalDelivery {
        SignalDelivery::Refused
    }
}

/// Poll interval and grace periods for [`ProcessLifecycleManager::stop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecycleTimings {
    pub poll_interval: Duration,
    pub graceful_timeout: Duration,
    pub forceful_timeout: Duration,
}

impl Default for LifecycleTimings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            graceful_timeout: Duration::from_millis(5000),
            forceful_timeout: Duration::from_millis(2000),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopOutcome {
    /// Nothing was running; no signal was sent.
    AlreadyExited,
    /// Exited within the graceful window.
    Terminated,
    /// Needed the kill signal.
    Killed,
    /// Still running after both windows.
    StillAlive,
}

impl StopOutcome {
    pub fn is_stopped(&self) -> bool {
        !matches!(self, StopOutcome::StillAlive)
    }
}

/// Liveness probing and graceful-then-forceful termination by pid.
#[derive(Debug, Clone, Default)]
pub struct ProcessLifecycleManager<S = UnixSignaler> {
    signaler: S,
    timings: LifecycleTimings,
}

impl ProcessLifecycleManager<UnixSignaler> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<S: ProcessSignaler> ProcessLifecycleManager<S> {
    pub fn with_signaler(signaler: S) -> Self {
        Self {
            signaler,
            timings: LifecycleTimings::default(),
        }
    }

    pub fn timings(mut self, timings: LifecycleTimings) -> Self {
        self.timings = timings;
        self
    }

    pub fn signaler(&self) -> &S {
        &self.signaler
    }

    /// Only a definitive "no such process" counts as dead. Any other probe
    /// failure is reported as alive.
    pub fn is_alive(&self, pid: u32) -> bool {
        match self.signaler.probe(pid) {
            SignalDelivery::Delivered => true,
            SignalDelivery::NoSuchProcess => false,
            SignalDelivery::Refused => {
                debug!(pid, "liveness probe refused, assuming alive");
                true
            }
        }
    }

    /// Polls until `pid` is gone or `timeout` elapses. Returns whether it exited.
    pub async fn wait_for_exit(&self, pid: u32, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.is_alive(pid) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            sleep(self.timings.poll_interval.min(deadline - now)).await;
        }
    }

    /// Terminate signal, graceful window, kill signal, forceful window.
    pub async fn stop(&self, pid: u32) -> StopOutcome {
        if !self.is_alive(pid) {
            debug!(pid, "process already exited");
            return StopOutcome::AlreadyExited;
        }

        info!(pid, "sending SIGTERM");
        self.signal(pid, StopSignal::Terminate);
        if self.wait_for_exit(pid, self.timings.graceful_timeout).await {
            return StopOutcome::Terminated;
        }

        warn!(
            pid,
            timeout_ms = self.timings.graceful_timeout.as_millis() as u64,
            "SIGTERM timeout, sending SIGKILL"
        );
        self.signal(pid, StopSignal::Kill);
        if self.wait_for_exit(pid, self.timings.forceful_timeout).await {
            return StopOutcome::Killed;
        }

        warn!(pid, "process survived SIGKILL window");
        StopOutcome::StillAlive
    }

    fn signal(&self, pid: u32, signal: StopSignal) {
        match self.signaler.send(pid, signal) {
            SignalDelivery::Delivered | SignalDelivery::NoSuchProcess => {}
            SignalDelivery::Refused => warn!(pid, ?signal, "signal delivery refused"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Pretends to be a process that dies after receiving `dies_on`.
    struct FakeSignaler {
        alive: Mutex<bool>,
        dies_on: Option<StopSignal>,
        probe_result_when_alive: SignalDelivery,
        sent: Mutex<Vec<StopSignal>>,
    }

    impl FakeSignaler {
        fn new(alive: bool, dies_on: Option<StopSignal>) -> Self {
            Self {
                alive: Mutex::new(alive),
                dies_on,
                probe_result_when_alive: SignalDelivery::Delivered,
                sent: Mutex::new(Vec::new()),
            }
        }

        fn sent(&self) -> Vec<StopSignal> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl ProcessSignaler for FakeSignaler {
        fn probe(&self, _pid: u32) -> SignalDelivery {
            if *self.alive.lock().unwrap() {
                self.probe_result_when_alive
            } else {
                SignalDelivery::NoSuchProcess
            }
        }

        fn send(&self, _pid: u32, signal: StopSignal) -> SignalDelivery {
            self.sent.lock().unwrap().push(signal);
            if self.dies_on == Some(signal) {
                *self.alive.lock().unwrap() = false;
            }
            SignalDelivery::Delivered
        }
    }

    fn fast() -> LifecycleTimings {
        LifecycleTimings {
            poll_interval: Duration::from_millis(5),
            graceful_timeout: Duration::from_millis(50),
            forceful_timeout: Duration::from_millis(30),
        }
    }

    #[test]
    fn test_refused_probe_counts_as_alive() {
        let mut signaler = FakeSignaler::new(true, None);
        signaler.probe_result_when_alive = SignalDelivery::Refused;
        let manager = ProcessLifecycleManager::with_signaler(signaler);
        assert!(manager.is_alive(1234));
    }

    #[tokio::test]
    async fn test_stop_dead_process_sends_nothing() {
        let manager = ProcessLifecycleManager::with_signaler(FakeSignaler::new(false, None))
            .timings(fast());
        assert_eq!(manager.stop(42).await, StopOutcome::AlreadyExited);
        assert!(manager.signaler().sent().is_empty());
    }

    #[tokio::test]
    async fn test_stop_graceful() {
        let manager = ProcessLifecycleManager::with_signaler(FakeSignaler::new(
            true,
            Some(StopSignal::Terminate),
        ))
        .timings(fast());
        assert_eq!(manager.stop(42).await, StopOutcome::Terminated);
        assert_eq!(manager.signaler().sent(), vec![StopSignal::Terminate]);
    }

    #[tokio::test]
    async fn test_stop_escalates_to_kill() {
        let manager =
            ProcessLifecycleManager::with_signaler(FakeSignaler::new(true, Some(StopSignal::Kill)))
                .timings(fast());
        assert_eq!(manager.stop(42).await, StopOutcome::Killed);
        assert_eq!(
            manager.signaler().sent(),
            vec![StopSignal::Terminate, StopSignal::Kill]
        );
    }

    #[tokio::test]
    async fn test_stop_reports_survivor() {
        let manager = ProcessLifecycleManager::with_signaler(FakeSignaler::new(true, None))
            .timings(fast());
        let outcome = manager.stop(42).await;
        assert_eq!(outcome, StopOutcome::StillAlive);
        assert!(!outcome.is_stopped());
    }

    #[tokio::test]
    async fn test_wait_for_exit_times_out() {
        let manager = ProcessLifecycleManager::with_signaler(FakeSignaler::new(true, None))
            .timings(fast());
        let started = std::time::Instant::now();
        assert!(!manager.wait_for_exit(42, Duration::from_millis(40)).await);
        assert!(started.elapsed() >= Duration::from_millis(40));
    }

    #[cfg(unix)]
    #[test]
    fn test_unix_signaler_rejects_group_targets() {
        assert_eq!(UnixSignaler.probe(0), SignalDelivery::NoSuchProcess);
        assert_eq!(UnixSignaler.probe(u32::MAX), SignalDelivery::NoSuchProcess);
    }

    #[cfg(unix)]
    #[test]
    fn test_unix_signaler_sees_own_process() {
        assert!(ProcessLifecycleManager::new().is_alive(std::process::id()));
    }
}
