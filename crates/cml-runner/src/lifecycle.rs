// Lifecycle primitives owned by the controller: the idle timer, the job
// tracker, shutdown requests and the latch that coalesces them.

use cml_common::{CloudInstanceDescriptor, JobRecord};
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// Controller state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Initializing,
    Starting,
    Running { busy: bool },
    ShuttingDown,
    Terminated,
    Reused,
}

// ---------------------------------------------------------------------------
// Idle timer
// ---------------------------------------------------------------------------

/// Counts idle seconds, one per tick.
#[derive(Debug, Clone)]
pub struct IdleTimer {
    elapsed: u64,
    threshold: Option<u64>,
}

impl IdleTimer {
    /// `None` (or a zero duration) disables the timer.
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            elapsed: 0,
            threshold: timeout.map(|d| d.as_secs()).filter(|s| *s > 0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.threshold.is_some()
    }

    /// Advance one tick. Returns `true` once the idle threshold is reached.
    pub fn tick(&mut self, busy: bool) -> bool {
        if busy {
            self.elapsed = 0;
            return false;
        }
        self.elapsed += 1;
        matches!(self.threshold, Some(threshold) if self.elapsed >= threshold)
    }

    pub fn reset(&mut self) {
        self.elapsed = 0;
    }

    pub fn elapsed(&self) -> u64 {
        self.elapsed
    }

    pub fn threshold(&self) -> Option<u64> {
        self.threshold
    }
}

// ---------------------------------------------------------------------------
// Job tracker
// ---------------------------------------------------------------------------

/// The job currently running on this runner, if any.
///
/// A runner executes one job at a time, so a new start replaces the record
/// and an end clears it. A missed event can never leave it stuck busy.
#[derive(Debug, Clone, Default)]
pub struct JobTracker {
    current: Option<JobRecord>,
}

impl JobTracker {
    pub fn start(&mut self, record: JobRecord) {
        self.current = Some(record);
    }

    pub fn end(&mut self) -> Option<JobRecord> {
        self.current.take()
    }

    pub fn is_busy(&self) -> bool {
        self.current.is_some()
    }

    pub fn current(&self) -> Option<&JobRecord> {
        self.current.as_ref()
    }

    pub fn len(&self) -> usize {
        usize::from(self.current.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.current.is_none()
    }
}

// ---------------------------------------------------------------------------
// Shutdown requests
// ---------------------------------------------------------------------------

/// Why the runner is being shut down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// OS signal, by name (`SIGTERM`).
    Signal(String),
    /// Idle for this many seconds.
    IdleTimeout(u64),
    /// A job ran close to the provider's hard limit.
    JobLimit,
    SingleJob,
    RunnerExited(i32),
    RunnerDisconnected,
    Acpi,
    Panic,
    Error,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::Signal(name) => write!(f, "{name}"),
            ShutdownReason::IdleTimeout(secs) => write!(f, "timeout:{secs}"),
            ShutdownReason::JobLimit => write!(f, "{}", cml_common::constants::GITHUB_JOB_LIMIT_REASON),
            ShutdownReason::SingleJob => write!(f, "single job"),
            ShutdownReason::RunnerExited(code) => write!(f, "runner closed with exit code {code}"),
            ShutdownReason::RunnerDisconnected => write!(f, "runner disconnected"),
            ShutdownReason::Acpi => write!(f, "ACPI shutdown"),
            ShutdownReason::Panic => write!(f, "panic"),
            ShutdownReason::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug)]
pub struct ShutdownRequest {
    pub reason: ShutdownReason,
    /// Set when the shutdown was caused by a failure; drives exit code 1.
    pub error: Option<anyhow::Error>,
}

impl ShutdownRequest {
    pub fn new(reason: ShutdownReason) -> Self {
        Self { reason, error: None }
    }

    pub fn with_error(reason: ShutdownReason, error: anyhow::Error) -> Self {
        Self {
            reason,
            error: Some(error),
        }
    }
}

/// Cloneable sender for shutdown requests. Usable from signal tasks,
/// the panic hook and the controller itself.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: mpsc::UnboundedSender<ShutdownRequest>,
}

impl ShutdownHandle {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ShutdownRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Returns `false` when the controller is already gone.
    pub fn send(&self, request: ShutdownRequest) -> bool {
        self.tx.send(request).is_ok()
    }

    pub fn request(&self, reason: ShutdownReason) -> bool {
        self.send(ShutdownRequest::new(reason))
    }

    pub fn request_with_error(&self, reason: ShutdownReason, error: anyhow::Error) -> bool {
        self.send(ShutdownRequest::with_error(reason, error))
    }
}

/// Lets exactly one teardown run at a time.
#[derive(Debug, Default)]
pub struct ShutdownLatch {
    engaged: bool,
}

impl ShutdownLatch {
    /// Engage the latch. `false` means a teardown is already in progress.
    pub fn try_engage(&mut self) -> bool {
        if self.engaged {
            return false;
        }
        self.engaged = true;
        true
    }

    pub fn reset(&mut self) {
        self.engaged = false;
    }

    pub fn is_engaged(&self) -> bool {
        self.engaged
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchStatus {
    /// The runner ran and was torn down.
    Terminated,
    /// An existing runner already serves these labels; nothing was started.
    Reused,
    /// Cloud capacity was provisioned; the instance runs the runner itself.
    Provisioned,
}

#[derive(Debug)]
pub struct LaunchOutcome {
    pub status: LaunchStatus,
    pub reason: Option<ShutdownReason>,
    pub error: Option<anyhow::Error>,
    pub instances: Vec<CloudInstanceDescriptor>,
}

impl LaunchOutcome {
    pub fn reused() -> Self {
        Self {
            status: LaunchStatus::Reused,
            reason: None,
            error: None,
            instances: Vec::new(),
        }
    }

    pub fn provisioned(instances: Vec<CloudInstanceDescriptor>) -> Self {
        Self {
            status: LaunchStatus::Provisioned,
            reason: None,
            error: None,
            instances,
        }
    }

    pub fn terminated(request: ShutdownRequest) -> Self {
        Self {
            status: LaunchStatus::Terminated,
            reason: Some(request.reason),
            error: request.error,
            instances: Vec::new(),
        }
    }

    /// 0 for graceful outcomes, 1 when an error caused the shutdown.
    pub fn exit_code(&self) -> i32 {
        if self.error.is_some() {
            cml_common::constants::return_code::TERMINATED_ERROR
        } else {
            cml_common::constants::return_code::SUCCESS
        }
    }
}
