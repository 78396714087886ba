use crate::trace::TraceWriter;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// The duration to wait after sending SIGINT before escalating to SIGTERM.
const SIGINT_TIMEOUT: Duration = Duration::from_millis(7500);
/// The duration to wait after sending SIGTERM before escalating to SIGKILL.
const SIGTERM_TIMEOUT: Duration = Duration::from_millis(2500);

/// Error type for non-zero process exit codes.
#[derive(Debug, thiserror::Error)]
#[error("Exit code {exit_code} returned from process: file name '{file_name}', arguments '{arguments}'.")]
pub struct ProcessExitCodeError {
    pub exit_code: i32,
    pub file_name: String,
    pub arguments: String,
}

/// Error returned when the process was stopped through its cancellation token.
#[derive(Debug, thiserror::Error)]
#[error("Process '{file_name}' was cancelled and exited with code {exit_code}.")]
pub struct ProcessCancelledError {
    pub exit_code: i32,
    pub file_name: String,
}

/// Something observed on a running child process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    /// The process was spawned with the given PID.
    Started { pid: u32 },
    /// A line was written to stdout.
    Stdout(String),
    /// A line was written to stderr.
    Stderr(String),
}

impl ProcessEvent {
    /// The output line carried by this event, if any.
    pub fn line(&self) -> Option<&str> {
        match self {
            ProcessEvent::Stdout(line) | ProcessEvent::Stderr(line) => Some(line),
            ProcessEvent::Started { .. } => None,
        }
    }
}

/// Everything needed to start a child process.
#[derive(Debug, Clone, Default)]
pub struct ProcessStartInfo {
    pub file_name: String,
    pub arguments: Vec<String>,
    pub working_directory: Option<PathBuf>,
    /// Variables set on top of the inherited (or cleared) environment.
    pub environment: HashMap<String, String>,
    /// Start from an empty environment instead of inheriting the parent's.
    pub clear_environment: bool,
    pub require_exit_code_zero: bool,
    /// Skip the SIGINT/SIGTERM grace steps and kill straight away on cancel.
    pub kill_process_on_cancel: bool,
}

impl ProcessStartInfo {
    pub fn new<I, S>(file_name: impl Into<String>, arguments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            file_name: file_name.into(),
            arguments: arguments.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    pub fn environment(mut self, environment: HashMap<String, String>) -> Self {
        self.environment = environment;
        self
    }

    pub fn clear_environment(mut self, clear: bool) -> Self {
        self.clear_environment = clear;
        self
    }

    pub fn require_exit_code_zero(mut self, require: bool) -> Self {
        self.require_exit_code_zero = require;
        self
    }

    fn display_arguments(&self) -> String {
        self.arguments.join(" ")
    }
}

/// Spawns a child process, streams stdout/stderr lines through a channel,
/// supports graceful cancellation (SIGINT → SIGTERM → SIGKILL) and reports
/// the exit code.
pub struct ProcessInvoker {
    trace: Arc<dyn TraceWriter>,
    events_tx: mpsc::UnboundedSender<ProcessEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<ProcessEvent>>,
}

impl ProcessInvoker {
    /// Create a new `ProcessInvoker` with the given trace writer.
    pub fn new(trace: Arc<dyn TraceWriter>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            trace,
            events_tx,
            events_rx: Some(events_rx),
        }
    }

    /// Take the event receiver. Can only be called once; subsequent calls return `None`.
    ///
    /// The channel closes once the invoker is dropped and both output
    /// streams have been drained.
    pub fn take_event_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<ProcessEvent>> {
        self.events_rx.take()
    }

    /// Run a process to completion and return its exit code.
    pub async fn execute(
        &self,
        info: &ProcessStartInfo,
        cancellation_token: CancellationToken,
    ) -> Result<i32> {
        if info.file_name.is_empty() {
            anyhow::bail!("file_name must not be empty");
        }

        self.trace.info("Starting process:");
        self.trace.info(&format!("  File name: '{}'", info.file_name));
        self.trace
            .info(&format!("  Arguments: '{}'", info.display_arguments()));
        if let Some(ref dir) = info.working_directory {
            self.trace
                .info(&format!("  Working directory: '{}'", dir.display()));
        }
        self.trace.verbose(&format!(
            "  Require exit code zero: '{}'",
            info.require_exit_code_zero
        ));

        let mut cmd = Command::new(&info.file_name);
        cmd.args(&info.arguments);

        if let Some(ref dir) = info.working_directory {
            if dir.is_dir() {
                cmd.current_dir(dir);
            }
        }

        if info.clear_environment {
            cmd.env_clear();
        }
        cmd.envs(&info.environment);

        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.stdin(std::process::Stdio::null());

        let start = std::time::Instant::now();
        let mut child = cmd.spawn().with_context(|| {
            format!(
                "Failed to start process '{}' with arguments '{}'",
                info.file_name,
                info.display_arguments()
            )
        })?;

        let pid = child.id().unwrap_or(0);
        let _ = self.events_tx.send(ProcessEvent::Started { pid });
        self.trace.info(&format!(
            "Process started with process id {pid}, waiting for process exit."
        ));

        let stdout_task = child.stdout.take().map(|stdout| {
            self.spawn_reader(stdout, ProcessEvent::Stdout, "STDOUT")
        });
        let stderr_task = child.stderr.take().map(|stderr| {
            self.spawn_reader(stderr, ProcessEvent::Stderr, "STDERR")
        });

        let exit_code: i32;
        let was_cancelled;

        tokio::select! {
            status = child.wait() => {
                was_cancelled = false;
                let status = status.context("Failed to wait for process")?;
                exit_code = status.code().unwrap_or(-1);
            }
            _ = cancellation_token.cancelled() => {
                was_cancelled = true;
                self.trace.info("Cancellation requested.");
                exit_code = self
                    .cancel_and_kill_process(&mut child, info.kill_process_on_cancel)
                    .await;
            }
        }

        if let Some(task) = stdout_task {
            let _ = task.await;
        }
        if let Some(task) = stderr_task {
            let _ = task.await;
        }

        let elapsed = start.elapsed();
        self.trace.info(&format!(
            "Finished process {pid} with exit code {exit_code}, and elapsed time {elapsed:.2?}."
        ));

        if was_cancelled {
            return Err(ProcessCancelledError {
                exit_code,
                file_name: info.file_name.clone(),
            }
            .into());
        }

        if exit_code != 0 && info.require_exit_code_zero {
            return Err(ProcessExitCodeError {
                exit_code,
                file_name: info.file_name.clone(),
                arguments: info.display_arguments(),
            }
            .into());
        }

        Ok(exit_code)
    }

    /// Run a process that must succeed and return everything it wrote to stdout.
    pub async fn capture_stdout(
        trace: Arc<dyn TraceWriter>,
        info: &ProcessStartInfo,
        cancellation_token: CancellationToken,
    ) -> Result<String> {
        let mut invoker = ProcessInvoker::new(trace);
        let mut rx = invoker
            .take_event_receiver()
            .ok_or_else(|| anyhow::anyhow!("Process event receiver already taken"))?;
        let info = info.clone().require_exit_code_zero(true);

        let collector = tokio::spawn(async move {
            let mut out = String::new();
            while let Some(event) = rx.recv().await {
                if let ProcessEvent::Stdout(line) = event {
                    out.push_str(&line);
                    out.push('\n');
                }
            }
            out
        });

        let result = invoker.execute(&info, cancellation_token).await;
        drop(invoker);
        let stdout = collector.await.unwrap_or_default();
        result.map(|_| stdout)
    }

    fn spawn_reader<R>(
        &self,
        stream: R,
        wrap: fn(String) -> ProcessEvent,
        label: &'static str,
    ) -> tokio::task::JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let tx = self.events_tx.clone();
        let trace = self.trace.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stream).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let _ = tx.send(wrap(line));
            }
            trace.verbose(&format!("{label} stream read finished."));
        })
    }

    /// Attempt graceful cancellation: SIGINT → SIGTERM → SIGKILL.
    /// If `kill_immediately` is true, skip signals and go straight to kill.
    async fn cancel_and_kill_process(
        &self,
        child: &mut tokio::process::Child,
        kill_immediately: bool,
    ) -> i32 {
        if !kill_immediately {
            if self.send_signal_and_wait(child, Signal::Int, SIGINT_TIMEOUT).await {
                self.trace.info("Process cancelled successfully through SIGINT.");
                return exit_code_of(child).await;
            }

            if self.send_signal_and_wait(child, Signal::Term, SIGTERM_TIMEOUT).await {
                self.trace.info("Process terminated successfully through SIGTERM.");
                return exit_code_of(child).await;
            }
        }

        self.trace.info(
            "Kill entire process tree since both cancel and terminate signals have been ignored.",
        );
        let _ = child.kill().await;
        exit_code_of(child).await
    }

    /// Send a signal to the child process and wait up to `timeout` for it to exit.
    /// Returns `true` if the process exited within the timeout.
    #[cfg(unix)]
    async fn send_signal_and_wait(
        &self,
        child: &mut tokio::process::Child,
        signal: Signal,
        timeout: Duration,
    ) -> bool {
        let Some(pid) = child.id() else {
            // Already reaped.
            return true;
        };

        let sig = match signal {
            Signal::Int => nix::sys::signal::Signal::SIGINT,
            Signal::Term => nix::sys::signal::Signal::SIGTERM,
        };

        self.trace.info(&format!("Sending {sig:?} to process {pid}."));

        let send_result = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), sig);
        if send_result.is_err() {
            self.trace
                .info(&format!("{sig:?} signal failed to send to process {pid}."));
            return false;
        }

        tokio::select! {
            result = child.wait() => result.is_ok(),
            _ = tokio::time::sleep(timeout) => {
                self.trace.info(&format!(
                    "Process did not honor {sig:?} within {:.1}s.",
                    timeout.as_secs_f64()
                ));
                false
            }
        }
    }

    #[cfg(not(unix))]
    async fn send_signal_and_wait(
        &self,
        child: &mut tokio::process::Child,
        _signal: Signal,
        timeout: Duration,
    ) -> bool {
        tokio::select! {
            result = child.wait() => result.is_ok(),
            _ = tokio::time::sleep(timeout) => false,
        }
    }
}

async fn exit_code_of(child: &mut tokio::process::Child) -> i32 {
    child
        .wait()
        .await
        .map(|s| s.code().unwrap_or(-1))
        .unwrap_or(-1)
}

/// Internal signal type for cross-platform abstraction.
#[derive(Debug, Clone, Copy)]
enum Signal {
    Int,
    Term,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::{CollectingTraceWriter, NullTraceWriter, TraceLevel};

    fn make_invoker() -> ProcessInvoker {
        ProcessInvoker::new(Arc::new(NullTraceWriter))
    }

    #[tokio::test]
    async fn execute_streams_stdout_and_reports_pid() {
        let mut invoker = make_invoker();
        let mut rx = invoker.take_event_receiver().unwrap();
        let info = ProcessStartInfo::new("sh", ["-c", "echo hello; echo oops >&2"]);

        let handle =
            tokio::spawn(async move { invoker.execute(&info, CancellationToken::new()).await });

        let mut events = Vec::new();
        while let Some(evt) = rx.recv().await {
            events.push(evt);
        }

        assert_eq!(handle.await.unwrap().unwrap(), 0);
        assert!(matches!(events[0], ProcessEvent::Started { .. }));
        assert!(events.contains(&ProcessEvent::Stdout("hello".into())));
        assert!(events.contains(&ProcessEvent::Stderr("oops".into())));
    }

    #[tokio::test]
    async fn execute_nonexistent() {
        let invoker = make_invoker();
        let info = ProcessStartInfo::new("nonexistent_command_xyz_123", Vec::<String>::new());
        let result = invoker.execute(&info, CancellationToken::new()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn execute_require_exit_code_zero() {
        let invoker = make_invoker();
        let info = ProcessStartInfo::new("false", Vec::<String>::new()).require_exit_code_zero(true);
        let err = invoker
            .execute(&info, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<ProcessExitCodeError>().is_some());
        assert!(err.to_string().contains("Exit code"));
    }

    #[tokio::test]
    async fn execute_with_cleared_environment() {
        let mut env = HashMap::new();
        env.insert("CML_TEST_VAR".to_string(), "kept".to_string());
        std::env::set_var("CML_TEST_DROPPED", "dropped");

        let info = ProcessStartInfo::new("/bin/sh", ["-c", "echo ${CML_TEST_VAR}-${CML_TEST_DROPPED}"])
            .environment(env)
            .clear_environment(true);
        let out = ProcessInvoker::capture_stdout(
            Arc::new(NullTraceWriter),
            &info,
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(out.trim(), "kept-");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancellation_stops_process() {
        let trace = Arc::new(CollectingTraceWriter::new());
        let invoker = ProcessInvoker::new(trace.clone());
        let cancel = CancellationToken::new();
        let info = ProcessStartInfo::new("sleep", ["30"]);

        let token = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            token.cancel();
        });

        let err = invoker.execute(&info, cancel).await.unwrap_err();
        assert!(err.downcast_ref::<ProcessCancelledError>().is_some());
        assert!(trace.contains(TraceLevel::Info, "Cancellation requested."));
        assert!(trace.contains(TraceLevel::Info, "through SIGINT"));
    }
}
