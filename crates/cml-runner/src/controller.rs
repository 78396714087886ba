// RunnerController: the runner lifecycle state machine.
//
// One task owns all lifecycle state and runs a single select loop over
// supervisor events, the idle tick, the long-job watchdog and shutdown
// requests. Teardown runs inline in that loop, so no transition ever
// interleaves with another.

use crate::lifecycle::{
    ControllerState, IdleTimer, JobTracker, LaunchOutcome, ShutdownHandle, ShutdownLatch,
    ShutdownReason, ShutdownRequest,
};
use crate::runner_config::{LaunchError, RunnerConfig};
use crate::supervisor::{RunnerHandle, RunnerSupervisor, SupervisorEvent};
use chrono::{DateTime, Utc};
use cml_common::constants::{IDLE_TICK, WATCHDOG_TICK};
use cml_common::{
    is_still_running_job, parse_runner_log, resolve_job_identity, CloudInstanceDescriptor,
    EventStatus, JobRecord, LifecycleEvent, Provisioner, RunnerDriver, Tracing,
};
use cml_sdk::TraceWriter;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

/// Upper bound on waiting for the runner process after asking it to stop.
/// The process invoker escalates to SIGKILL well before this.
const STOP_TIMEOUT: Duration = Duration::from_secs(15);

enum Teardown {
    /// The runner is still busy; the controller keeps running.
    Cancelled,
    Completed(LaunchOutcome),
}

pub struct RunnerController {
    config: RunnerConfig,
    driver: Arc<dyn RunnerDriver>,
    supervisor: Arc<dyn RunnerSupervisor>,
    provisioner: Arc<dyn Provisioner>,
    trace: Tracing,

    state: ControllerState,
    idle: IdleTimer,
    jobs: JobTracker,
    latch: ShutdownLatch,
    /// The live runner process; taken once it exits or disconnects.
    handle: Option<RunnerHandle>,
    events_closed: bool,
    /// The instance this runner lives on, destroyed on teardown.
    instance: Option<CloudInstanceDescriptor>,

    shutdown: ShutdownHandle,
    shutdown_rx: mpsc::UnboundedReceiver<ShutdownRequest>,
}

impl RunnerController {
    pub fn new(
        config: RunnerConfig,
        driver: Arc<dyn RunnerDriver>,
        supervisor: Arc<dyn RunnerSupervisor>,
        provisioner: Arc<dyn Provisioner>,
        trace: Tracing,
    ) -> Self {
        let (shutdown, shutdown_rx) = ShutdownHandle::channel();
        Self {
            idle: IdleTimer::new(config.idle_timeout),
            config,
            driver,
            supervisor,
            provisioner,
            trace,
            state: ControllerState::Initializing,
            jobs: JobTracker::default(),
            latch: ShutdownLatch::default(),
            handle: None,
            events_closed: false,
            instance: None,
            shutdown,
            shutdown_rx,
        }
    }

    /// Handle for trigger sources (signals, ACPI, panic hook).
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    /// Launch the runner and drive it until it is torn down.
    ///
    /// Configuration errors are returned before anything is started. Every
    /// failure after that goes through the regular teardown and shows up as
    /// the outcome's error.
    pub async fn run(mut self) -> Result<LaunchOutcome, LaunchError> {
        self.config.validate()?;
        self.check_capabilities()?;

        if self.check_existing_runners().await? {
            self.state = ControllerState::Reused;
            return Ok(LaunchOutcome::reused());
        }

        self.state = ControllerState::Starting;
        match self.start().await {
            Ok(Some(instances)) => {
                self.trace.info(&format!(
                    "Provisioned {} instance(s) for runner '{}'",
                    instances.len(),
                    self.config.name
                ));
                return Ok(LaunchOutcome::provisioned(instances));
            }
            Ok(None) => {
                self.state = ControllerState::Running { busy: false };
                self.idle.reset();
            }
            Err(e) => {
                self.shutdown
                    .request_with_error(ShutdownReason::Error, LaunchError::Preparing(e).into());
            }
        }

        Ok(self.event_loop().await)
    }

    // -----------------------------------------------------------------------
    // Startup
    // -----------------------------------------------------------------------

    fn check_capabilities(&self) -> Result<(), LaunchError> {
        let capabilities = self.driver.capabilities();
        if self.config.reuse_idle && !capabilities.supports_reuse_idle {
            return Err(LaunchError::Unsupported(format!(
                "--reuse-idle is not supported by the {} driver",
                self.driver.kind()
            )));
        }
        if !self.config.docker_volumes.is_empty() && !capabilities.supports_docker_volumes {
            return Err(LaunchError::Unsupported(format!(
                "--docker-volumes is not supported by the {} driver",
                self.driver.kind()
            )));
        }
        Ok(())
    }

    /// `true` when an existing runner makes this launch unnecessary.
    async fn check_existing_runners(&self) -> Result<bool, LaunchError> {
        let runners = self.driver.runners().await.map_err(LaunchError::Preparing)?;

        if self.driver.runner_by_name(&self.config.name, &runners).is_some() {
            if !self.config.reuse {
                return Err(LaunchError::NameInUse(self.config.name.clone()));
            }
            self.trace.info(&format!(
                "Reusing existing runner named {}...",
                self.config.name
            ));
            return Ok(true);
        }

        let matching = self.driver.runners_by_labels(&self.config.labels, &runners);
        if self.config.reuse && matching.iter().any(|r| r.online) {
            self.trace.info(&format!(
                "Reusing existing online runners with the {} labels...",
                self.config.labels.join(",")
            ));
            return Ok(true);
        }

        if self.config.reuse_idle && matching.iter().any(|r| r.online && !r.busy) {
            self.trace.info(&format!(
                "Reusing existing idle runners with the {} labels...",
                self.config.labels.join(",")
            ));
            return Ok(true);
        }

        Ok(false)
    }

    /// Start the runner. Returns the provisioned instances in cloud mode.
    async fn start(&mut self) -> anyhow::Result<Option<Vec<CloudInstanceDescriptor>>> {
        if self.config.is_cloud() {
            let instances = self.supervisor.start_cloud(&self.config).await?;
            return Ok(Some(instances));
        }

        if let Some(encoded) = self.config.tf_resource.as_deref() {
            let instance = CloudInstanceDescriptor::from_tf_resource(encoded)?;
            self.provisioner.prepare_destroy(&instance).await?;
            self.instance = Some(instance);
        }

        let handle = self.supervisor.start_local(&self.config).await?;
        let started_at = handle.started_at.to_rfc3339();
        match handle.pid {
            Some(pid) => self
                .trace
                .info(&format!("Runner started with pid {pid} at {started_at}")),
            None => self.trace.info(&format!("Runner started at {started_at}")),
        }
        self.handle = Some(handle);
        Ok(None)
    }

    // -----------------------------------------------------------------------
    // Event loop
    // -----------------------------------------------------------------------

    async fn event_loop(&mut self) -> LaunchOutcome {
        let mut idle_tick = self.idle.is_enabled().then(|| new_interval(IDLE_TICK));
        let watchdog_limit = self
            .driver
            .capabilities()
            .long_job_watchdog
            .filter(|_| !self.config.no_retry);
        let mut watchdog = watchdog_limit.map(|_| new_interval(WATCHDOG_TICK));

        loop {
            tokio::select! {
                biased;

                request = self.shutdown_rx.recv() => {
                    // The controller holds a sender, so the channel never closes here.
                    let Some(request) = request else { continue };
                    match self.teardown(request).await {
                        Teardown::Completed(outcome) => return outcome,
                        Teardown::Cancelled => {
                            self.discard_pending_requests();
                            for interval in [idle_tick.as_mut(), watchdog.as_mut()].into_iter().flatten() {
                                interval.reset();
                            }
                        }
                    }
                }

                event = next_event(&mut self.handle), if !self.events_closed => {
                    match event {
                        Some(event) => self.handle_supervisor_event(event).await,
                        None => {
                            self.process_ended();
                            self.shutdown.request_with_error(
                                ShutdownReason::RunnerDisconnected,
                                anyhow::anyhow!("Runner process disconnected"),
                            );
                        }
                    }
                }

                _ = tick(&mut idle_tick) => self.on_idle_tick(),

                _ = tick(&mut watchdog) => {
                    if let Some(limit) = watchdog_limit {
                        self.on_watchdog_tick(limit, Utc::now());
                    }
                }
            }
        }
    }

    async fn handle_supervisor_event(&mut self, event: SupervisorEvent) {
        match event {
            SupervisorEvent::Output(line) => {
                self.trace.verbose(&line);
                let events =
                    parse_runner_log(&line, self.driver.runner_log_patterns(), self.driver.repo());
                for mut event in events {
                    resolve_job_identity(
                        &mut event,
                        self.driver.as_ref(),
                        &self.config.name,
                        self.config.cloud_spot(),
                        &self.trace,
                    )
                    .await;
                    self.trace.info_object(&event);
                    self.apply_event(&event);
                }
            }
            SupervisorEvent::Exited(code) => {
                self.process_ended();
                if code == 0 {
                    self.shutdown.request(ShutdownReason::RunnerExited(code));
                } else {
                    self.shutdown.request_with_error(
                        ShutdownReason::RunnerExited(code),
                        anyhow::anyhow!("Runner process exited with code {code}"),
                    );
                }
            }
            SupervisorEvent::Failed(e) => {
                self.process_ended();
                self.shutdown.request_with_error(ShutdownReason::Error, e);
            }
        }
    }

    /// The runner process is gone: there is nothing left to stop, and a
    /// busy provider can no longer hold the shutdown back.
    fn process_ended(&mut self) {
        self.events_closed = true;
        if let Some(handle) = self.handle.take() {
            let uptime = Utc::now().signed_duration_since(handle.started_at);
            self.trace.info(&format!(
                "Runner process ended after {}s",
                uptime.num_seconds()
            ));
        }
    }

    fn apply_event(&mut self, event: &LifecycleEvent) {
        match event.status {
            EventStatus::JobStarted => {
                self.jobs.start(JobRecord {
                    job: event.job.clone(),
                    pipeline: event.pipeline.clone(),
                    date: event.date,
                });
                self.idle.reset();
                self.state = ControllerState::Running { busy: true };
            }
            EventStatus::JobEnded => {
                self.jobs.end();
                self.state = ControllerState::Running { busy: false };
                if self.config.single {
                    self.shutdown.request(ShutdownReason::SingleJob);
                }
            }
            EventStatus::Ready | EventStatus::Terminated => {}
        }
    }

    fn on_idle_tick(&mut self) {
        if self.idle.tick(self.jobs.is_busy()) {
            let seconds = self.idle.threshold().unwrap_or_default();
            self.trace
                .info(&format!("Runner has been idle for {seconds} seconds"));
            self.shutdown.request(ShutdownReason::IdleTimeout(seconds));
        }
    }

    /// Restart the runner before a job hits the provider's hard runtime limit.
    fn on_watchdog_tick(&mut self, limit: Duration, now: DateTime<Utc>) {
        let Some(job) = self.jobs.current() else {
            return;
        };
        let running = now
            .signed_duration_since(job.date)
            .to_std()
            .unwrap_or_default();
        if running >= limit {
            self.trace.warning(&format!(
                "Job {} has been running for {}s, restarting the runner",
                job.job.as_deref().unwrap_or("<unknown>"),
                running.as_secs()
            ));
            self.shutdown.request(ShutdownReason::JobLimit);
        }
    }

    fn discard_pending_requests(&mut self) {
        while let Ok(request) = self.shutdown_rx.try_recv() {
            self.trace.verbose(&format!(
                "Ignoring shutdown request ({}) raised during the cancelled shutdown",
                request.reason
            ));
        }
    }

    // -----------------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------------

    async fn teardown(&mut self, request: ShutdownRequest) -> Teardown {
        if !self.latch.try_engage() {
            self.trace.verbose("Shutdown already in progress");
            return Teardown::Cancelled;
        }
        let previous = self.state;
        self.state = ControllerState::ShuttingDown;

        match &request.error {
            Some(error) => self.trace.error(&format!(
                "Shutting down runner ({}): {error:#}",
                request.reason
            )),
            None => self
                .trace
                .info(&format!("Shutting down runner ({})", request.reason)),
        }
        self.trace
            .info_object(&LifecycleEvent::terminated(self.driver.repo()));

        if !self.config.is_cloud() {
            self.trace
                .info(&format!("Unregistering runner {}...", self.config.name));
            match self.driver.unregister_runner(&self.config.name).await {
                Ok(()) => self.trace.info("Runner unregistered"),
                // Only a live runner process can still be running the job.
                Err(e) if self.handle.is_some() && is_still_running_job(&e) => {
                    self.trace.warning(&format!(
                        "Cancelling shutdown: {e:#}"
                    ));
                    self.latch.reset();
                    self.idle.reset();
                    self.state = match previous {
                        ControllerState::Running { .. } => previous,
                        _ => ControllerState::Running {
                            busy: self.jobs.is_busy(),
                        },
                    };
                    return Teardown::Cancelled;
                }
                Err(e) => self
                    .trace
                    .error(&format!("Failed to unregister runner: {e:#}")),
            }
            self.stop_runner().await;
        }

        if !self.config.no_retry {
            self.rerun_jobs().await;
        }

        if let Some(instance) = self.instance.clone() {
            self.trace.info(&format!(
                "Waiting {} seconds before destroying the instance...",
                self.config.destroy_delay.as_secs()
            ));
            tokio::time::sleep(self.config.destroy_delay).await;
            self.trace
                .info(&format!("Destroying instance {}...", instance.id));
            if let Err(e) = self.provisioner.destroy(&instance).await {
                self.trace
                    .error(&format!("Failed destroying instance {}: {e:#}", instance.id));
            }
        }

        self.state = ControllerState::Terminated;
        Teardown::Completed(LaunchOutcome::terminated(request))
    }

    /// Stop the runner process and wait until it is gone.
    async fn stop_runner(&mut self) {
        let Some(mut handle) = self.handle.take() else {
            return;
        };
        handle.stop.cancel();

        let trace = &self.trace;
        let drain = async {
            while let Some(event) = handle.events.recv().await {
                match event {
                    SupervisorEvent::Output(line) => trace.verbose(&line),
                    SupervisorEvent::Exited(code) => {
                        trace.info(&format!("Runner process exited with code {code}"));
                        break;
                    }
                    SupervisorEvent::Failed(e) => {
                        trace.warning(&format!("Runner process failed: {e:#}"));
                        break;
                    }
                }
            }
        };
        if tokio::time::timeout(STOP_TIMEOUT, drain).await.is_err() {
            self.trace
                .warning("Timed out waiting for the runner process to stop");
        }
    }

    async fn rerun_jobs(&self) {
        let jobs: Vec<JobRecord> = self.jobs.current().cloned().into_iter().collect();
        if jobs.is_empty() {
            return;
        }

        self.trace.info("Still pending jobs, retrying workflow...");
        let reruns = jobs.iter().map(|job| async move {
            let result = self
                .driver
                .pipeline_rerun(job.pipeline.as_deref(), job.job.as_deref())
                .await;
            (job, result)
        });
        for (job, result) in join_all(reruns).await {
            if let Err(e) = result {
                self.trace.error(&format!(
                    "Failed to retry job {}: {e:#}",
                    job.job.as_deref().unwrap_or("<unknown>")
                ));
            }
        }
    }
}

fn new_interval(period: Duration) -> Interval {
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn next_event(handle: &mut Option<RunnerHandle>) -> Option<SupervisorEvent> {
    match handle {
        Some(handle) => handle.events.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::LaunchStatus;
    use crate::test_support::{FakeDriver, FakeProvisioner};
    use anyhow::Result;
    use async_trait::async_trait;
    use base64::Engine;
    use cml_common::constants::WATCHDOG_TICK;
    use cml_common::{HostContext, RunnerInfo};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // -----------------------------------------------------------------------
    // Fakes
    // -----------------------------------------------------------------------

    /// Replays `script` on start. Sends `Exited(0)` once asked to stop,
    /// unless `disconnect` closes the stream right after the script.
    #[derive(Default)]
    struct FakeSupervisor {
        script: Mutex<Vec<SupervisorEvent>>,
        fail: bool,
        disconnect: bool,
        local_starts: AtomicUsize,
        cloud_starts: AtomicUsize,
        senders: Mutex<Vec<mpsc::UnboundedSender<SupervisorEvent>>>,
    }

    impl FakeSupervisor {
        fn with_script(lines: &[&str]) -> Self {
            Self {
                script: Mutex::new(
                    lines
                        .iter()
                        .map(|l| SupervisorEvent::Output(l.to_string()))
                        .collect(),
                ),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl RunnerSupervisor for FakeSupervisor {
        async fn start_local(&self, _: &RunnerConfig) -> Result<RunnerHandle> {
            self.local_starts.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("registration refused");
            }
            let (tx, rx) = mpsc::unbounded_channel();
            for event in self.script.lock().drain(..) {
                tx.send(event)?;
            }
            let stop = tokio_util::sync::CancellationToken::new();
            if !self.disconnect {
                let stopped = stop.clone();
                let exit_tx = tx.clone();
                tokio::spawn(async move {
                    stopped.cancelled().await;
                    let _ = exit_tx.send(SupervisorEvent::Exited(0));
                });
                self.senders.lock().push(tx);
            }
            Ok(RunnerHandle {
                pid: Some(4242),
                started_at: Utc::now(),
                stop,
                events: rx,
            })
        }

        async fn start_cloud(&self, _: &RunnerConfig) -> Result<Vec<CloudInstanceDescriptor>> {
            self.cloud_starts.fetch_add(1, Ordering::SeqCst);
            Ok(vec![CloudInstanceDescriptor::from_tf_resource(&tf_resource())?])
        }
    }

    fn tf_resource() -> String {
        let resource = serde_json::json!({
            "mode": "managed",
            "type": "iterative_cml_runner",
            "name": "runner",
            "provider": "provider[\"registry.terraform.io/iterative/iterative\"]",
            "instances": [{
                "attributes": { "id": "iterative-abc", "instance_ip": "10.0.0.7", "token": "t" }
            }]
        });
        base64::engine::general_purpose::STANDARD.encode(resource.to_string())
    }

    fn config() -> RunnerConfig {
        RunnerConfig {
            name: "cml-test".to_string(),
            labels: vec!["cml".to_string()],
            repo: "https://github.com/iterative/cml".to_string(),
            token: "t0k3n".to_string(),
            idle_timeout: None,
            ..RunnerConfig::default()
        }
    }

    struct Harness {
        driver: Arc<FakeDriver>,
        supervisor: Arc<FakeSupervisor>,
        provisioner: Arc<FakeProvisioner>,
    }

    impl Harness {
        fn new(driver: FakeDriver, supervisor: FakeSupervisor) -> Self {
            Self {
                driver: Arc::new(driver),
                supervisor: Arc::new(supervisor),
                provisioner: Arc::new(FakeProvisioner::default()),
            }
        }

        fn controller(&self, config: RunnerConfig) -> RunnerController {
            RunnerController::new(
                config,
                self.driver.clone(),
                self.supervisor.clone(),
                self.provisioner.clone(),
                HostContext::for_tests().get_trace("RunnerController"),
            )
        }
    }

    fn started_controller(harness: &Harness, config: RunnerConfig) -> RunnerController {
        let mut controller = harness.controller(config);
        let (_tx, rx) = mpsc::unbounded_channel();
        controller.handle = Some(RunnerHandle {
            pid: None,
            started_at: Utc::now(),
            stop: tokio_util::sync::CancellationToken::new(),
            events: rx,
        });
        controller.state = ControllerState::Running { busy: false };
        controller
    }

    fn output(line: &str) -> SupervisorEvent {
        SupervisorEvent::Output(line.to_string())
    }

    // -----------------------------------------------------------------------
    // Event handling
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn job_tracking_never_exceeds_one() {
        let harness = Harness::new(FakeDriver::new(), FakeSupervisor::default());
        let mut controller = started_controller(&harness, config());

        controller.handle_supervisor_event(output("Running job: a")).await;
        controller.handle_supervisor_event(output("Running job: b")).await;
        assert_eq!(controller.jobs.len(), 1);
        assert_eq!(
            controller.jobs.current().and_then(|j| j.job.as_deref()),
            Some("b")
        );
        assert_eq!(controller.state, ControllerState::Running { busy: true });

        controller
            .handle_supervisor_event(output("Job b completed with result: Failed"))
            .await;
        assert_eq!(controller.jobs.len(), 0);
        assert_eq!(controller.state, ControllerState::Running { busy: false });
    }

    #[tokio::test]
    async fn idle_timer_resets_on_job_start_and_holds_while_busy() {
        let harness = Harness::new(FakeDriver::new(), FakeSupervisor::default());
        let mut cfg = config();
        cfg.idle_timeout = Some(Duration::from_secs(100));
        let mut controller = started_controller(&harness, cfg);

        controller.on_idle_tick();
        controller.on_idle_tick();
        assert_eq!(controller.idle.elapsed(), 2);

        controller.handle_supervisor_event(output("Running job: a")).await;
        assert_eq!(controller.idle.elapsed(), 0);
        for _ in 0..5 {
            controller.on_idle_tick();
            assert_eq!(controller.idle.elapsed(), 0);
        }

        controller
            .handle_supervisor_event(output("Job a completed with result: Succeeded"))
            .await;
        controller.on_idle_tick();
        assert_eq!(controller.idle.elapsed(), 1);
    }

    #[tokio::test]
    async fn idle_threshold_requests_timeout_shutdown() {
        let harness = Harness::new(FakeDriver::new(), FakeSupervisor::default());
        let mut cfg = config();
        cfg.idle_timeout = Some(Duration::from_secs(3));
        let mut controller = started_controller(&harness, cfg);

        controller.on_idle_tick();
        controller.on_idle_tick();
        assert!(controller.shutdown_rx.try_recv().is_err());
        controller.on_idle_tick();
        let request = controller.shutdown_rx.try_recv().unwrap();
        assert_eq!(request.reason, ShutdownReason::IdleTimeout(3));
        assert_eq!(request.reason.to_string(), "timeout:3");
    }

    #[tokio::test]
    async fn single_mode_shuts_down_after_job_end() {
        let harness = Harness::new(FakeDriver::new(), FakeSupervisor::default());
        let mut cfg = config();
        cfg.single = true;
        cfg.idle_timeout = Some(Duration::from_secs(100));
        let mut controller = started_controller(&harness, cfg);

        controller.handle_supervisor_event(output("Running job: a")).await;
        assert!(controller.shutdown_rx.try_recv().is_err());
        controller
            .handle_supervisor_event(output("Job a completed with result: Failed"))
            .await;
        let request = controller.shutdown_rx.try_recv().unwrap();
        assert_eq!(request.reason, ShutdownReason::SingleJob);
        assert!(request.error.is_none());
    }

    #[tokio::test]
    async fn watchdog_fires_only_past_the_limit() {
        let harness = Harness::new(FakeDriver::new(), FakeSupervisor::default());
        let mut controller = started_controller(&harness, config());
        let limit = Duration::from_secs(3600);

        controller.on_watchdog_tick(limit, Utc::now());
        assert!(controller.shutdown_rx.try_recv().is_err());

        let started = Utc::now();
        controller.jobs.start(JobRecord {
            job: Some("1".into()),
            pipeline: None,
            date: started,
        });
        controller.on_watchdog_tick(limit, started + chrono::Duration::minutes(30));
        assert!(controller.shutdown_rx.try_recv().is_err());
        controller.on_watchdog_tick(limit, started + chrono::Duration::minutes(61));
        assert_eq!(
            controller.shutdown_rx.try_recv().unwrap().reason,
            ShutdownReason::JobLimit
        );
    }

    // -----------------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn still_running_job_cancels_shutdown() {
        let driver = FakeDriver::new();
        driver.busy_unregisters.store(1, Ordering::SeqCst);
        let harness = Harness::new(driver, FakeSupervisor::default());
        let mut cfg = config();
        cfg.idle_timeout = Some(Duration::from_secs(100));
        let mut controller = started_controller(&harness, cfg);

        controller.handle_supervisor_event(output("Running job: a")).await;
        controller
            .handle_supervisor_event(output("Job a completed with result: Succeeded"))
            .await;
        controller.on_idle_tick();
        controller.on_idle_tick();

        let result = controller
            .teardown(ShutdownRequest::new(ShutdownReason::Signal("SIGTERM".into())))
            .await;
        assert!(matches!(result, Teardown::Cancelled));
        assert!(!controller.latch.is_engaged());
        assert_eq!(controller.idle.elapsed(), 0);
        assert_eq!(controller.state, ControllerState::Running { busy: false });
        assert!(controller.handle.is_some());

        let result = controller
            .teardown(ShutdownRequest::new(ShutdownReason::Signal("SIGTERM".into())))
            .await;
        assert!(matches!(result, Teardown::Completed(_)));
        assert_eq!(controller.state, ControllerState::Terminated);
        assert!(controller.handle.is_none());
        assert_eq!(harness.driver.unregisters.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn exited_runner_releases_its_handle() {
        let harness = Harness::new(FakeDriver::new(), FakeSupervisor::default());
        let mut controller = started_controller(&harness, config());

        controller.handle_supervisor_event(SupervisorEvent::Exited(0)).await;
        assert!(controller.handle.is_none());
        assert!(controller.events_closed);
        let request = controller.shutdown_rx.try_recv().unwrap();
        assert_eq!(request.reason, ShutdownReason::RunnerExited(0));
    }

    #[tokio::test]
    async fn tracked_job_is_rerun_on_shutdown() {
        let harness = Harness::new(FakeDriver::new(), FakeSupervisor::default());
        let mut controller = started_controller(&harness, config());
        controller.handle_supervisor_event(output("Running job: 77")).await;

        let result = controller
            .teardown(ShutdownRequest::new(ShutdownReason::Acpi))
            .await;
        assert!(matches!(result, Teardown::Completed(_)));
        assert_eq!(
            harness.driver.reruns.lock().clone(),
            vec![(None, Some("77".to_string()))]
        );
    }

    #[tokio::test]
    async fn no_retry_suppresses_rerun() {
        let harness = Harness::new(FakeDriver::new(), FakeSupervisor::default());
        let mut cfg = config();
        cfg.no_retry = true;
        let mut controller = started_controller(&harness, cfg);
        controller.handle_supervisor_event(output("Running job: 77")).await;

        let result = controller
            .teardown(ShutdownRequest::new(ShutdownReason::Signal("SIGINT".into())))
            .await;
        assert!(matches!(result, Teardown::Completed(_)));
        assert!(harness.driver.reruns.lock().is_empty());
    }

    // -----------------------------------------------------------------------
    // Full runs
    // -----------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn concurrent_triggers_run_one_teardown() {
        let harness = Harness::new(FakeDriver::new(), FakeSupervisor::with_script(&[]));
        let controller = harness.controller(config());
        let shutdown = controller.shutdown_handle();
        shutdown.request(ShutdownReason::Signal("SIGTERM".into()));
        shutdown.request(ShutdownReason::IdleTimeout(5));
        shutdown.request_with_error(ShutdownReason::RunnerExited(1), anyhow::anyhow!("exit 1"));

        let outcome = controller.run().await.unwrap();
        assert_eq!(outcome.status, LaunchStatus::Terminated);
        assert_eq!(outcome.reason, Some(ShutdownReason::Signal("SIGTERM".into())));
        assert_eq!(outcome.exit_code(), 0);
        assert_eq!(harness.driver.unregisters.load(Ordering::SeqCst), 1);
        assert_eq!(harness.supervisor.local_starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_runner_times_out() {
        let harness = Harness::new(
            FakeDriver::new(),
            FakeSupervisor::with_script(&["2022-06-05 16:25:56Z: Listening for Jobs"]),
        );
        let mut cfg = config();
        cfg.idle_timeout = Some(Duration::from_secs(5));

        let started = Instant::now();
        let outcome = harness.controller(cfg).run().await.unwrap();
        assert_eq!(outcome.reason, Some(ShutdownReason::IdleTimeout(5)));
        assert_eq!(outcome.exit_code(), 0);
        assert!(started.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn single_job_run_ends_after_first_job() {
        let harness = Harness::new(
            FakeDriver::new(),
            FakeSupervisor::with_script(&[
                "Listening for Jobs",
                "Running job: train",
                "Job train completed with result: Succeeded",
            ]),
        );
        let mut cfg = config();
        cfg.single = true;

        let outcome = harness.controller(cfg).run().await.unwrap();
        assert_eq!(outcome.reason, Some(ShutdownReason::SingleJob));
        assert_eq!(outcome.exit_code(), 0);
        assert!(harness.driver.reruns.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn non_zero_runner_exit_is_an_error() {
        let supervisor = FakeSupervisor::default();
        supervisor.script.lock().push(SupervisorEvent::Exited(2));
        let harness = Harness::new(FakeDriver::new(), supervisor);

        let outcome = harness.controller(config()).run().await.unwrap();
        assert_eq!(outcome.reason, Some(ShutdownReason::RunnerExited(2)));
        assert_eq!(outcome.exit_code(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn busy_unregister_after_runner_exit_still_terminates() {
        let driver = FakeDriver::new();
        driver.busy_unregisters.store(1, Ordering::SeqCst);
        let supervisor = FakeSupervisor::default();
        supervisor.script.lock().push(SupervisorEvent::Exited(3));
        let harness = Harness::new(driver, supervisor);

        let outcome = tokio::time::timeout(
            Duration::from_secs(24 * 60 * 60),
            harness.controller(config()).run(),
        )
        .await
        .expect("controller kept running after the runner exited")
        .unwrap();
        assert_eq!(outcome.status, LaunchStatus::Terminated);
        assert_eq!(outcome.reason, Some(ShutdownReason::RunnerExited(3)));
        assert_eq!(outcome.exit_code(), 1);
        assert_eq!(harness.driver.unregisters.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_event_stream_is_a_disconnect() {
        let supervisor = FakeSupervisor {
            disconnect: true,
            ..FakeSupervisor::with_script(&["Listening for Jobs"])
        };
        let harness = Harness::new(FakeDriver::new(), supervisor);

        let outcome = harness.controller(config()).run().await.unwrap();
        assert_eq!(outcome.reason, Some(ShutdownReason::RunnerDisconnected));
        assert_eq!(outcome.exit_code(), 1);
        let message = format!("{:#}", outcome.error.unwrap());
        assert!(message.contains("disconnected"));
        assert_eq!(harness.driver.unregisters.load(Ordering::SeqCst), 1);
    }

    /// Runs one never-ending job against a watchdog that trips immediately,
    /// then sends SIGTERM after a few watchdog periods.
    async fn run_long_job(no_retry: bool) -> (LaunchOutcome, Harness) {
        let mut driver = FakeDriver::new();
        driver.capabilities.long_job_watchdog = Some(Duration::ZERO);
        let harness = Harness::new(driver, FakeSupervisor::with_script(&["Running job: a"]));
        let mut cfg = config();
        cfg.no_retry = no_retry;

        let controller = harness.controller(cfg);
        let shutdown = controller.shutdown_handle();
        tokio::spawn(async move {
            tokio::time::sleep(WATCHDOG_TICK * 3).await;
            shutdown.request(ShutdownReason::Signal("SIGTERM".into()));
        });
        let outcome = controller.run().await.unwrap();
        (outcome, harness)
    }

    #[tokio::test(start_paused = true)]
    async fn watchdog_restarts_long_job() {
        let (outcome, harness) = run_long_job(false).await;
        assert_eq!(outcome.reason, Some(ShutdownReason::JobLimit));
        assert_eq!(outcome.exit_code(), 0);
        assert_eq!(
            harness.driver.reruns.lock().clone(),
            vec![(None, Some("a".to_string()))]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn no_retry_disables_watchdog() {
        let (outcome, harness) = run_long_job(true).await;
        assert_eq!(outcome.reason, Some(ShutdownReason::Signal("SIGTERM".into())));
        assert!(harness.driver.reruns.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn preparing_failure_tears_down_with_error() {
        let supervisor = FakeSupervisor {
            fail: true,
            ..FakeSupervisor::default()
        };
        let harness = Harness::new(FakeDriver::new(), supervisor);
        let mut cfg = config();
        cfg.tf_resource = Some(tf_resource());

        let outcome = harness.controller(cfg).run().await.unwrap();
        assert_eq!(outcome.reason, Some(ShutdownReason::Error));
        assert_eq!(outcome.exit_code(), 1);
        let message = format!("{:#}", outcome.error.unwrap());
        assert!(message.starts_with("Failed preparing runner"));
        assert!(message.contains("registration refused"));
        assert_eq!(harness.provisioner.prepared.load(Ordering::SeqCst), 1);
        assert_eq!(
            harness.provisioner.destroyed.lock().clone(),
            vec!["iterative-abc".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn instance_destroyed_after_delay() {
        let harness = Harness::new(FakeDriver::new(), FakeSupervisor::with_script(&[]));
        let mut cfg = config();
        cfg.tf_resource = Some(tf_resource());
        cfg.destroy_delay = Duration::from_secs(10);
        let controller = harness.controller(cfg);
        controller.shutdown_handle().request(ShutdownReason::Acpi);

        let started = Instant::now();
        let outcome = controller.run().await.unwrap();
        assert_eq!(outcome.exit_code(), 0);
        assert!(started.elapsed() >= Duration::from_secs(10));
        assert_eq!(harness.provisioner.destroyed.lock().len(), 1);
    }

    // -----------------------------------------------------------------------
    // Startup checks
    // -----------------------------------------------------------------------

    fn runner(name: &str, labels: &[&str], online: bool, busy: bool) -> RunnerInfo {
        RunnerInfo {
            id: "1".to_string(),
            name: name.to_string(),
            labels: labels.iter().map(|l| l.to_string()).collect(),
            online,
            busy,
        }
    }

    #[tokio::test]
    async fn duplicate_name_without_reuse_is_rejected() {
        let mut driver = FakeDriver::new();
        driver.runners = vec![runner("cml-test", &["cml"], true, false)];
        let harness = Harness::new(driver, FakeSupervisor::default());

        let err = harness.controller(config()).run().await.unwrap_err();
        assert!(matches!(err, LaunchError::NameInUse(ref name) if name == "cml-test"));
        assert_eq!(harness.supervisor.local_starts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn reuse_idle_short_circuits_on_idle_superset_runner() {
        let mut driver = FakeDriver::new();
        driver.runners = vec![runner("other", &["cml", "gpu"], true, false)];
        let harness = Harness::new(driver, FakeSupervisor::default());
        let mut cfg = config();
        cfg.reuse_idle = true;
        cfg.cloud = Some(crate::runner_config::CloudConfig {
            provider: "aws".into(),
            ..Default::default()
        });

        let outcome = harness.controller(cfg).run().await.unwrap();
        assert_eq!(outcome.status, LaunchStatus::Reused);
        assert_eq!(outcome.exit_code(), 0);
        assert_eq!(harness.supervisor.local_starts.load(Ordering::SeqCst), 0);
        assert_eq!(harness.supervisor.cloud_starts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn reuse_idle_ignores_busy_runners() {
        let mut driver = FakeDriver::new();
        driver.runners = vec![runner("other", &["cml"], true, true)];
        let harness = Harness::new(driver, FakeSupervisor::default());
        let mut cfg = config();
        cfg.reuse_idle = true;
        cfg.cloud = Some(crate::runner_config::CloudConfig {
            provider: "aws".into(),
            ..Default::default()
        });

        let outcome = harness.controller(cfg).run().await.unwrap();
        assert_eq!(outcome.status, LaunchStatus::Provisioned);
        assert_eq!(outcome.instances.len(), 1);
        assert_eq!(harness.supervisor.cloud_starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn reuse_with_same_name_exits_cleanly() {
        let mut driver = FakeDriver::new();
        driver.runners = vec![runner("cml-test", &["other"], false, false)];
        let harness = Harness::new(driver, FakeSupervisor::default());
        let mut cfg = config();
        cfg.reuse = true;

        let outcome = harness.controller(cfg).run().await.unwrap();
        assert_eq!(outcome.status, LaunchStatus::Reused);
    }

    #[tokio::test]
    async fn unsupported_capabilities_fail_before_start() {
        let mut driver = FakeDriver::new();
        driver.capabilities.supports_reuse_idle = false;
        let harness = Harness::new(driver, FakeSupervisor::default());
        let mut cfg = config();
        cfg.reuse_idle = true;
        let err = harness.controller(cfg).run().await.unwrap_err();
        assert!(matches!(err, LaunchError::Unsupported(_)));

        let harness = Harness::new(FakeDriver::new(), FakeSupervisor::default());
        let mut cfg = config();
        cfg.docker_volumes = vec!["/cache:/cache".into()];
        let err = harness.controller(cfg).run().await.unwrap_err();
        assert!(matches!(err, LaunchError::Unsupported(_)));
        assert_eq!(harness.supervisor.local_starts.load(Ordering::SeqCst), 0);
    }
}
