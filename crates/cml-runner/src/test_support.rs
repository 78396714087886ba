// In-memory driver and provisioner shared by the controller and supervisor tests.

use anyhow::Result;
use async_trait::async_trait;
use cml_common::{
    CloudInstanceDescriptor, CloudRunnerSpec, DriverCapabilities, DriverKind, JobRecord,
    JobStatus, LaunchRequest, LogPatterns, Provisioner, RegisterRunnerRequest, RunnerCommand,
    RunnerDriver, RunnerInfo, RunnerRegistration,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

pub(crate) struct FakeDriver {
    pub(crate) capabilities: DriverCapabilities,
    pub(crate) runners: Vec<RunnerInfo>,
    /// Unregister fails with "is still running a job" this many times.
    pub(crate) busy_unregisters: AtomicUsize,
    pub(crate) unregisters: AtomicUsize,
    pub(crate) reruns: Mutex<Vec<(Option<String>, Option<String>)>>,
    /// Returned by `prepare_runner`; preparing fails without one.
    pub(crate) command: Option<RunnerCommand>,
    patterns: LogPatterns,
}

impl FakeDriver {
    pub(crate) fn new() -> Self {
        Self {
            capabilities: DriverCapabilities {
                supports_reuse_idle: true,
                ..DriverCapabilities::default()
            },
            runners: Vec::new(),
            busy_unregisters: AtomicUsize::new(0),
            unregisters: AtomicUsize::new(0),
            reruns: Mutex::new(Vec::new()),
            command: None,
            patterns: LogPatterns::new(
                "Listening for Jobs",
                "Running job",
                "completed with result",
                "completed with result: Succeeded",
                Some(r"Running job: (\S+)"),
                None,
            )
            .unwrap(),
        }
    }
}

#[async_trait]
impl RunnerDriver for FakeDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::GitHub
    }
    fn repo(&self) -> &str {
        "https://github.com/iterative/cml"
    }
    fn capabilities(&self) -> DriverCapabilities {
        self.capabilities
    }
    async fn runner_token(&self) -> Result<String> {
        Ok("token".to_string())
    }
    async fn register_runner(&self, _: &RegisterRunnerRequest) -> Result<RunnerRegistration> {
        Ok(RunnerRegistration::default())
    }
    async fn unregister_runner(&self, _: &str) -> Result<()> {
        self.unregisters.fetch_add(1, Ordering::SeqCst);
        let busy = self.busy_unregisters.load(Ordering::SeqCst);
        if busy > 0 {
            self.busy_unregisters.store(busy - 1, Ordering::SeqCst);
            anyhow::bail!("Bad request - Runner cml-test is still running a job");
        }
        Ok(())
    }
    async fn runners(&self) -> Result<Vec<RunnerInfo>> {
        Ok(self.runners.clone())
    }
    async fn runner_job(&self, _: &str, _: JobStatus) -> Result<Option<JobRecord>> {
        Ok(None)
    }
    async fn pipeline_rerun(&self, pipeline: Option<&str>, job: Option<&str>) -> Result<()> {
        self.reruns
            .lock()
            .push((pipeline.map(str::to_string), job.map(str::to_string)));
        Ok(())
    }
    fn runner_log_patterns(&self) -> &LogPatterns {
        &self.patterns
    }
    async fn prepare_runner(&self, _: &LaunchRequest) -> Result<RunnerCommand> {
        match &self.command {
            Some(command) => Ok(command.clone()),
            None => anyhow::bail!("no runner command configured"),
        }
    }
}

#[derive(Default)]
pub(crate) struct FakeProvisioner {
    pub(crate) prepared: AtomicUsize,
    pub(crate) destroyed: Mutex<Vec<String>>,
}

#[async_trait]
impl Provisioner for FakeProvisioner {
    async fn apply(&self, _: &CloudRunnerSpec) -> Result<Vec<CloudInstanceDescriptor>> {
        anyhow::bail!("unused")
    }
    async fn prepare_destroy(&self, _: &CloudInstanceDescriptor) -> Result<()> {
        self.prepared.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
    async fn destroy(&self, instance: &CloudInstanceDescriptor) -> Result<()> {
        self.destroyed.lock().push(instance.id.clone());
        Ok(())
    }
}
