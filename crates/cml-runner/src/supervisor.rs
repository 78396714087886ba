// RunnerSupervisor: starts the provider-native runner, either as a local
// child process or on a cloud instance, and reports what it does as a
// stream of events.

use crate::runner_config::RunnerConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cml_common::constants::defaults;
use cml_common::{
    CloudInstanceDescriptor, HostContext, LaunchRequest, Provisioner, RunnerDriver, Tracing,
};
use cml_sdk::{IOUtil, ProcessCancelledError, ProcessEvent, ProcessInvoker, ProcessStartInfo, TraceWriter};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// What the supervised process reports back.
#[derive(Debug)]
pub enum SupervisorEvent {
    /// One line of stdout or stderr.
    Output(String),
    /// The process is gone. Also sent after a requested stop.
    Exited(i32),
    /// The process could not be run or waited on.
    Failed(anyhow::Error),
}

/// The running runner process. Owned by the controller.
#[derive(Debug)]
pub struct RunnerHandle {
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    /// Cancel to stop the process (SIGINT, then SIGTERM, then SIGKILL).
    pub stop: CancellationToken,
    /// Closed once the process has exited and every line was delivered.
    pub events: mpsc::UnboundedReceiver<SupervisorEvent>,
}

#[async_trait]
pub trait RunnerSupervisor: Send + Sync {
    async fn start_local(&self, config: &RunnerConfig) -> Result<RunnerHandle>;

    async fn start_cloud(&self, config: &RunnerConfig) -> Result<Vec<CloudInstanceDescriptor>>;
}

pub struct ProcessSupervisor {
    context: Arc<HostContext>,
    driver: Arc<dyn RunnerDriver>,
    provisioner: Arc<dyn Provisioner>,
    trace: Tracing,
}

impl ProcessSupervisor {
    pub fn new(
        context: Arc<HostContext>,
        driver: Arc<dyn RunnerDriver>,
        provisioner: Arc<dyn Provisioner>,
    ) -> Self {
        let trace = context.get_trace("ProcessSupervisor");
        Self {
            context,
            driver,
            provisioner,
            trace,
        }
    }
}

#[async_trait]
impl RunnerSupervisor for ProcessSupervisor {
    async fn start_local(&self, config: &RunnerConfig) -> Result<RunnerHandle> {
        IOUtil::ensure_directory(&config.workdir, defaults::WORKDIR_MODE)?;

        self.trace.info(&format!(
            "Preparing {} runner '{}'",
            self.driver.kind(),
            config.name
        ));
        let command = self
            .driver
            .prepare_runner(&LaunchRequest {
                name: config.name.clone(),
                labels: config.labels.clone(),
                workdir: config.workdir.clone(),
                single: config.single,
                idle_timeout: config.idle_timeout,
                docker_volumes: config.docker_volumes.clone(),
            })
            .await?;
        for secret in &command.secrets {
            self.context.secret_masker.add_value(secret);
        }

        let mut environment = filtered_environment(std::env::vars(), &config.sensitive_env);
        environment.extend(command.env);
        let info = ProcessStartInfo::new(command.program, command.args)
            .working_directory(command.working_directory)
            .environment(environment)
            .clear_environment(true);

        let mut invoker = ProcessInvoker::new(Arc::new(self.trace.clone()));
        let mut process_events = invoker
            .take_event_receiver()
            .context("Process event receiver already taken")?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (pid_tx, pid_rx) = oneshot::channel();
        let stop = self.context.process_token().child_token();

        let process_stop = stop.clone();
        tokio::spawn(async move {
            let forward = async {
                let mut pid_tx = Some(pid_tx);
                while let Some(event) = process_events.recv().await {
                    match event {
                        ProcessEvent::Started { pid } => {
                            if let Some(tx) = pid_tx.take() {
                                let _ = tx.send(pid);
                            }
                        }
                        other => {
                            if let Some(line) = other.line() {
                                let _ = events_tx.send(SupervisorEvent::Output(line.to_string()));
                            }
                        }
                    }
                }
            };
            let run = async move {
                let result = invoker.execute(&info, process_stop).await;
                // Closing the invoker's sender lets the forwarder drain and finish.
                drop(invoker);
                result
            };

            let ((), result) = tokio::join!(forward, run);
            let last = match result {
                Ok(code) => SupervisorEvent::Exited(code),
                Err(e) => match e.downcast_ref::<ProcessCancelledError>() {
                    Some(cancelled) => SupervisorEvent::Exited(cancelled.exit_code),
                    None => SupervisorEvent::Failed(e),
                },
            };
            let _ = events_tx.send(last);
        });

        let pid = pid_rx.await.ok();
        Ok(RunnerHandle {
            pid,
            started_at: Utc::now(),
            stop,
            events: events_rx,
        })
    }

    async fn start_cloud(&self, config: &RunnerConfig) -> Result<Vec<CloudInstanceDescriptor>> {
        let spec = config
            .cloud_spec()
            .context("No cloud provider configured")?;
        IOUtil::ensure_directory(&config.workdir, defaults::WORKDIR_MODE)?;

        self.trace.info(&format!(
            "Provisioning runner '{}' on {} ({})",
            spec.name, spec.cloud, spec.region
        ));
        let instances = self.provisioner.apply(&spec).await?;
        for instance in &instances {
            self.trace.info_object(&instance.public_attributes());
        }
        Ok(instances)
    }
}

/// The parent environment minus the variables on the deny list.
pub fn filtered_environment<I>(vars: I, deny: &[String]) -> HashMap<String, String>
where
    I: IntoIterator<Item = (String, String)>,
{
    vars.into_iter()
        .filter(|(key, _)| !deny.iter().any(|d| d == key))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakeDriver, FakeProvisioner};
    use cml_common::RunnerCommand;
    use std::time::Duration;

    fn supervisor_for(command: RunnerCommand) -> ProcessSupervisor {
        let mut driver = FakeDriver::new();
        driver.command = Some(command);
        ProcessSupervisor::new(
            HostContext::for_tests(),
            Arc::new(driver),
            Arc::new(FakeProvisioner::default()),
        )
    }

    fn shell(script: &str, workdir: &std::path::Path) -> RunnerCommand {
        RunnerCommand {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            env: HashMap::new(),
            working_directory: workdir.to_path_buf(),
            secrets: Vec::new(),
        }
    }

    async fn collect(handle: &mut RunnerHandle) -> (Vec<String>, Option<i32>) {
        let mut lines = Vec::new();
        let mut exit = None;
        while let Some(event) = handle.events.recv().await {
            match event {
                SupervisorEvent::Output(line) => lines.push(line),
                SupervisorEvent::Exited(code) => exit = Some(code),
                SupervisorEvent::Failed(e) => panic!("runner failed: {e:#}"),
            }
        }
        (lines, exit)
    }

    #[tokio::test]
    async fn local_runner_streams_lines_then_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var("CML_SUPERVISOR_TEST_SECRET", "leaked");
        let mut command = shell(
            "echo Listening for Jobs; \
             echo \"secret=${CML_SUPERVISOR_TEST_SECRET:-unset} extra=${RUNNER_EXTRA}\"; \
             exit 3",
            dir.path(),
        );
        command.env.insert("RUNNER_EXTRA".to_string(), "1".to_string());
        let config = RunnerConfig {
            name: "cml-test".to_string(),
            workdir: dir.path().join("runner"),
            sensitive_env: vec!["CML_SUPERVISOR_TEST_SECRET".to_string()],
            ..RunnerConfig::default()
        };

        let before = Utc::now();
        let mut handle = supervisor_for(command).start_local(&config).await.unwrap();
        assert!(handle.pid.is_some());
        assert!(handle.started_at >= before);
        assert!(config.workdir.is_dir());

        let (lines, exit) = collect(&mut handle).await;
        assert_eq!(lines, vec!["Listening for Jobs", "secret=unset extra=1"]);
        assert_eq!(exit, Some(3));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stopping_a_local_runner_reports_exit() {
        let dir = tempfile::tempdir().unwrap();
        let config = RunnerConfig {
            name: "cml-test".to_string(),
            workdir: dir.path().join("runner"),
            ..RunnerConfig::default()
        };
        let supervisor = supervisor_for(shell("echo ready; exec sleep 30", dir.path()));

        let mut handle = supervisor.start_local(&config).await.unwrap();
        let first = handle.events.recv().await;
        assert!(matches!(first, Some(SupervisorEvent::Output(ref line)) if line == "ready"));
        handle.stop.cancel();

        let (_, exit) = tokio::time::timeout(Duration::from_secs(15), collect(&mut handle))
            .await
            .unwrap();
        assert!(exit.is_some());
    }

    #[test]
    fn sensitive_variables_are_removed() {
        let vars = vec![
            ("PATH".to_string(), "/usr/bin".to_string()),
            ("REPO_TOKEN".to_string(), "secret".to_string()),
            ("AWS_SECRET_ACCESS_KEY".to_string(), "s3cr3t".to_string()),
        ];
        let deny = vec!["REPO_TOKEN".to_string(), "AWS_SECRET_ACCESS_KEY".to_string()];
        let env = filtered_environment(vars, &deny);
        assert_eq!(env.len(), 1);
        assert_eq!(env.get("PATH").map(String::as_str), Some("/usr/bin"));
    }

    #[test]
    fn empty_deny_list_keeps_everything() {
        let vars = vec![("A".to_string(), "1".to_string())];
        assert_eq!(filtered_environment(vars, &[]).len(), 1);
    }
}
