// Runner: dispatches parsed commands and wires the launch collaborators
// (driver, provisioner, supervisor, controller, trigger sources) together.

use anyhow::Result;
use cml_common::constants::return_code;
use cml_common::{
    create_driver, HostContext, Provisioner, RunnerDriver, TerraformProvisioner, Tracing,
};
use cml_sdk::TraceWriter;
use std::sync::Arc;

use crate::command_settings::{Command, CommandSettings, LaunchSettings, RunnerSubcommand};
use crate::controller::RunnerController;
use crate::lifecycle::LaunchStatus;
use crate::runner_config::RunnerConfig;
use crate::supervisor::ProcessSupervisor;
use crate::triggers;

pub struct Runner {
    context: Arc<HostContext>,
    trace: Tracing,
}

impl Runner {
    pub fn new(context: Arc<HostContext>) -> Self {
        let trace = context.get_trace("Runner");
        Self { context, trace }
    }

    /// Run the parsed command. Returns the process exit code.
    pub async fn execute_command(&self, settings: CommandSettings) -> Result<i32> {
        match settings.command {
            Command::Runner(runner) => match runner.command {
                RunnerSubcommand::Launch(launch) => self.launch(&launch).await,
            },
        }
    }

    async fn launch(&self, settings: &LaunchSettings) -> Result<i32> {
        for secret in [&settings.token, &settings.cloud_ssh_private].into_iter().flatten() {
            self.context.secret_masker.add_value(secret);
        }

        let config = match RunnerConfig::from_settings(
            settings,
            HostContext::sensitive_env_from_environment(),
        ) {
            Ok(config) => config,
            Err(e) => {
                self.trace.error(&e.to_string());
                return Ok(return_code::TERMINATED_ERROR);
            }
        };

        let driver = match create_driver(
            config.driver,
            &config.repo,
            &config.token,
            self.context.http_client().clone(),
            Arc::new(self.context.get_trace("Driver")),
        ) {
            Ok(driver) => driver,
            Err(e) => {
                self.trace.error_chain(&e);
                return Ok(return_code::TERMINATED_ERROR);
            }
        };

        let provisioner: Arc<dyn Provisioner> = Arc::new(TerraformProvisioner::new(
            config.workdir.clone(),
            config.provider_version.clone(),
            Arc::new(self.context.get_trace("Terraform")),
            self.context.process_token(),
        ));
        Ok(self.run_controller(config, driver, provisioner).await)
    }

    async fn run_controller(
        &self,
        config: RunnerConfig,
        driver: Arc<dyn RunnerDriver>,
        provisioner: Arc<dyn Provisioner>,
    ) -> i32 {
        self.trace.info(&format!(
            "Launching {} runner '{}' with labels {}",
            driver.kind(),
            config.name,
            config.labels.join(",")
        ));

        let supervisor = Arc::new(ProcessSupervisor::new(
            self.context.clone(),
            driver.clone(),
            provisioner.clone(),
        ));
        let controller = RunnerController::new(
            config,
            driver,
            supervisor,
            provisioner,
            self.context.get_trace("RunnerController"),
        );
        triggers::install(
            &controller.shutdown_handle(),
            &self.context.get_trace("Triggers"),
            &self.context.process_token(),
        );

        let result = controller.run().await;
        self.context.cancel_background_tasks();

        match result {
            Ok(outcome) => {
                match outcome.status {
                    LaunchStatus::Reused => self.trace.info("Existing runner reused; nothing launched"),
                    LaunchStatus::Provisioned => {
                        for instance in &outcome.instances {
                            self.trace.info(&format!(
                                "Runner instance {} provisioned{}",
                                instance.id,
                                instance
                                    .instance_ip
                                    .as_deref()
                                    .map(|ip| format!(" at {ip}"))
                                    .unwrap_or_default()
                            ));
                        }
                    }
                    LaunchStatus::Terminated => {
                        if let Some(reason) = &outcome.reason {
                            self.trace.info(&format!("Runner terminated ({reason})"));
                        }
                    }
                }
                outcome.exit_code()
            }
            Err(e) => {
                self.trace.error(&e.to_string());
                return_code::TERMINATED_ERROR
            }
        }
    }
}
