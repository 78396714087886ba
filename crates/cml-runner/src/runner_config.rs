// RunnerConfig: the launch configuration, resolved once from the command
// line and never mutated afterwards.

use crate::command_settings::LaunchSettings;
use cml_common::constants::{defaults, variables};
use cml_common::{CloudRunnerSpec, DriverKind};
use cml_sdk::{IOUtil, StringUtil};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Errors that stop a launch before (or while) anything is started.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("Runner name {0} is already in use. Please change the name or terminate the existing runner.")]
    NameInUse(String),

    #[error("{0}")]
    Unsupported(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed preparing runner: {0:#}")]
    Preparing(anyhow::Error),
}

/// Cloud parameters; present only when `--cloud` was given.
#[derive(Debug, Clone, Default)]
pub struct CloudConfig {
    pub provider: String,
    pub region: String,
    pub instance_type: Option<String>,
    pub permission_set: Option<String>,
    pub metadata: BTreeMap<String, String>,
    pub gpu: Option<String>,
    pub hdd_size: Option<u32>,
    pub image: Option<String>,
    pub ssh_private: Option<String>,
    pub spot: bool,
    pub spot_price: f64,
    pub startup_script: Option<String>,
    pub aws_security_group: Option<String>,
    pub aws_subnet: Option<String>,
    pub kubernetes_node_selector: BTreeMap<String, String>,
    pub provider_version: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RunnerConfig {
    pub name: String,
    pub labels: Vec<String>,
    /// `None` disables the idle timeout.
    pub idle_timeout: Option<Duration>,
    pub single: bool,
    pub reuse: bool,
    pub reuse_idle: bool,
    pub no_retry: bool,
    /// Running on (or provisioning) a spot instance. Kept outside
    /// `cloud` because the instance itself launches without `--cloud`.
    pub spot: bool,
    pub docker_volumes: Vec<String>,
    /// Inferred from `repo` when `None`.
    pub driver: Option<DriverKind>,
    pub repo: String,
    pub token: String,
    pub workdir: PathBuf,
    pub destroy_delay: Duration,
    /// Base64 resource of the instance this runner lives on.
    pub tf_resource: Option<String>,
    pub cloud: Option<CloudConfig>,
    /// Provider version constraint used for Terraform, local or cloud.
    pub provider_version: Option<String>,
    pub sensitive_env: Vec<String>,
}

impl RunnerConfig {
    pub fn from_settings(
        settings: &LaunchSettings,
        sensitive_env: Vec<String>,
    ) -> Result<Self, LaunchError> {
        let invalid = |e: anyhow::Error| LaunchError::InvalidConfig(format!("{e:#}"));

        let name = settings
            .name
            .clone()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(generate_name);

        let idle_timeout = StringUtil::parse_timeout(&settings.idle_timeout).map_err(invalid)?;
        let driver = settings
            .driver
            .as_deref()
            .map(str::parse::<DriverKind>)
            .transpose()
            .map_err(invalid)?;

        let workdir = match settings.workdir.as_deref() {
            Some(dir) if !dir.trim().is_empty() => PathBuf::from(dir),
            _ => IOUtil::home_dir().join(defaults::WORKDIR_BASE).join(&name),
        };

        let cloud = match settings.cloud.as_deref().filter(|c| !c.trim().is_empty()) {
            Some(provider) => Some(CloudConfig {
                provider: provider.to_string(),
                region: settings.cloud_region.clone(),
                instance_type: settings.cloud_type.clone(),
                permission_set: settings.cloud_permission_set.clone(),
                metadata: parse_key_values(&settings.cloud_metadata)?,
                gpu: settings.cloud_gpu.clone(),
                hdd_size: settings.cloud_hdd_size,
                image: settings.cloud_image.clone(),
                ssh_private: settings.cloud_ssh_private.clone(),
                spot: settings.cloud_spot,
                spot_price: settings.cloud_spot_price,
                startup_script: settings.cloud_startup_script.clone(),
                aws_security_group: settings.cloud_aws_security_group.clone(),
                aws_subnet: settings.cloud_aws_subnet.clone(),
                kubernetes_node_selector: parse_key_values(
                    &settings.cloud_kubernetes_node_selector,
                )?,
                provider_version: settings.tpi_version.clone(),
            }),
            None => None,
        };

        let config = Self {
            name,
            labels: StringUtil::split_list(&settings.labels),
            idle_timeout,
            single: settings.single,
            reuse: settings.reuse,
            reuse_idle: settings.reuse_idle,
            no_retry: settings.no_retry,
            spot: settings.cloud_spot,
            docker_volumes: settings.docker_volumes.clone(),
            driver,
            repo: settings.repo.clone().unwrap_or_default(),
            token: settings.token.clone().unwrap_or_default(),
            workdir,
            destroy_delay: Duration::from_secs(settings.destroy_delay),
            tf_resource: settings.tf_resource.clone().filter(|r| !r.trim().is_empty()),
            cloud,
            provider_version: settings.tpi_version.clone(),
            sensitive_env,
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks that hold regardless of how the config was built.
    pub fn validate(&self) -> Result<(), LaunchError> {
        let exclusive = [self.single, self.reuse, self.reuse_idle]
            .iter()
            .filter(|f| **f)
            .count();
        if exclusive > 1 {
            return Err(LaunchError::InvalidConfig(
                "--single, --reuse and --reuse-idle are mutually exclusive".to_string(),
            ));
        }
        if self.repo.trim().is_empty() {
            return Err(LaunchError::InvalidConfig(
                "--repo is required".to_string(),
            ));
        }
        if self.token.trim().is_empty() {
            return Err(LaunchError::InvalidConfig(format!(
                "--token (or {}) is required",
                variables::REPO_TOKEN
            )));
        }
        if self.labels.is_empty() {
            return Err(LaunchError::InvalidConfig(
                "at least one label is required".to_string(),
            ));
        }
        Ok(())
    }

    pub fn is_cloud(&self) -> bool {
        self.cloud.is_some()
    }

    /// Job ids can only be resolved out of band for spot instances.
    pub fn cloud_spot(&self) -> bool {
        self.spot
    }

    /// The declarative spec handed to the provisioner. The instance runs
    /// `cml runner launch` itself with these values.
    pub fn cloud_spec(&self) -> Option<CloudRunnerSpec> {
        let cloud = self.cloud.as_ref()?;
        Some(CloudRunnerSpec {
            name: self.name.clone(),
            labels: self.labels.clone(),
            idle_timeout: self.idle_timeout.map(|d| d.as_secs()),
            single: self.single,
            repo: self.repo.clone(),
            token: self.token.clone(),
            driver: self.driver,
            cloud: cloud.provider.clone(),
            region: cloud.region.clone(),
            instance_type: cloud.instance_type.clone(),
            permission_set: cloud.permission_set.clone(),
            metadata: cloud.metadata.clone(),
            gpu: cloud.gpu.clone(),
            hdd_size: cloud.hdd_size,
            image: cloud.image.clone(),
            ssh_private: cloud.ssh_private.clone(),
            spot: cloud.spot,
            spot_price: cloud.spot_price,
            startup_script: cloud.startup_script.clone(),
            aws_security_group: cloud.aws_security_group.clone(),
            aws_subnet: cloud.aws_subnet.clone(),
            kubernetes_node_selector: cloud.kubernetes_node_selector.clone(),
            docker_volumes: self.docker_volumes.clone(),
            provider_version: cloud.provider_version.clone(),
        })
    }
}

fn generate_name() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("{}{}", defaults::NAME_PREFIX, StringUtil::substring_prefix(&id, 8))
}

fn parse_key_values(items: &[String]) -> Result<BTreeMap<String, String>, LaunchError> {
    let mut map = BTreeMap::new();
    for item in items.iter().filter(|i| !i.trim().is_empty()) {
        let Some((key, value)) = item.split_once('=') else {
            return Err(LaunchError::InvalidConfig(format!(
                "expected key=value, got '{item}'"
            )));
        };
        map.insert(key.trim().to_string(), value.trim().to_string());
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_settings::{Command, CommandSettings, RunnerSubcommand};
    use clap::Parser;

    fn settings(args: &[&str]) -> LaunchSettings {
        let mut argv = vec!["cml", "runner", "launch"];
        argv.extend_from_slice(args);
        match CommandSettings::try_parse_from(argv).unwrap().command {
            Command::Runner(runner) => match runner.command {
                RunnerSubcommand::Launch(launch) => launch,
            },
        }
    }

    fn base() -> Vec<&'static str> {
        vec!["--repo", "https://github.com/o/r", "--token", "t0k"]
    }

    #[test]
    fn defaults_resolve() {
        let config = RunnerConfig::from_settings(&settings(&base()), vec![]).unwrap();
        assert!(config.name.starts_with("cml-"));
        assert_eq!(config.name.len(), 12);
        assert_eq!(config.labels, vec!["cml"]);
        assert_eq!(config.idle_timeout, Some(Duration::from_secs(300)));
        assert_eq!(config.destroy_delay, Duration::from_secs(10));
        assert!(config.workdir.ends_with(format!(".cml/{}", config.name)));
        assert!(!config.is_cloud());
        assert!(config.cloud_spec().is_none());
    }

    #[test]
    fn never_disables_idle_timeout() {
        let mut args = base();
        args.extend(["--idle-timeout", "never", "--labels", "gpu, cml"]);
        let config = RunnerConfig::from_settings(&settings(&args), vec![]).unwrap();
        assert_eq!(config.idle_timeout, None);
        assert_eq!(config.labels, vec!["gpu", "cml"]);
    }

    #[test]
    fn missing_token_is_invalid() {
        let s = settings(&["--repo", "https://github.com/o/r"]);
        let mut s = s;
        s.token = None;
        let err = RunnerConfig::from_settings(&s, vec![]).unwrap_err();
        assert!(matches!(err, LaunchError::InvalidConfig(_)));
    }

    #[test]
    fn exclusive_flags_rejected_at_runtime() {
        let config = RunnerConfig {
            repo: "r".into(),
            token: "t".into(),
            labels: vec!["cml".into()],
            single: true,
            reuse_idle: true,
            ..RunnerConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("mutually exclusive"));
    }

    #[test]
    fn cloud_spec_carries_spot_and_metadata() {
        let mut args = base();
        args.extend([
            "--cloud",
            "aws",
            "--cloud-spot",
            "--cloud-metadata",
            "team=ml",
            "--cloud-kubernetes-node-selector",
            "accelerator=nvidia",
            "--driver",
            "github",
        ]);
        let config = RunnerConfig::from_settings(&settings(&args), vec![]).unwrap();
        assert!(config.cloud_spot());
        let spec = config.cloud_spec().unwrap();
        assert_eq!(spec.cloud, "aws");
        assert_eq!(spec.region, "us-west");
        assert_eq!(spec.idle_timeout, Some(300));
        assert_eq!(spec.driver, Some(DriverKind::GitHub));
        assert_eq!(spec.metadata.get("team").map(String::as_str), Some("ml"));
        assert_eq!(
            spec.kubernetes_node_selector.get("accelerator").map(String::as_str),
            Some("nvidia")
        );
    }

    #[test]
    fn bad_metadata_and_driver_rejected() {
        let mut args = base();
        args.extend(["--cloud", "aws", "--cloud-metadata", "novalue"]);
        assert!(RunnerConfig::from_settings(&settings(&args), vec![]).is_err());

        let mut args = base();
        args.extend(["--driver", "jenkins"]);
        assert!(RunnerConfig::from_settings(&settings(&args), vec![]).is_err());
    }

    #[test]
    fn preparing_error_keeps_cause_chain() {
        let err = LaunchError::Preparing(anyhow::anyhow!("inner").context("outer"));
        assert_eq!(err.to_string(), "Failed preparing runner: outer: inner");
    }
}
