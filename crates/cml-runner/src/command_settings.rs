// CommandSettings: the `cml` command line, parsed with clap. Every launch
// flag can also come from a `CML_RUNNER_*` environment variable.

use clap::{Args, Parser, Subcommand, ValueEnum};
use cml_common::constants::defaults;

#[derive(Debug, Parser)]
#[command(
    name = "cml",
    version = cml_sdk::CmlPackage::VERSION,
    about = "Launch and manage self-hosted CI runners",
    arg_required_else_help = true
)]
pub struct CommandSettings {
    /// Log output format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text, env = "CML_LOG")]
    pub log: LogFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Manage self-hosted runners.
    Runner(RunnerArgs),
}

#[derive(Debug, Args)]
pub struct RunnerArgs {
    #[command(subcommand)]
    pub command: RunnerSubcommand,
}

#[derive(Debug, Subcommand)]
pub enum RunnerSubcommand {
    /// Launch and register a self-hosted runner.
    Launch(LaunchSettings),
}

#[derive(Debug, Clone, Args)]
pub struct LaunchSettings {
    /// Comma-separated runner labels.
    #[arg(long, env = "CML_RUNNER_LABELS", default_value = defaults::LABELS)]
    pub labels: String,

    /// Seconds (or a duration such as "5 minutes") to wait for jobs before
    /// shutting down. "never" or 0 disables it.
    #[arg(long, env = "CML_RUNNER_IDLE_TIMEOUT", default_value = defaults::IDLE_TIMEOUT)]
    pub idle_timeout: String,

    /// Runner name; a random `cml-` name by default.
    #[arg(long, env = "CML_RUNNER_NAME")]
    pub name: Option<String>,

    /// Exit after running a single job.
    #[arg(long, env = "CML_RUNNER_SINGLE", conflicts_with_all = ["reuse", "reuse_idle"])]
    pub single: bool,

    /// Don't launch a new runner if one with the same name or labels exists.
    #[arg(long, env = "CML_RUNNER_REUSE", conflicts_with_all = ["single", "reuse_idle"])]
    pub reuse: bool,

    /// Only launch a new runner if no idle runner with these labels exists.
    #[arg(long, env = "CML_RUNNER_REUSE_IDLE", conflicts_with_all = ["single", "reuse"])]
    pub reuse_idle: bool,

    /// Don't restart jobs interrupted by the runner going away.
    #[arg(long, env = "CML_RUNNER_NO_RETRY")]
    pub no_retry: bool,

    /// CI provider: github, gitlab or bitbucket. Inferred from the repo by default.
    #[arg(long, env = "CML_RUNNER_DRIVER")]
    pub driver: Option<String>,

    /// Repository URL.
    #[arg(long, env = "CML_RUNNER_REPO")]
    pub repo: Option<String>,

    /// Personal or project access token.
    #[arg(long, env = "REPO_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Runner working directory; `~/.cml/<name>` by default.
    #[arg(long, env = "CML_RUNNER_WORKDIR")]
    pub workdir: Option<String>,

    /// Docker volumes to mount into jobs (GitLab only).
    #[arg(long = "docker-volumes", env = "CML_RUNNER_DOCKER_VOLUMES", value_delimiter = ',')]
    pub docker_volumes: Vec<String>,

    /// Cloud provider (aws, azure, gcp, kubernetes). Local runner when absent.
    #[arg(long, env = "CML_RUNNER_CLOUD")]
    pub cloud: Option<String>,

    #[arg(long, env = "CML_RUNNER_CLOUD_REGION", default_value = defaults::CLOUD_REGION)]
    pub cloud_region: String,

    #[arg(long, env = "CML_RUNNER_CLOUD_TYPE")]
    pub cloud_type: Option<String>,

    #[arg(long, env = "CML_RUNNER_CLOUD_PERMISSION_SET")]
    pub cloud_permission_set: Option<String>,

    /// Instance metadata as key=value; repeatable.
    #[arg(long, env = "CML_RUNNER_CLOUD_METADATA", value_delimiter = ',')]
    pub cloud_metadata: Vec<String>,

    #[arg(long, env = "CML_RUNNER_CLOUD_GPU")]
    pub cloud_gpu: Option<String>,

    /// Disk size in GB.
    #[arg(long, env = "CML_RUNNER_CLOUD_HDD_SIZE")]
    pub cloud_hdd_size: Option<u32>,

    #[arg(long, env = "CML_RUNNER_CLOUD_IMAGE")]
    pub cloud_image: Option<String>,

    /// Private SSH key for the instance.
    #[arg(long, env = "CML_RUNNER_CLOUD_SSH_PRIVATE", hide_env_values = true)]
    pub cloud_ssh_private: Option<String>,

    /// Request a spot instance; interrupted jobs are restarted elsewhere.
    #[arg(long, env = "CML_RUNNER_CLOUD_SPOT")]
    pub cloud_spot: bool,

    /// Maximum spot bid; -1 means the on-demand price.
    #[arg(long, env = "CML_RUNNER_CLOUD_SPOT_PRICE", default_value_t = defaults::CLOUD_SPOT_PRICE, allow_negative_numbers = true)]
    pub cloud_spot_price: f64,

    #[arg(long, env = "CML_RUNNER_CLOUD_STARTUP_SCRIPT")]
    pub cloud_startup_script: Option<String>,

    #[arg(long, env = "CML_RUNNER_CLOUD_AWS_SECURITY_GROUP")]
    pub cloud_aws_security_group: Option<String>,

    #[arg(long, env = "CML_RUNNER_CLOUD_AWS_SUBNET")]
    pub cloud_aws_subnet: Option<String>,

    /// Kubernetes node selector as key=value; repeatable.
    #[arg(long, env = "CML_RUNNER_CLOUD_KUBERNETES_NODE_SELECTOR", value_delimiter = ',')]
    pub cloud_kubernetes_node_selector: Vec<String>,

    /// Base64 Terraform resource of the instance this runner lives on.
    #[arg(long, env = "CML_RUNNER_TF_RESOURCE", hide = true)]
    pub tf_resource: Option<String>,

    /// Seconds to wait before destroying the instance, for log collection.
    #[arg(long, env = "CML_RUNNER_DESTROY_DELAY", default_value_t = defaults::DESTROY_DELAY_SECS)]
    pub destroy_delay: u64,

    /// Version constraint for the iterative Terraform provider.
    #[arg(long, env = "CML_RUNNER_TPI_VERSION")]
    pub tpi_version: Option<String>,
}
