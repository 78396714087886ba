// Cloud provisioning through Terraform and the `iterative` provider.
//
// `TerraformProvisioner` renders `main.tf`, shells out to the `terraform`
// binary and reads instances back from `terraform.tfstate`.

use crate::constants::terraform as tf;
use crate::drivers::DriverKind;
use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine;
use cml_sdk::{IOUtil, ProcessInvoker, ProcessStartInfo, TraceWriter, WhichUtil};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Attributes never written to logs.
const SENSITIVE_ATTRIBUTES: &[&str] = &["token", "ssh_private", "startup_script", "repo_token"];

// ---------------------------------------------------------------------------
// Declarative spec
// ---------------------------------------------------------------------------

/// Everything the `iterative_cml_runner` resource needs to start a runner
/// on a fresh instance.
#[derive(Debug, Clone, Default)]
pub struct CloudRunnerSpec {
    pub name: String,
    pub labels: Vec<String>,
    /// Seconds; `None` disables the idle timeout on the instance.
    pub idle_timeout: Option<u64>,
    pub single: bool,
    pub repo: String,
    pub token: String,
    pub driver: Option<DriverKind>,
    pub cloud: String,
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
    pub docker_volumes: Vec<String>,
    /// `iterative` provider version constraint.
    pub provider_version: Option<String>,
}

// ---------------------------------------------------------------------------
// Instance descriptor
// ---------------------------------------------------------------------------

/// One provisioned runner instance.
#[derive(Debug, Clone, PartialEq)]
pub struct CloudInstanceDescriptor {
    pub id: String,
    pub instance_ip: Option<String>,
    pub cloud: Option<String>,
    pub region: Option<String>,
    /// The raw state resource, used for targeted teardown.
    pub resource: StateResource,
}

impl CloudInstanceDescriptor {
    fn from_resource(resource: StateResource) -> Option<Self> {
        let attributes = resource.instances.first()?.attributes.clone();
        let text = |key: &str| {
            attributes
                .get(key)
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        Some(Self {
            id: text("id").unwrap_or_default(),
            instance_ip: text("instance_ip"),
            cloud: text("cloud"),
            region: text("region"),
            resource,
        })
    }

    /// Decode a `--tf-resource` value (base64 encoded resource JSON).
    pub fn from_tf_resource(encoded: &str) -> Result<Self> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .context("tf_resource is not valid base64")?;
        let resource: StateResource =
            serde_json::from_slice(&bytes).context("tf_resource is not a Terraform resource")?;
        Self::from_resource(resource).ok_or_else(|| anyhow::anyhow!("tf_resource has no instances"))
    }

    /// Instance attributes with secrets removed.
    pub fn public_attributes(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut attributes = self
            .resource
            .instances
            .first()
            .map(|i| i.attributes.clone())
            .unwrap_or_default();
        attributes.retain(|key, _| !SENSITIVE_ATTRIBUTES.contains(&key.as_str()));
        attributes
    }

    /// `type.name`, as accepted by `-target`.
    pub fn address(&self) -> String {
        format!("{}.{}", self.resource.resource_type, self.resource.name)
    }
}

// ---------------------------------------------------------------------------
// State file
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateResource {
    #[serde(default = "managed")]
    pub mode: String,
    #[serde(rename = "type")]
    pub resource_type: String,
    pub name: String,
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub instances: Vec<StateInstance>,
}

fn managed() -> String {
    "managed".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateInstance {
    #[serde(default)]
    pub attributes: serde_json::Map<String, serde_json::Value>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// The subset of `terraform.tfstate` this crate reads and writes. Unknown
/// fields are carried through unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerraformState {
    pub version: u32,
    #[serde(default)]
    pub resources: Vec<StateResource>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Default for TerraformState {
    fn default() -> Self {
        let mut extra = serde_json::Map::new();
        extra.insert("serial".to_string(), 1.into());
        extra.insert("lineage".to_string(), uuid::Uuid::new_v4().to_string().into());
        extra.insert("outputs".to_string(), serde_json::json!({}));
        Self {
            version: 4,
            resources: Vec::new(),
            extra,
        }
    }
}

impl TerraformState {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read Terraform state '{}'", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse Terraform state '{}'", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        IOUtil::write_file(path, text)
    }

    /// Every `iterative_cml_runner` instance in the state.
    pub fn runner_instances(&self) -> Vec<CloudInstanceDescriptor> {
        self.resources
            .iter()
            .filter(|r| r.resource_type == tf::RESOURCE_TYPE)
            .cloned()
            .filter_map(CloudInstanceDescriptor::from_resource)
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Templates
// ---------------------------------------------------------------------------

fn hcl_string(value: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "\"\"".to_string())
}

fn hcl_map(map: &BTreeMap<String, String>) -> String {
    let entries: Vec<String> = map
        .iter()
        .map(|(k, v)| format!("    {} = {}", hcl_string(k), hcl_string(v)))
        .collect();
    format!("{{\n{}\n  }}", entries.join("\n"))
}

/// `terraform` block plus an empty provider, enough for targeted destroy.
pub fn render_provider_template(provider_version: Option<&str>) -> String {
    let version = provider_version
        .map(|v| format!("\n      version = {}", hcl_string(v)))
        .unwrap_or_default();
    format!(
        "terraform {{\n  required_providers {{\n    iterative = {{\n      source = {}{}\n    }}\n  }}\n}}\n\nprovider \"iterative\" {{}}\n",
        hcl_string(tf::PROVIDER_SOURCE),
        version
    )
}

pub fn render_runner_template(spec: &CloudRunnerSpec) -> String {
    let mut lines = vec![
        format!("  name = {}", hcl_string(&spec.name)),
        format!("  labels = {}", hcl_string(&spec.labels.join(","))),
        format!("  idle_timeout = {}", spec.idle_timeout.map(|s| s as i64).unwrap_or(-1)),
        format!("  single = {}", spec.single),
        format!("  repo = {}", hcl_string(&spec.repo)),
        format!("  token = {}", hcl_string(&spec.token)),
        format!("  cloud = {}", hcl_string(&spec.cloud)),
        format!("  region = {}", hcl_string(&spec.region)),
        format!("  spot = {}", spec.spot),
        format!("  spot_price = {}", spec.spot_price),
    ];

    let optional = [
        ("driver", spec.driver.map(|d| d.to_string())),
        ("instance_type", spec.instance_type.clone()),
        ("instance_permission_set", spec.permission_set.clone()),
        ("instance_gpu", spec.gpu.clone()),
        ("image", spec.image.clone()),
        ("ssh_private", spec.ssh_private.clone()),
        ("startup_script", spec.startup_script.clone()),
        ("aws_security_group", spec.aws_security_group.clone()),
        ("aws_subnet_id", spec.aws_subnet.clone()),
    ];
    for (key, value) in optional {
        if let Some(value) = value {
            lines.push(format!("  {key} = {}", hcl_string(&value)));
        }
    }
    if let Some(size) = spec.hdd_size {
        lines.push(format!("  instance_hdd_size = {size}"));
    }
    if !spec.docker_volumes.is_empty() {
        let volumes: Vec<String> = spec.docker_volumes.iter().map(|v| hcl_string(v)).collect();
        lines.push(format!("  docker_volumes = [{}]", volumes.join(", ")));
    }
    if !spec.metadata.is_empty() {
        lines.push(format!("  metadata = {}", hcl_map(&spec.metadata)));
    }
    if !spec.kubernetes_node_selector.is_empty() {
        lines.push(format!(
            "  kubernetes_node_selector = {}",
            hcl_map(&spec.kubernetes_node_selector)
        ));
    }

    format!(
        "{}\nresource \"{}\" \"runner\" {{\n{}\n}}\n",
        render_provider_template(spec.provider_version.as_deref()),
        tf::RESOURCE_TYPE,
        lines.join("\n")
    )
}

// ---------------------------------------------------------------------------
// Provisioner
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Create the cloud resources described by `spec`.
    async fn apply(&self, spec: &CloudRunnerSpec) -> Result<Vec<CloudInstanceDescriptor>>;

    /// Make `instance` known to Terraform so it can be destroyed from here.
    async fn prepare_destroy(&self, instance: &CloudInstanceDescriptor) -> Result<()>;

    async fn destroy(&self, instance: &CloudInstanceDescriptor) -> Result<()>;
}

pub struct TerraformProvisioner {
    workdir: PathBuf,
    provider_version: Option<String>,
    trace: Arc<dyn TraceWriter>,
    cancellation: CancellationToken,
}

impl TerraformProvisioner {
    pub fn new(
        workdir: impl Into<PathBuf>,
        provider_version: Option<String>,
        trace: Arc<dyn TraceWriter>,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            workdir: workdir.into(),
            provider_version,
            trace,
            cancellation,
        }
    }

    fn main_file(&self) -> PathBuf {
        self.workdir.join(tf::MAIN_FILE)
    }

    fn state_file(&self) -> PathBuf {
        self.workdir.join(tf::STATE_FILE)
    }

    async fn terraform(&self, args: &[&str]) -> Result<String> {
        let binary = WhichUtil::which("terraform", true)?
            .ok_or_else(|| anyhow::anyhow!("terraform not found"))?;
        let info = ProcessStartInfo::new(binary.to_string_lossy(), args.iter().copied())
            .working_directory(&self.workdir);
        ProcessInvoker::capture_stdout(self.trace.clone(), &info, self.cancellation.clone()).await
    }

    async fn check_version(&self) -> Result<()> {
        let output = self.terraform(&["version", "-json"]).await?;
        let version = parse_terraform_version(&output)?;
        if version < tf::MIN_VERSION {
            anyhow::bail!(
                "Terraform {}.{}.{} is too old; {}.{}.{} or newer is required",
                version.0,
                version.1,
                version.2,
                tf::MIN_VERSION.0,
                tf::MIN_VERSION.1,
                tf::MIN_VERSION.2
            );
        }
        Ok(())
    }

    async fn init(&self) -> Result<()> {
        self.check_version().await?;
        self.terraform(&["init", "-input=false"]).await?;
        Ok(())
    }
}

#[async_trait]
impl Provisioner for TerraformProvisioner {
    async fn apply(&self, spec: &CloudRunnerSpec) -> Result<Vec<CloudInstanceDescriptor>> {
        IOUtil::write_file(&self.main_file(), render_runner_template(spec))?;
        self.init().await.context("terraform init failed")?;
        self.terraform(&["apply", "-input=false", "-auto-approve"])
            .await
            .context("terraform apply failed")?;

        let instances = TerraformState::load(&self.state_file())?.runner_instances();
        if instances.is_empty() {
            anyhow::bail!("terraform apply produced no runner instances");
        }
        Ok(instances)
    }

    async fn prepare_destroy(&self, instance: &CloudInstanceDescriptor) -> Result<()> {
        if !self.main_file().exists() {
            IOUtil::write_file(
                &self.main_file(),
                render_provider_template(self.provider_version.as_deref()),
            )?;
        }

        let path = self.state_file();
        let mut state = if path.exists() {
            TerraformState::load(&path)?
        } else {
            TerraformState::default()
        };
        state.resources.retain(|r| {
            !(r.resource_type == instance.resource.resource_type && r.name == instance.resource.name)
        });
        state.resources.push(instance.resource.clone());
        state.save(&path)
    }

    async fn destroy(&self, instance: &CloudInstanceDescriptor) -> Result<()> {
        self.init().await.context("terraform init failed")?;
        let target = format!("-target={}", instance.address());
        self.terraform(&["destroy", "-input=false", "-auto-approve", &target])
            .await
            .context("terraform destroy failed")?;
        Ok(())
    }
}

fn parse_terraform_version(output: &str) -> Result<(u64, u64, u64)> {
    #[derive(Deserialize)]
    struct VersionOutput {
        terraform_version: String,
    }
    let parsed: VersionOutput =
        serde_json::from_str(output.trim()).context("Unexpected `terraform version` output")?;
    let mut parts = parsed
        .terraform_version
        .split(|c: char| c == '.' || c == '-')
        .map(|p| p.parse::<u64>().unwrap_or(0));
    Ok((
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
    ))
}
