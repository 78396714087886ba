// CI provider drivers.
//
// The lifecycle controller only talks to `dyn RunnerDriver`. Provider
// differences show up as `DriverCapabilities` flags, never as checks on the
// provider name.

pub mod bitbucket;
pub mod github;
pub mod gitlab;

pub use bitbucket::BitbucketDriver;
pub use github::GitHubDriver;
pub use gitlab::GitLabDriver;

use crate::constants;
use crate::log_parser::LogPatterns;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cml_sdk::TraceWriter;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Driver kind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverKind {
    GitHub,
    GitLab,
    Bitbucket,
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriverKind::GitHub => write!(f, "github"),
            DriverKind::GitLab => write!(f, "gitlab"),
            DriverKind::Bitbucket => write!(f, "bitbucket"),
        }
    }
}

impl FromStr for DriverKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "github" => Ok(DriverKind::GitHub),
            "gitlab" => Ok(DriverKind::GitLab),
            "bitbucket" => Ok(DriverKind::Bitbucket),
            other => anyhow::bail!("Unknown driver '{other}'. Expected github, gitlab or bitbucket"),
        }
    }
}

impl DriverKind {
    /// Guess the provider from the repository host.
    pub fn infer_from_repo(repo: &str) -> Result<Self> {
        let url = url::Url::parse(repo).with_context(|| format!("Invalid repository URL '{repo}'"))?;
        let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
        if host.contains("github") {
            Ok(DriverKind::GitHub)
        } else if host.contains("gitlab") {
            Ok(DriverKind::GitLab)
        } else if host.contains("bitbucket") {
            Ok(DriverKind::Bitbucket)
        } else {
            anyhow::bail!("Cannot infer the driver from '{repo}'; pass --driver")
        }
    }
}

// ---------------------------------------------------------------------------
// Shared data types
// ---------------------------------------------------------------------------

/// What a provider can and cannot do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DriverCapabilities {
    /// Logs lack the job id, so it must be looked up through the API.
    pub resolves_job_ids_out_of_band: bool,
    pub supports_reuse_idle: bool,
    pub supports_docker_volumes: bool,
    /// Restart the runner before a job exceeds this continuous runtime.
    pub long_job_watchdog: Option<Duration>,
}

/// A runner registered with the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerInfo {
    pub id: String,
    pub name: String,
    pub labels: Vec<String>,
    pub online: bool,
    pub busy: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Running,
}

/// A CI job believed to be running on this runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRecord {
    pub job: Option<String>,
    pub pipeline: Option<String>,
    pub date: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RegisterRunnerRequest {
    pub name: String,
    pub labels: Vec<String>,
}

/// Result of registering a runner with the provider.
#[derive(Debug, Clone, Default)]
pub struct RunnerRegistration {
    pub id: Option<String>,
    /// Token the runner process authenticates with.
    pub token: String,
    /// Extra provider values the runner process needs (OAuth client etc.).
    pub env: HashMap<String, String>,
}

/// Everything a driver needs to prepare a local runner.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub name: String,
    pub labels: Vec<String>,
    pub workdir: PathBuf,
    pub single: bool,
    pub idle_timeout: Option<Duration>,
    pub docker_volumes: Vec<String>,
}

/// The process the supervisor should start.
#[derive(Debug, Clone)]
pub struct RunnerCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub working_directory: PathBuf,
    /// Secrets to register with the masker before the process logs anything.
    pub secrets: Vec<String>,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// Non-success response. The provider's message is kept verbatim.
    #[error("{message}")]
    Api { status: u16, message: String },

    #[error("Runner '{0}' not found")]
    RunnerNotFound(String),
}

/// True when the error says the runner cannot be removed mid-job.
pub fn is_still_running_job(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| cause.to_string().contains(constants::STILL_RUNNING_JOB))
}

// ---------------------------------------------------------------------------
// Driver trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait RunnerDriver: Send + Sync {
    fn kind(&self) -> DriverKind;

    fn repo(&self) -> &str;

    fn capabilities(&self) -> DriverCapabilities;

    /// Registration token for a new runner.
    async fn runner_token(&self) -> Result<String>;

    async fn register_runner(&self, request: &RegisterRunnerRequest) -> Result<RunnerRegistration>;

    async fn unregister_runner(&self, name: &str) -> Result<()>;

    async fn runners(&self) -> Result<Vec<RunnerInfo>>;

    fn runner_by_name<'a>(&self, name: &str, runners: &'a [RunnerInfo]) -> Option<&'a RunnerInfo> {
        runners.iter().find(|r| r.name == name)
    }

    /// Runners carrying every requested label.
    fn runners_by_labels<'a>(&self, labels: &[String], runners: &'a [RunnerInfo]) -> Vec<&'a RunnerInfo> {
        runners
            .iter()
            .filter(|r| labels.iter().all(|l| r.labels.iter().any(|rl| rl == l)))
            .collect()
    }

    async fn runner_job(&self, runner_id: &str, status: JobStatus) -> Result<Option<JobRecord>>;

    async fn pipeline_rerun(&self, pipeline_id: Option<&str>, job_id: Option<&str>) -> Result<()>;

    fn runner_log_patterns(&self) -> &LogPatterns;

    /// Fetch the provider-native runner if needed, register it, and return
    /// the command the supervisor runs.
    async fn prepare_runner(&self, request: &LaunchRequest) -> Result<RunnerCommand>;
}

/// Build the driver for `kind`, inferring it from `repo` when not given.
pub fn create_driver(
    kind: Option<DriverKind>,
    repo: &str,
    token: &str,
    http: reqwest::Client,
    trace: Arc<dyn TraceWriter>,
) -> Result<Arc<dyn RunnerDriver>> {
    let kind = match kind {
        Some(kind) => kind,
        None => DriverKind::infer_from_repo(repo)?,
    };
    let driver: Arc<dyn RunnerDriver> = match kind {
        DriverKind::GitHub => Arc::new(GitHubDriver::new(repo, token, http, trace)?),
        DriverKind::GitLab => Arc::new(GitLabDriver::new(repo, token, http, trace)?),
        DriverKind::Bitbucket => Arc::new(BitbucketDriver::new(repo, token, http, trace)?),
    };
    Ok(driver)
}

// ---------------------------------------------------------------------------
// HTTP helpers shared by the drivers
// ---------------------------------------------------------------------------

/// Send a request and turn non-success statuses into `DriverError::Api`.
pub(crate) async fn send(request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
    let response = request.send().await.context("Request to CI provider failed")?;
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(DriverError::Api {
        status: status.as_u16(),
        message: api_error_message(&body).unwrap_or_else(|| format!("{status}: {body}")),
    }
    .into())
}

pub(crate) async fn send_json<T: DeserializeOwned>(request: reqwest::RequestBuilder) -> Result<T> {
    let response = send(request).await?;
    response
        .json::<T>()
        .await
        .context("Failed to decode CI provider response")
}

/// Pull the human-readable message out of a provider error body.
fn api_error_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    let message = value
        .get("message")
        .or_else(|| value.get("error").and_then(|e| e.get("message")))
        .or_else(|| value.get("error"))?;
    match message {
        serde_json::Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Split `https://host/a/b/c` into the host base and the path segments.
pub(crate) fn split_repo_url(repo: &str) -> Result<(url::Url, Vec<String>)> {
    let url = url::Url::parse(repo.trim_end_matches('/'))
        .with_context(|| format!("Invalid repository URL '{repo}'"))?;
    let segments: Vec<String> = url
        .path_segments()
        .map(|s| s.filter(|p| !p.is_empty()).map(|p| p.trim_end_matches(".git").to_string()).collect())
        .unwrap_or_default();
    if segments.len() < 2 {
        anyhow::bail!("Repository URL '{repo}' must include owner and name");
    }
    let mut base = url.clone();
    base.set_path("");
    Ok((base, segments))
}

/// Download a release archive or binary.
pub(crate) async fn download(http: &reqwest::Client, url: &str) -> Result<Vec<u8>> {
    let response = send(http.get(url))
        .await
        .with_context(|| format!("Failed to download '{url}'"))?;
    Ok(response.bytes().await?.to_vec())
}
