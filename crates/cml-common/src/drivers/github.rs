// GitHub Actions driver: REST calls against the repository's self-hosted
// runner endpoints, plus setup of the actions/runner release.

use super::{
    download, send, send_json, split_repo_url, DriverCapabilities, DriverError, DriverKind,
    JobRecord, JobStatus, LaunchRequest, RegisterRunnerRequest, RunnerCommand, RunnerDriver,
    RunnerInfo, RunnerRegistration,
};
use crate::constants::{self, CURRENT_ARCHITECTURE, CURRENT_PLATFORM};
use crate::log_parser::LogPatterns;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cml_sdk::{IOUtil, ProcessInvoker, ProcessStartInfo, TraceWriter};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const RUNNER_VERSION: &str = "2.319.1";
const RERUN_POLL_INTERVAL: Duration = Duration::from_secs(10);
const RERUN_POLL_ATTEMPTS: u32 = 60;

pub struct GitHubDriver {
    repo: String,
    owner: String,
    name: String,
    api_base: String,
    token: String,
    http: reqwest::Client,
    patterns: LogPatterns,
    trace: Arc<dyn TraceWriter>,
}

// ---------------------------------------------------------------------------
// REST payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RunnersPage {
    runners: Vec<ApiRunner>,
}

#[derive(Debug, Deserialize)]
struct ApiRunner {
    id: u64,
    name: String,
    status: String,
    #[serde(default)]
    busy: bool,
    #[serde(default)]
    labels: Vec<ApiLabel>,
}

#[derive(Debug, Deserialize)]
struct ApiLabel {
    name: String,
}

impl From<ApiRunner> for RunnerInfo {
    fn from(r: ApiRunner) -> Self {
        RunnerInfo {
            id: r.id.to_string(),
            name: r.name,
            labels: r.labels.into_iter().map(|l| l.name).collect(),
            online: r.status == "online",
            busy: r.busy,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
}

#[derive(Debug, Deserialize)]
struct RunsPage {
    workflow_runs: Vec<WorkflowRun>,
}

#[derive(Debug, Deserialize)]
struct WorkflowRun {
    id: u64,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JobsPage {
    jobs: Vec<WorkflowJob>,
}

#[derive(Debug, Deserialize)]
struct WorkflowJob {
    id: u64,
    run_id: u64,
    status: String,
    #[serde(default)]
    runner_id: Option<u64>,
    #[serde(default)]
    started_at: Option<DateTime<Utc>>,
}

fn running_job_on(jobs: Vec<WorkflowJob>, runner_id: &str) -> Option<JobRecord> {
    jobs.into_iter()
        .find(|j| j.status == "in_progress" && j.runner_id.map(|id| id.to_string()).as_deref() == Some(runner_id))
        .map(|j| JobRecord {
            job: Some(j.id.to_string()),
            pipeline: Some(j.run_id.to_string()),
            date: j.started_at.unwrap_or_else(Utc::now),
        })
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

impl GitHubDriver {
    pub fn new(repo: &str, token: &str, http: reqwest::Client, trace: Arc<dyn TraceWriter>) -> Result<Self> {
        let (base, segments) = split_repo_url(repo)?;
        let api_base = match base.host_str() {
            Some("github.com") => "https://api.github.com".to_string(),
            _ => format!("{}api/v3", base),
        };

        let patterns = LogPatterns::new(
            "Listening for Jobs",
            "Running job",
            "completed with result",
            "completed with result: Succeeded",
            None,
            None,
        )?;

        Ok(Self {
            repo: repo.to_string(),
            owner: segments[0].clone(),
            name: segments[1].clone(),
            api_base,
            token: token.to_string(),
            http,
            patterns,
            trace,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/repos/{}/{}/actions{}", self.api_base, self.owner, self.name, path)
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.authorize(self.http.get(self.url(path)))
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.authorize(self.http.post(self.url(path)))
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .header("Authorization", format!("token {}", self.token))
            .header("Accept", "application/vnd.github+json")
    }

    fn tarball_url() -> String {
        let file = format!(
            "actions-runner-{}-{}-{}.tar.gz",
            CURRENT_PLATFORM.github_runner_name(),
            CURRENT_ARCHITECTURE.github_runner_name(),
            RUNNER_VERSION
        );
        format!("https://github.com/actions/runner/releases/download/v{RUNNER_VERSION}/{file}")
    }

    fn config_args(&self, request: &LaunchRequest, token: &str) -> Vec<String> {
        let mut args = vec![
            "--unattended".to_string(),
            "--replace".to_string(),
            "--token".to_string(),
            token.to_string(),
            "--url".to_string(),
            self.repo.clone(),
            "--name".to_string(),
            request.name.clone(),
            "--labels".to_string(),
            request.labels.join(","),
            "--work".to_string(),
            "_work".to_string(),
        ];
        if request.single {
            args.push("--ephemeral".to_string());
        }
        args
    }

    async fn ensure_runner_installed(&self, workdir: &Path) -> Result<()> {
        if workdir.join("config.sh").exists() {
            return Ok(());
        }
        let url = Self::tarball_url();
        self.trace.info(&format!("Downloading GitHub Actions runner from {url}"));
        let archive = download(&self.http, &url).await?;
        IOUtil::extract_tar_gz(&archive, workdir)
    }

    async fn run_status(&self, run_id: &str) -> Result<Option<String>> {
        let run: WorkflowRun = send_json(self.get(&format!("/runs/{run_id}"))).await?;
        Ok(run.status)
    }
}

#[async_trait]
impl RunnerDriver for GitHubDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::GitHub
    }

    fn repo(&self) -> &str {
        &self.repo
    }

    fn capabilities(&self) -> DriverCapabilities {
        DriverCapabilities {
            resolves_job_ids_out_of_band: true,
            supports_reuse_idle: true,
            supports_docker_volumes: false,
            long_job_watchdog: Some(constants::GITHUB_JOB_LIMIT),
        }
    }

    async fn runner_token(&self) -> Result<String> {
        let response: TokenResponse = send_json(self.post("/runners/registration-token"))
            .await
            .context("Failed to get runner registration token")?;
        Ok(response.token)
    }

    /// GitHub registers the runner from `config.sh`; only the token is needed here.
    async fn register_runner(&self, _request: &RegisterRunnerRequest) -> Result<RunnerRegistration> {
        Ok(RunnerRegistration {
            id: None,
            token: self.runner_token().await?,
            env: HashMap::new(),
        })
    }

    async fn unregister_runner(&self, name: &str) -> Result<()> {
        let runners = self.runners().await?;
        let runner = self
            .runner_by_name(name, &runners)
            .ok_or_else(|| DriverError::RunnerNotFound(name.to_string()))?;
        let request = self.authorize(self.http.delete(self.url(&format!("/runners/{}", runner.id))));
        send(request).await?;
        Ok(())
    }

    async fn runners(&self) -> Result<Vec<RunnerInfo>> {
        let page: RunnersPage = send_json(self.get("/runners?per_page=100"))
            .await
            .context("Failed to list runners")?;
        Ok(page.runners.into_iter().map(RunnerInfo::from).collect())
    }

    async fn runner_job(&self, runner_id: &str, status: JobStatus) -> Result<Option<JobRecord>> {
        let status = match status {
            JobStatus::Running => "in_progress",
        };
        let runs: RunsPage = send_json(self.get(&format!("/runs?status={status}"))).await?;
        for run in runs.workflow_runs {
            let jobs: JobsPage = send_json(self.get(&format!("/runs/{}/jobs", run.id))).await?;
            if let Some(record) = running_job_on(jobs.jobs, runner_id) {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    /// Cancel the run if it is still going, wait for it to settle, then rerun it.
    async fn pipeline_rerun(&self, pipeline_id: Option<&str>, _job_id: Option<&str>) -> Result<()> {
        let Some(run_id) = pipeline_id else {
            anyhow::bail!("Cannot rerun a GitHub workflow without its run id");
        };

        if self.run_status(run_id).await?.as_deref() != Some("completed") {
            self.trace.info(&format!("Cancelling workflow run {run_id} before rerun"));
            send(self.post(&format!("/runs/{run_id}/cancel"))).await?;

            let mut attempts = 0;
            while self.run_status(run_id).await?.as_deref() != Some("completed") {
                attempts += 1;
                if attempts >= RERUN_POLL_ATTEMPTS {
                    anyhow::bail!("Workflow run {run_id} did not complete after cancellation");
                }
                tokio::time::sleep(RERUN_POLL_INTERVAL).await;
            }
        }

        send(self.post(&format!("/runs/{run_id}/rerun"))).await?;
        Ok(())
    }

    fn runner_log_patterns(&self) -> &LogPatterns {
        &self.patterns
    }

    async fn prepare_runner(&self, request: &LaunchRequest) -> Result<RunnerCommand> {
        self.ensure_runner_installed(&request.workdir).await?;
        let token = self.runner_token().await?;

        let mut env = HashMap::new();
        env.insert("RUNNER_ALLOW_RUNASROOT".to_string(), "1".to_string());

        let config = ProcessStartInfo::new(
            request.workdir.join("config.sh").to_string_lossy(),
            self.config_args(request, &token),
        )
        .working_directory(&request.workdir)
        .environment(env.clone())
        .require_exit_code_zero(true);
        ProcessInvoker::new(self.trace.clone())
            .execute(&config, CancellationToken::new())
            .await
            .context("Failed to configure GitHub runner")?;

        Ok(RunnerCommand {
            program: request.workdir.join("run.sh").to_string_lossy().into_owned(),
            args: Vec::new(),
            env,
            working_directory: request.workdir.clone(),
            secrets: vec![token],
        })
    }
}
