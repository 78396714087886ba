// GitLab driver: project runners through the v4 REST API, with
// `gitlab-runner run-single` as the local runner process.

use super::{
    download, send, send_json, split_repo_url, DriverCapabilities, DriverError, DriverKind,
    JobRecord, JobStatus, LaunchRequest, RegisterRunnerRequest, RunnerCommand, RunnerDriver,
    RunnerInfo, RunnerRegistration,
};
use crate::constants::{CURRENT_ARCHITECTURE, CURRENT_PLATFORM};
use crate::log_parser::LogPatterns;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cml_sdk::{IOUtil, TraceWriter};
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const DOCKER_IMAGE: &str = "iterativeai/cml:latest";

pub struct GitLabDriver {
    repo: String,
    host: String,
    api_base: String,
    project_id: String,
    token: String,
    http: reqwest::Client,
    patterns: LogPatterns,
    trace: Arc<dyn TraceWriter>,
}

// ---------------------------------------------------------------------------
// REST payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct Project {
    #[serde(default)]
    runners_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiRunner {
    id: u64,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    online: Option<bool>,
    #[serde(default)]
    status: Option<String>,
}

impl ApiRunner {
    fn is_online(&self) -> bool {
        self.online.unwrap_or(false) || self.status.as_deref() == Some("online")
    }
}

#[derive(Debug, Deserialize)]
struct RunnerDetails {
    #[serde(default)]
    tag_list: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct Registered {
    id: u64,
    token: String,
}

#[derive(Debug, Deserialize)]
struct ApiJob {
    id: u64,
    #[serde(default)]
    pipeline: Option<PipelineRef>,
    #[serde(default)]
    started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct PipelineRef {
    id: u64,
}

impl From<ApiJob> for JobRecord {
    fn from(job: ApiJob) -> Self {
        JobRecord {
            job: Some(job.id.to_string()),
            pipeline: job.pipeline.map(|p| p.id.to_string()),
            date: job.started_at.unwrap_or_else(Utc::now),
        }
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

impl GitLabDriver {
    pub fn new(repo: &str, token: &str, http: reqwest::Client, trace: Arc<dyn TraceWriter>) -> Result<Self> {
        let (base, segments) = split_repo_url(repo)?;
        let host = base.as_str().trim_end_matches('/').to_string();
        let project_path = segments.join("/");

        let patterns = LogPatterns::new(
            "Starting runner for",
            r#""job":.+received"#,
            r#""duration_s":"#,
            r#""duration_s":.+Job succeeded"#,
            Some(r#""job":([0-9]+),"#),
            Some(r#""pipeline_id":([0-9]+),"#),
        )?;

        Ok(Self {
            repo: repo.to_string(),
            api_base: format!("{host}/api/v4"),
            host,
            project_id: utf8_percent_encode(&project_path, NON_ALPHANUMERIC).to_string(),
            token: token.to_string(),
            http,
            patterns,
            trace,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_base, path)
    }

    fn project_url(&self, path: &str) -> String {
        self.url(&format!("/projects/{}{}", self.project_id, path))
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request.header("PRIVATE-TOKEN", &self.token)
    }

    fn binary_url() -> String {
        format!(
            "https://gitlab-runner-downloads.s3.amazonaws.com/latest/binaries/gitlab-runner-{}-{}",
            CURRENT_PLATFORM.gitlab_runner_name(),
            CURRENT_ARCHITECTURE.gitlab_runner_name()
        )
    }

    async fn ensure_binary(&self, workdir: &Path) -> Result<PathBuf> {
        let path = workdir.join("gitlab-runner");
        if path.exists() {
            return Ok(path);
        }
        let url = Self::binary_url();
        self.trace.info(&format!("Downloading gitlab-runner from {url}"));
        let bytes = download(&self.http, &url).await?;
        IOUtil::write_file(&path, bytes)?;
        IOUtil::make_executable(&path)?;
        Ok(path)
    }

    fn run_single_args(&self, request: &LaunchRequest, token: &str) -> Vec<String> {
        let wait_timeout = request
            .idle_timeout
            .map(|d| d.as_secs())
            .unwrap_or(u64::from(u32::MAX))
            .to_string();
        let workdir = request.workdir.to_string_lossy().into_owned();

        let mut args: Vec<String> = [
            "--log-format",
            "json",
            "run-single",
            "--builds-dir",
            workdir.as_str(),
            "--cache-dir",
            workdir.as_str(),
            "--url",
            self.host.as_str(),
            "--name",
            request.name.as_str(),
            "--token",
            token,
            "--wait-timeout",
            wait_timeout.as_str(),
            "--executor",
            "docker",
            "--docker-image",
            DOCKER_IMAGE,
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        for volume in &request.docker_volumes {
            args.push("--docker-volumes".to_string());
            args.push(volume.clone());
        }
        if request.single {
            args.push("--max-builds".to_string());
            args.push("1".to_string());
        }
        args
    }

    async fn runner_tags(&self, id: u64) -> Result<Vec<String>> {
        let details: RunnerDetails =
            send_json(self.authorize(self.http.get(self.url(&format!("/runners/{id}"))))).await?;
        Ok(details.tag_list)
    }
}

#[async_trait]
impl RunnerDriver for GitLabDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::GitLab
    }

    fn repo(&self) -> &str {
        &self.repo
    }

    fn capabilities(&self) -> DriverCapabilities {
        DriverCapabilities {
            resolves_job_ids_out_of_band: false,
            supports_reuse_idle: true,
            supports_docker_volumes: true,
            long_job_watchdog: None,
        }
    }

    async fn runner_token(&self) -> Result<String> {
        let project: Project = send_json(self.authorize(self.http.get(self.project_url(""))))
            .await
            .context("Failed to read project")?;
        project
            .runners_token
            .ok_or_else(|| anyhow::anyhow!("Project has no runner registration token"))
    }

    async fn register_runner(&self, request: &RegisterRunnerRequest) -> Result<RunnerRegistration> {
        let registration_token = self.runner_token().await?;
        let form = [
            ("token", registration_token),
            ("description", request.name.clone()),
            ("tag_list", request.labels.join(",")),
            ("locked", "true".to_string()),
            ("run_untagged", "true".to_string()),
            ("access_level", "not_protected".to_string()),
        ];
        let registered: Registered = send_json(self.http.post(self.url("/runners")).form(&form))
            .await
            .context("Failed to register runner")?;
        Ok(RunnerRegistration {
            id: Some(registered.id.to_string()),
            token: registered.token,
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
        let listed: Vec<ApiRunner> = send_json(
            self.authorize(self.http.get(self.project_url("/runners?per_page=100"))),
        )
        .await
        .context("Failed to list runners")?;

        let mut runners = Vec::with_capacity(listed.len());
        for runner in listed {
            let labels = self.runner_tags(runner.id).await?;
            let busy = self
                .runner_job(&runner.id.to_string(), JobStatus::Running)
                .await?
                .is_some();
            runners.push(RunnerInfo {
                id: runner.id.to_string(),
                name: runner.description.clone().unwrap_or_default(),
                online: runner.is_online(),
                labels,
                busy,
            });
        }
        Ok(runners)
    }

    async fn runner_job(&self, runner_id: &str, status: JobStatus) -> Result<Option<JobRecord>> {
        let status = match status {
            JobStatus::Running => "running",
        };
        let jobs: Vec<ApiJob> = send_json(self.authorize(
            self.http
                .get(self.url(&format!("/runners/{runner_id}/jobs?status={status}&per_page=1"))),
        ))
        .await?;
        Ok(jobs.into_iter().next().map(JobRecord::from))
    }

    /// Retry the job when known, otherwise the whole pipeline.
    async fn pipeline_rerun(&self, pipeline_id: Option<&str>, job_id: Option<&str>) -> Result<()> {
        let path = match (job_id, pipeline_id) {
            (Some(job), _) => format!("/jobs/{job}/retry"),
            (None, Some(pipeline)) => format!("/pipelines/{pipeline}/retry"),
            (None, None) => anyhow::bail!("Cannot retry a GitLab job without a job or pipeline id"),
        };
        send(self.authorize(self.http.post(self.project_url(&path)))).await?;
        Ok(())
    }

    fn runner_log_patterns(&self) -> &LogPatterns {
        &self.patterns
    }

    async fn prepare_runner(&self, request: &LaunchRequest) -> Result<RunnerCommand> {
        let binary = self.ensure_binary(&request.workdir).await?;
        let registration = self
            .register_runner(&RegisterRunnerRequest {
                name: request.name.clone(),
                labels: request.labels.clone(),
            })
            .await?;

        Ok(RunnerCommand {
            program: binary.to_string_lossy().into_owned(),
            args: self.run_single_args(request, &registration.token),
            env: registration.env,
            working_directory: request.workdir.clone(),
            secrets: vec![registration.token],
        })
    }
}
