// Bitbucket Pipelines driver. Runners are registered through the pipelines
// runner API and run as the Atlassian runner container under docker.

use super::{
    send, send_json, split_repo_url, DriverCapabilities, DriverError, DriverKind, JobRecord,
    JobStatus, LaunchRequest, RegisterRunnerRequest, RunnerCommand, RunnerDriver, RunnerInfo,
    RunnerRegistration,
};
use crate::log_parser::LogPatterns;
use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine;
use cml_sdk::TraceWriter;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

const API_BASE: &str = "https://api.bitbucket.org";
const RUNNER_IMAGE: &str =
    "docker-public.packages.atlassian.com/sox/atlassian/bitbucket-pipelines-runner:1";

pub struct BitbucketDriver {
    repo: String,
    workspace: String,
    slug: String,
    authorization: String,
    http: reqwest::Client,
    patterns: LogPatterns,
    trace: Arc<dyn TraceWriter>,
}

// ---------------------------------------------------------------------------
// REST payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct Repository {
    uuid: String,
    workspace: WorkspaceRef,
}

#[derive(Debug, Deserialize)]
struct WorkspaceRef {
    uuid: String,
}

#[derive(Debug, Deserialize)]
struct RunnersPage {
    #[serde(default)]
    values: Vec<ApiRunner>,
}

#[derive(Debug, Deserialize)]
struct ApiRunner {
    uuid: String,
    name: String,
    #[serde(default)]
    labels: Vec<String>,
    #[serde(default)]
    state: Option<RunnerState>,
    #[serde(default)]
    oauth_client: Option<OAuthClient>,
}

#[derive(Debug, Deserialize)]
struct RunnerState {
    status: String,
    #[serde(default)]
    step: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct OAuthClient {
    id: String,
    secret: String,
}

impl From<ApiRunner> for RunnerInfo {
    fn from(r: ApiRunner) -> Self {
        let (online, busy) = match &r.state {
            Some(state) => (state.status == "ONLINE", state.step.is_some()),
            None => (false, false),
        };
        RunnerInfo {
            id: r.uuid,
            name: r.name,
            labels: r.labels,
            online,
            busy,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Pipeline {
    target: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

impl BitbucketDriver {
    /// `token` is either `user:app-password` (basic auth) or an access token.
    pub fn new(repo: &str, token: &str, http: reqwest::Client, trace: Arc<dyn TraceWriter>) -> Result<Self> {
        let (_, segments) = split_repo_url(repo)?;

        let patterns = LogPatterns::new(
            r#"Updating runner status to "ONLINE""#,
            r"Getting step StepId\{.*\}",
            r"Completing step with result Result\{status=",
            r"Completing step with result Result\{status=PASSED",
            Some(r"stepUuid=\{(.+)\}\}"),
            Some(r"pipelineUuid=\{(.+)\}, stepUuid"),
        )?;

        Ok(Self {
            repo: repo.to_string(),
            workspace: segments[0].clone(),
            slug: segments[1].clone(),
            authorization: authorization_header(token),
            http,
            patterns,
            trace,
        })
    }

    fn repository_url(&self, path: &str) -> String {
        format!("{API_BASE}/2.0/repositories/{}/{}{}", self.workspace, self.slug, path)
    }

    fn runners_url(&self, path: &str) -> String {
        format!(
            "{API_BASE}/internal/repositories/{}/{}/pipelines-config/runners{}",
            self.workspace, self.slug, path
        )
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request.header("Authorization", &self.authorization)
    }

    fn container_args(name: &str, env: &HashMap<String, String>) -> Vec<String> {
        let mut args: Vec<String> = [
            "container",
            "run",
            "--tty",
            "--attach",
            "stdout",
            "--attach",
            "stderr",
            "--rm",
            "--name",
            name,
            "--volume",
            "/tmp:/tmp",
            "--volume",
            "/var/run/docker.sock:/var/run/docker.sock",
            "--volume",
            "/var/lib/docker/containers:/var/lib/docker/containers:ro",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        // Values are passed through the environment so secrets stay out of argv.
        let mut names: Vec<&String> = env.keys().collect();
        names.sort();
        for var in names {
            args.push("--env".to_string());
            args.push(var.clone());
        }
        args.push(RUNNER_IMAGE.to_string());
        args
    }
}

fn authorization_header(token: &str) -> String {
    if token.contains(':') {
        format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode(token.as_bytes())
        )
    } else {
        format!("Bearer {token}")
    }
}

#[async_trait]
impl RunnerDriver for BitbucketDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Bitbucket
    }

    fn repo(&self) -> &str {
        &self.repo
    }

    fn capabilities(&self) -> DriverCapabilities {
        DriverCapabilities {
            resolves_job_ids_out_of_band: false,
            supports_reuse_idle: false,
            supports_docker_volumes: false,
            long_job_watchdog: None,
        }
    }

    /// Bitbucket has no separate registration token; the OAuth client
    /// created by `register_runner` takes its place.
    async fn runner_token(&self) -> Result<String> {
        Ok(String::new())
    }

    async fn register_runner(&self, request: &RegisterRunnerRequest) -> Result<RunnerRegistration> {
        let repository: Repository = send_json(self.authorize(self.http.get(self.repository_url(""))))
            .await
            .context("Failed to read repository")?;

        let mut labels = vec!["self.hosted".to_string(), "linux".to_string()];
        labels.extend(request.labels.iter().cloned());
        let body = json!({ "name": request.name, "labels": labels });

        let runner: ApiRunner = send_json(self.authorize(self.http.post(self.runners_url(""))).json(&body))
            .await
            .context("Failed to register runner")?;
        let oauth = runner
            .oauth_client
            .ok_or_else(|| anyhow::anyhow!("Runner registration returned no OAuth client"))?;

        let mut env = HashMap::new();
        env.insert("ACCOUNT_UUID".to_string(), repository.workspace.uuid);
        env.insert("REPOSITORY_UUID".to_string(), repository.uuid);
        env.insert("RUNNER_UUID".to_string(), runner.uuid.clone());
        env.insert("OAUTH_CLIENT_ID".to_string(), oauth.id);
        env.insert("OAUTH_CLIENT_SECRET".to_string(), oauth.secret.clone());
        env.insert("WORKING_DIRECTORY".to_string(), "/tmp".to_string());

        Ok(RunnerRegistration {
            id: Some(runner.uuid),
            token: oauth.secret,
            env,
        })
    }

    async fn unregister_runner(&self, name: &str) -> Result<()> {
        let runners = self.runners().await?;
        let runner = self
            .runner_by_name(name, &runners)
            .ok_or_else(|| DriverError::RunnerNotFound(name.to_string()))?;
        send(self.authorize(self.http.delete(self.runners_url(&format!("/{}", runner.id))))).await?;
        Ok(())
    }

    async fn runners(&self) -> Result<Vec<RunnerInfo>> {
        let page: RunnersPage = send_json(self.authorize(self.http.get(self.runners_url(""))))
            .await
            .context("Failed to list runners")?;
        Ok(page.values.into_iter().map(RunnerInfo::from).collect())
    }

    /// Step and pipeline ids are in the runner log, so there is nothing to look up.
    async fn runner_job(&self, _runner_id: &str, _status: JobStatus) -> Result<Option<JobRecord>> {
        Ok(None)
    }

    /// Trigger a new pipeline on the same target as the interrupted one.
    async fn pipeline_rerun(&self, pipeline_id: Option<&str>, _job_id: Option<&str>) -> Result<()> {
        let Some(id) = pipeline_id else {
            anyhow::bail!("Cannot rerun a Bitbucket pipeline without its id");
        };
        let pipeline: Pipeline =
            send_json(self.authorize(self.http.get(self.repository_url(&format!("/pipelines/{{{id}}}")))))
                .await?;
        self.trace.info(&format!("Re-triggering pipeline {{{id}}}"));
        send(
            self.authorize(self.http.post(self.repository_url("/pipelines/")))
                .json(&json!({ "target": pipeline.target })),
        )
        .await?;
        Ok(())
    }

    fn runner_log_patterns(&self) -> &LogPatterns {
        &self.patterns
    }

    async fn prepare_runner(&self, request: &LaunchRequest) -> Result<RunnerCommand> {
        let registration = self
            .register_runner(&RegisterRunnerRequest {
                name: request.name.clone(),
                labels: request.labels.clone(),
            })
            .await?;

        Ok(RunnerCommand {
            program: "docker".to_string(),
            args: Self::container_args(&request.name, &registration.env),
            env: registration.env,
            working_directory: request.workdir.clone(),
            secrets: vec![registration.token],
        })
    }
}
