// Runner log parsing: turns raw output chunks of a provider-native runner
// into lifecycle events using that provider's regex set.

use crate::drivers::{JobStatus, RunnerDriver};
use crate::tracing::Tracing;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use cml_sdk::TraceWriter;
use regex::Regex;
use serde::Serialize;

/// Compiled regex set describing one provider's runner log format.
#[derive(Debug, Clone)]
pub struct LogPatterns {
    pub ready: Regex,
    pub job_started: Regex,
    pub job_ended: Regex,
    pub job_ended_succeeded: Regex,
    /// Capture group 1 is the job id.
    pub job: Option<Regex>,
    /// Capture group 1 is the pipeline/workflow id.
    pub pipeline: Option<Regex>,
}

impl LogPatterns {
    /// Compile a pattern set. A malformed pattern is an error here rather
    /// than a silent non-match later.
    pub fn new(
        ready: &str,
        job_started: &str,
        job_ended: &str,
        job_ended_succeeded: &str,
        job: Option<&str>,
        pipeline: Option<&str>,
    ) -> Result<Self> {
        Ok(Self {
            ready: compile("ready", ready)?,
            job_started: compile("job_started", job_started)?,
            job_ended: compile("job_ended", job_ended)?,
            job_ended_succeeded: compile("job_ended_succeeded", job_ended_succeeded)?,
            job: job.map(|p| compile("job", p)).transpose()?,
            pipeline: pipeline.map(|p| compile("pipeline", p)).transpose()?,
        })
    }
}

fn compile(which: &str, pattern: &str) -> Result<Regex> {
    Regex::new(pattern).with_context(|| format!("Invalid '{which}' log pattern: {pattern}"))
}

/// Lifecycle status reported in the "runner status" log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Ready,
    JobStarted,
    JobEnded,
    Terminated,
}

/// One structured event derived from the runner's output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LifecycleEvent {
    pub status: EventStatus,
    /// When the event was parsed, not when the runner logged it.
    pub date: DateTime<Utc>,
    pub repo: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
}

impl LifecycleEvent {
    pub fn new(status: EventStatus, repo: &str) -> Self {
        Self {
            status,
            date: Utc::now(),
            repo: repo.to_string(),
            job: None,
            pipeline: None,
            success: None,
        }
    }

    pub fn terminated(repo: &str) -> Self {
        Self::new(EventStatus::Terminated, repo)
    }
}

/// Parse one chunk of runner output.
///
/// Each of `ready`, `job_started` and `job_ended` is tested against the whole
/// chunk in that order, and every match yields one event, so a chunk holding
/// several lines can produce several events.
pub fn parse_runner_log(data: &str, patterns: &LogPatterns, repo: &str) -> Vec<LifecycleEvent> {
    let mut events = Vec::new();
    if data.is_empty() {
        return events;
    }

    if patterns.ready.is_match(data) {
        events.push(LifecycleEvent::new(EventStatus::Ready, repo));
    }

    if patterns.job_started.is_match(data) {
        let mut event = LifecycleEvent::new(EventStatus::JobStarted, repo);
        event.job = first_capture(patterns.job.as_ref(), data);
        event.pipeline = first_capture(patterns.pipeline.as_ref(), data);
        events.push(event);
    }

    if patterns.job_ended.is_match(data) {
        let mut event = LifecycleEvent::new(EventStatus::JobEnded, repo);
        event.success = Some(patterns.job_ended_succeeded.is_match(data));
        events.push(event);
    }

    events
}

fn first_capture(pattern: Option<&Regex>, data: &str) -> Option<String> {
    pattern
        .and_then(|re| re.captures(data))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Ask the driver which job the runner picked up.
///
/// Only for `job_started` events on spot instances, and only for drivers
/// whose logs do not carry the job id. The lookup is rate limited on the
/// provider side, so every other case returns without a request. A failed
/// lookup is logged and leaves the event as it was.
pub async fn resolve_job_identity(
    event: &mut LifecycleEvent,
    driver: &dyn RunnerDriver,
    runner_name: &str,
    cloud_spot: bool,
    trace: &Tracing,
) {
    if event.status != EventStatus::JobStarted
        || !cloud_spot
        || !driver.capabilities().resolves_job_ids_out_of_band
    {
        return;
    }

    let lookup = async {
        let runners = driver.runners().await?;
        let Some(runner) = driver.runner_by_name(runner_name, &runners) else {
            return Ok(None);
        };
        driver.runner_job(&runner.id, JobStatus::Running).await
    };

    match lookup.await {
        Ok(Some(record)) => {
            event.job = record.job;
            event.pipeline = record.pipeline;
        }
        Ok(None) => trace.verbose(&format!("No running job found for runner '{runner_name}'.")),
        Err(e) => trace.warning(&format!("Failed to resolve job for runner '{runner_name}': {e:#}")),
    }
}
