//! Finding the run a dispatch created and waiting for it to finish.
//!
//! Dispatch does not return a run id, so the poller starts in a searching
//! state: it lists the workflow's recent `workflow_dispatch` runs and picks
//! the earliest one created at or after the dispatch time. Once a run is
//! known it is polled at a fixed interval until it completes or the timeout
//! measured from dispatch runs out.

use std::{fmt, time::Duration};

use indent_core::{
    config::PollConfig,
    models::{
        Conclusion, DispatchAck, JobId, JobOutcome, RunHandle, RunId, RunResult, RunStatus,
        StepOutcome,
    },
};
use serde::Deserialize;
use time::{OffsetDateTime, format_description::well_known::Rfc3339};

use crate::{
    Error, GitHub, PER_PAGE, PageParams, Result,
    clock::{CancelSignal, run_or_cancel, sleep_or_cancel},
};

/// A workflow run as returned by the runs endpoints and `workflow_run`
/// webhook payloads.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowRun {
    pub id: RunId,
    pub name: Option<String>,
    pub status: Option<String>,
    pub conclusion: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub html_url: Option<String>,
    pub logs_url: Option<String>,
    pub event: Option<String>,
    pub head_branch: Option<String>,
    pub path: Option<String>,
}

impl WorkflowRun {
    pub fn run_status(&self) -> RunStatus {
        self.status.as_deref().map(RunStatus::from_api).unwrap_or(RunStatus::Queued)
    }

    pub fn run_conclusion(&self) -> Conclusion { Conclusion::from_api(self.conclusion.as_deref()) }
}

#[derive(Deserialize)]
struct RunList {
    workflow_runs: Vec<WorkflowRun>,
}

#[derive(Deserialize)]
struct JobList {
    jobs: Vec<Job>,
}

#[derive(Deserialize)]
struct Job {
    id: JobId,
    name: String,
    status: String,
    conclusion: Option<String>,
    #[serde(default)]
    steps: Vec<Step>,
}

#[derive(Deserialize)]
struct Step {
    number: u64,
    name: String,
    status: String,
    conclusion: Option<String>,
}

impl From<Job> for JobOutcome {
    fn from(job: Job) -> Self {
        let status = RunStatus::from_api(&job.status);
        JobOutcome {
            id: job.id,
            name: job.name,
            status,
            conclusion: status
                .is_terminal()
                .then(|| Conclusion::from_api(job.conclusion.as_deref())),
            steps: job
                .steps
                .into_iter()
                .map(|step| {
                    let status = RunStatus::from_api(&step.status);
                    StepOutcome {
                        number: step.number,
                        name: step.name,
                        status,
                        conclusion: status
                            .is_terminal()
                            .then(|| Conclusion::from_api(step.conclusion.as_deref())),
                    }
                })
                .collect(),
        }
    }
}

/// Where the poller is in the life of a dispatched run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    Searching,
    Queued,
    InProgress,
    Completed,
}

impl From<RunStatus> for PollState {
    fn from(status: RunStatus) -> Self {
        match status {
            RunStatus::Queued => Self::Queued,
            RunStatus::InProgress => Self::InProgress,
            RunStatus::Completed => Self::Completed,
        }
    }
}

impl fmt::Display for PollState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Searching => "searching",
            Self::Queued => "queued",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
        })
    }
}

/// The earliest run created at or after `dispatched_at`, lowest id first on
/// ties. Older runs belong to someone else's dispatch.
pub fn select_run(runs: &[WorkflowRun], dispatched_at: OffsetDateTime) -> Option<&WorkflowRun> {
    runs.iter()
        .filter(|run| run.created_at >= dispatched_at)
        .min_by_key(|run| (run.created_at, run.id))
}

/// Non-negative `later - earlier`.
fn elapsed(earlier: OffsetDateTime, later: OffsetDateTime) -> Duration {
    if later > earlier { (later - earlier).unsigned_abs() } else { Duration::ZERO }
}

pub struct RunPoller {
    github: GitHub,
    config: PollConfig,
}

impl RunPoller {
    pub fn new(github: GitHub, config: PollConfig) -> Self { Self { github, config } }

    async fn list_runs(&self, ack: &DispatchAck) -> Result<Vec<WorkflowRun>> {
        let repo = &ack.workflow.repo;
        let endpoint = format!(
            "/repos/{}/{}/actions/workflows/{}/runs",
            repo.owner,
            repo.name,
            ack.workflow.file_name()
        );
        let created = ack
            .dispatched_at
            .format(&Rfc3339)
            .map_err(|e| Error::InvalidRequest(format!("Unformattable dispatch time: {e}")))?;
        let query = [("event", "workflow_dispatch".to_string()), ("created", format!(">={created}"))];
        let list: RunList = self.github.get_query(&endpoint, &query).await?;
        Ok(list.workflow_runs)
    }

    /// Searches for the run created by `ack`, backing off from the initial
    /// to the maximum delay, until the search window closes.
    pub async fn correlate(&self, ack: &DispatchAck, cancel: &CancelSignal) -> Result<RunHandle> {
        let clock = self.github.clock();
        let window = self.config.search_window();
        let started = clock.now();
        let mut backoff = self.config.search_initial_backoff();
        tracing::info!("Searching for run of {} dispatched at {}", ack.workflow.path, ack.dispatched_at);
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let runs = run_or_cancel(cancel, self.list_runs(ack)).await?;
            if let Some(run) = select_run(&runs, ack.dispatched_at) {
                tracing::info!("Correlated run {} (created {})", run.id, run.created_at);
                return Ok(RunHandle {
                    run_id: run.id,
                    repo: ack.workflow.repo.clone(),
                    created_after: ack.dispatched_at,
                    html_url: run.html_url.clone(),
                });
            }
            let waited = elapsed(started, clock.now());
            if waited >= window {
                return Err(Error::CorrelationTimeout {
                    workflow: ack.workflow.path.clone(),
                    waited,
                });
            }
            tracing::debug!("No run yet after {:?}, retrying in {:?}", waited, backoff);
            sleep_or_cancel(clock, cancel, backoff.min(window - waited)).await?;
            backoff = (backoff * 2).min(self.config.search_max_backoff());
        }
    }

    pub async fn get_run(&self, handle: &RunHandle) -> Result<WorkflowRun> {
        let endpoint =
            format!("/repos/{}/{}/actions/runs/{}", handle.repo.owner, handle.repo.name, handle.run_id);
        self.github.get(&endpoint).await
    }

    pub async fn jobs(&self, handle: &RunHandle) -> Result<Vec<JobOutcome>> {
        let endpoint = format!(
            "/repos/{}/{}/actions/runs/{}/jobs",
            handle.repo.owner, handle.repo.name, handle.run_id
        );
        let list: JobList =
            self.github.get_query(&endpoint, &PageParams { per_page: PER_PAGE, page: 1 }).await?;
        Ok(list.jobs.into_iter().map(JobOutcome::from).collect())
    }

    /// Polls `handle` until it completes. Fails with [`Error::RunTimeout`] if
    /// the run is still going once the timeout since dispatch has passed.
    pub async fn wait(&self, handle: &RunHandle, cancel: &CancelSignal) -> Result<RunResult> {
        let clock = self.github.clock();
        let timeout = self.config.timeout();
        let interval = self.config.poll_interval();
        let mut state = PollState::Searching;
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let run = run_or_cancel(cancel, self.get_run(handle)).await?;
            let status = run.run_status();
            let next = PollState::from(status);
            if next != state {
                tracing::info!("Run {}: {} -> {}", handle.run_id, state, next);
                state = next;
            }
            if status.is_terminal() {
                let jobs = run_or_cancel(cancel, self.jobs(handle)).await?;
                return Ok(RunResult {
                    run_id: handle.run_id,
                    status,
                    conclusion: run.run_conclusion(),
                    html_url: run.html_url.or_else(|| handle.html_url.clone()),
                    jobs,
                    logs_url: run.logs_url,
                });
            }
            let spent = elapsed(handle.created_after, clock.now());
            if spent >= timeout {
                return Err(Error::RunTimeout { run_id: handle.run_id, status, elapsed: spent });
            }
            sleep_or_cancel(clock, cancel, interval.min(timeout - spent)).await?;
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use indent_core::models::RunId;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{method, path},
    };

    pub const RUNS: &str =
        "/repos/exponent-run/workflow-test/actions/workflows/test-workflow.yml/runs";

    pub fn run_json(id: u64, created_at: &str, status: &str, conclusion: Option<&str>) -> serde_json::Value {
        serde_json::json!({
            "id": id,
            "name": "Test Workflow",
            "status": status,
            "conclusion": conclusion,
            "created_at": created_at,
            "event": "workflow_dispatch",
            "head_branch": "main",
            "path": ".github/workflows/test-workflow.yml",
            "html_url": format!("https://github.com/exponent-run/workflow-test/actions/runs/{id}"),
            "logs_url": format!("https://api.github.com/repos/exponent-run/workflow-test/actions/runs/{id}/logs"),
        })
    }

    pub fn run_path(id: RunId) -> String {
        format!("/repos/exponent-run/workflow-test/actions/runs/{id}")
    }

    /// Serves the run's jobs: one job with a single successful step.
    pub async fn mount_jobs(server: &MockServer, id: RunId) {
        Mock::given(method("GET"))
            .and(path(format!("{}/jobs", run_path(id))))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "total_count": 1,
                "jobs": [{
                    "id": 900,
                    "name": "greet",
                    "status": "completed",
                    "conclusion": "success",
                    "steps": [
                        { "number": 1, "name": "Say hi", "status": "completed", "conclusion": "success" },
                    ],
                }],
            })))
            .mount(server)
            .await;
    }
}
