//! The end-to-end flow: make sure the workflow exists, dispatch it, find and
//! wait for the run, then collect its logs.
//!
//! Steps run strictly in order. Only idempotent reads (the existence check,
//! the status wait and the log download) are retried after a transient
//! failure; dispatch and publish are never repeated.

use std::{collections::BTreeMap, future::Future, time::Duration};

use indent_core::{
    config::PollConfig,
    models::{PrHandle, PrSummary, PublishRequest, RunHandle, RunResult, WorkflowRef},
};

use crate::{
    Error, GitHub, Result,
    clock::{CancelSignal, sleep_or_cancel},
    contents, dispatch,
    logs::{self, RunLogs},
    publish,
    runs::RunPoller,
};

const RETRY_BASE_DELAY: Duration = Duration::from_secs(1);

/// What the repository currently holds for a workflow path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowStatus {
    Present,
    /// Absent on the branch, but open pull requests add it.
    PendingPullRequests(Vec<PrSummary>),
    Missing,
}

/// Result of [`Orchestrator::ensure_workflow`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowState {
    Present,
    PullRequestOpen(PrSummary),
    PullRequestCreated(PrHandle),
    /// Absent, and nothing was published.
    Missing,
}

#[derive(Debug)]
pub struct RunReport {
    pub handle: RunHandle,
    pub result: RunResult,
    /// `None` when the run produced no downloadable logs.
    pub logs: Option<RunLogs>,
}

#[derive(Debug)]
pub enum RunOutcome {
    /// The workflow is not on the branch yet; a pull request has to be merged
    /// before it can run.
    AwaitingMerge(WorkflowState),
    Completed(RunReport),
}

pub struct Orchestrator {
    github: GitHub,
    poll: PollConfig,
}

impl Orchestrator {
    pub fn new(github: GitHub, poll: PollConfig) -> Self { Self { github, poll } }

    pub fn github(&self) -> &GitHub { &self.github }

    /// Runs `op`, repeating it after transient failures up to the configured
    /// number of retries with doubling delays.
    async fn retrying<T, F, Fut>(&self, step: &str, cancel: &CancelSignal, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let retries = self.poll.transient_retries;
        let mut delay = RETRY_BASE_DELAY;
        let mut attempt = 0;
        loop {
            match op().await {
                Err(e) if e.is_transient() && attempt < retries => {
                    attempt += 1;
                    tracing::warn!("{} failed: {} (retry {}/{} in {:?})", step, e, attempt, retries, delay);
                    sleep_or_cancel(self.github.clock(), cancel, delay).await?;
                    delay *= 2;
                }
                result => return result,
            }
        }
    }

    pub async fn workflow_status(
        &self,
        workflow: &WorkflowRef,
        git_ref: &str,
        cancel: &CancelSignal,
    ) -> Result<WorkflowStatus> {
        let github = &self.github;
        let present = self
            .retrying("inspect", cancel, move || {
                contents::exists(github, &workflow.repo, &workflow.path, git_ref)
            })
            .await?;
        if present {
            return Ok(WorkflowStatus::Present);
        }
        let pulls =
            contents::find_pull_requests_touching(github, &workflow.repo, &workflow.path).await?;
        if pulls.is_empty() {
            Ok(WorkflowStatus::Missing)
        } else {
            tracing::info!("{} is pending in {} open pull request(s)", workflow.path, pulls.len());
            Ok(WorkflowStatus::PendingPullRequests(pulls))
        }
    }

    /// Publishes `request` when the workflow is neither on `git_ref` nor in an
    /// open pull request.
    pub async fn ensure_workflow(
        &self,
        workflow: &WorkflowRef,
        git_ref: &str,
        request: Option<&PublishRequest>,
        cancel: &CancelSignal,
    ) -> Result<WorkflowState> {
        match self.workflow_status(workflow, git_ref, cancel).await? {
            WorkflowStatus::Present => Ok(WorkflowState::Present),
            WorkflowStatus::PendingPullRequests(mut pulls) => {
                Ok(WorkflowState::PullRequestOpen(pulls.swap_remove(0)))
            }
            WorkflowStatus::Missing => match request {
                Some(request) => {
                    self.publish_workflow(workflow, request).await.map(WorkflowState::PullRequestCreated)
                }
                None => Ok(WorkflowState::Missing),
            },
        }
    }

    /// Opens the pull request for `request` without inspecting the repository
    /// first. For callers that already hold a [`WorkflowStatus::Missing`].
    pub async fn publish_workflow(
        &self,
        workflow: &WorkflowRef,
        request: &PublishRequest,
    ) -> Result<PrHandle> {
        publish::publish(&self.github, &workflow.repo, request).await
    }

    /// Dispatches the workflow and follows the run to completion. Assumes the
    /// workflow exists on `git_ref`.
    pub async fn execute(
        &self,
        workflow: &WorkflowRef,
        git_ref: &str,
        inputs: &BTreeMap<String, String>,
        cancel: &CancelSignal,
    ) -> Result<RunReport> {
        let ack = dispatch::dispatch(&self.github, workflow, git_ref, inputs).await?;
        let poller = RunPoller::new(self.github.clone(), self.poll.clone());
        let handle = poller.correlate(&ack, cancel).await?;
        let result = self.retrying("wait", cancel, || poller.wait(&handle, cancel)).await?;
        tracing::info!("Run {} finished: {}", handle.run_id, result.conclusion);

        let github = &self.github;
        let run_id = handle.run_id;
        let logs = match self
            .retrying("logs", cancel, move || logs::fetch_logs(github, &workflow.repo, run_id))
            .await
        {
            Ok(logs) => Some(logs),
            Err(e @ (Error::LogsUnavailable { .. } | Error::Archive { .. })) => {
                tracing::warn!("{}", e);
                None
            }
            Err(e) => return Err(e),
        };
        Ok(RunReport { handle, result, logs })
    }

    /// The whole flow. Without a publish request a missing workflow is an
    /// error; with one, the pull request is opened and the run deferred.
    pub async fn run(
        &self,
        workflow: &WorkflowRef,
        git_ref: &str,
        inputs: &BTreeMap<String, String>,
        request: Option<&PublishRequest>,
        cancel: &CancelSignal,
    ) -> Result<RunOutcome> {
        match self.ensure_workflow(workflow, git_ref, request, cancel).await? {
            WorkflowState::Present => {}
            WorkflowState::Missing => {
                return Err(Error::NotFound {
                    endpoint: format!(
                        "/repos/{}/{}/contents/{}",
                        workflow.repo.owner, workflow.repo.name, workflow.path
                    ),
                    body: format!("{} does not exist on {git_ref}", workflow.path),
                });
            }
            state => return Ok(RunOutcome::AwaitingMerge(state)),
        }
        self.execute(workflow, git_ref, inputs, cancel).await.map(RunOutcome::Completed)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use indent_core::models::{Conclusion, FileChange, RunId, RunStatus};
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{body_json, body_partial_json, method, path, query_param},
    };

    use super::*;
    use crate::{
        ErrorKind,
        clock::testing::ManualClock,
        logs::testing::{log_archive, mount_logs},
        publish::testing::{ROOT, mount_publish},
        runs::testing::{RUNS, mount_jobs, run_json, run_path},
        testing::*,
    };

    const CONTENTS: &str =
        "/repos/exponent-run/workflow-test/contents/.github/workflows/test-workflow.yml";
    const DISPATCHES: &str =
        "/repos/exponent-run/workflow-test/actions/workflows/test-workflow.yml/dispatches";

    fn request() -> PublishRequest {
        PublishRequest {
            branch_name: "add-workflow".to_string(),
            base_branch: "main".to_string(),
            files: vec![FileChange::new(".github/workflows/test-workflow.yml", "on: push\n")],
            commit_message: "Add test workflow".to_string(),
            pr_title: "Add test workflow".to_string(),
            pr_body: "Adds a workflow that says hi".to_string(),
            comment: Some("Hi from Indent".to_string()),
        }
    }

    async fn orchestrator(server: &MockServer, poll: PollConfig) -> Orchestrator {
        let github = github(server, Arc::new(ManualClock::start())).await;
        Orchestrator::new(github, poll)
    }

    async fn mount_contents(server: &MockServer, status: u16) {
        Mock::given(method("GET"))
            .and(path(CONTENTS))
            .and(query_param("ref", "main"))
            .respond_with(ResponseTemplate::new(status).set_body_json(serde_json::json!({})))
            .mount(server)
            .await;
    }

    async fn mount_dispatch(server: &MockServer, times: u64) {
        Mock::given(method("POST"))
            .and(path(DISPATCHES))
            .and(body_json(serde_json::json!({ "ref": "main" })))
            .respond_with(ResponseTemplate::new(204))
            .expect(times)
            .mount(server)
            .await;
    }

    /// The run appears two seconds after dispatch, on the second search.
    async fn mount_run_search(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path(RUNS))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({ "workflow_runs": [] })),
            )
            .up_to_n_times(1)
            .with_priority(1)
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path(RUNS))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "workflow_runs": [run_json(1001, "2025-03-01T12:00:02Z", "queued", None)],
            })))
            .mount(server)
            .await;
    }

    async fn mount_run_status(server: &MockServer, sequence: &[(&str, Option<&str>)]) {
        for (i, (status, conclusion)) in sequence.iter().enumerate() {
            let last = i + 1 == sequence.len();
            let mock = Mock::given(method("GET")).and(path(run_path(RunId(1001)))).respond_with(
                ResponseTemplate::new(200).set_body_json(run_json(
                    1001,
                    "2025-03-01T12:00:02Z",
                    status,
                    *conclusion,
                )),
            );
            let mock = if last { mock } else { mock.up_to_n_times(1) };
            mock.with_priority(i as u8 + 1).mount(server).await;
        }
    }

    #[tokio::test]
    async fn test_publish_workflow_skips_inspection() {
        let server = MockServer::start().await;
        Mock::given(path(CONTENTS))
            .respond_with(ResponseTemplate::new(404))
            .expect(0)
            .mount(&server)
            .await;
        Mock::given(path(format!("{ROOT}/pulls")))
            .and(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .expect(0)
            .mount(&server)
            .await;
        mount_publish(&server, 21).await;
        let orchestrator = orchestrator(&server, PollConfig::default()).await;

        let mut request = request();
        request.comment = None;
        let pr = orchestrator.publish_workflow(&workflow(), &request).await.unwrap();
        assert_eq!(pr.number, 21);
    }

    #[tokio::test]
    async fn test_missing_workflow_opens_pull_request() {
        let server = MockServer::start().await;
        mount_contents(&server, 404).await;
        Mock::given(method("GET"))
            .and(path(format!("{ROOT}/pulls")))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .mount(&server)
            .await;
        mount_publish(&server, 17).await;
        Mock::given(method("POST"))
            .and(path(format!("{ROOT}/issues/17/comments")))
            .and(body_partial_json(serde_json::json!({ "body": "Hi from Indent" })))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({ "id": 1 })))
            .expect(1)
            .mount(&server)
            .await;
        mount_dispatch(&server, 0).await;
        let orchestrator = orchestrator(&server, PollConfig::default()).await;

        let outcome = orchestrator
            .run(&workflow(), "main", &BTreeMap::new(), Some(&request()), &CancelSignal::never())
            .await
            .unwrap();
        match outcome {
            RunOutcome::AwaitingMerge(WorkflowState::PullRequestCreated(pr)) => {
                assert_eq!(pr.number, 17);
                assert_eq!(pr.branch, "add-workflow");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_open_pull_request_is_reported_not_duplicated() {
        let server = MockServer::start().await;
        mount_contents(&server, 404).await;
        Mock::given(method("GET"))
            .and(path(format!("{ROOT}/pulls")))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                { "number": 4, "title": "Add test workflow", "html_url": "https://example/pull/4" },
            ])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("{ROOT}/pulls/4/files")))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                { "filename": ".github/workflows/test-workflow.yml" },
            ])))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(format!("{ROOT}/git/blobs")))
            .respond_with(ResponseTemplate::new(201))
            .expect(0)
            .mount(&server)
            .await;
        let orchestrator = orchestrator(&server, PollConfig::default()).await;

        let state = orchestrator
            .ensure_workflow(&workflow(), "main", Some(&request()), &CancelSignal::never())
            .await
            .unwrap();
        match state {
            WorkflowState::PullRequestOpen(pr) => assert_eq!(pr.number, 4),
            other => panic!("unexpected state: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_workflow_without_request_is_not_found() {
        let server = MockServer::start().await;
        mount_contents(&server, 404).await;
        Mock::given(method("GET"))
            .and(path(format!("{ROOT}/pulls")))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .mount(&server)
            .await;
        mount_dispatch(&server, 0).await;
        let orchestrator = orchestrator(&server, PollConfig::default()).await;

        let err = orchestrator
            .run(&workflow(), "main", &BTreeMap::new(), None, &CancelSignal::never())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_dispatched_run_completes_with_logs() {
        let server = MockServer::start().await;
        mount_contents(&server, 200).await;
        mount_dispatch(&server, 1).await;
        mount_run_search(&server).await;
        mount_run_status(&server, &[("queued", None), ("in_progress", None), (
            "completed",
            Some("success"),
        )])
        .await;
        mount_jobs(&server, RunId(1001)).await;
        mount_logs(&server, RunId(1001), log_archive(&[("greet/2_Say hi.txt", "hi\n")])).await;
        let orchestrator = orchestrator(&server, PollConfig::default()).await;

        let outcome = orchestrator
            .run(&workflow(), "main", &BTreeMap::new(), Some(&request()), &CancelSignal::never())
            .await
            .unwrap();
        let RunOutcome::Completed(report) = outcome else {
            panic!("unexpected outcome: {outcome:?}");
        };
        assert_eq!(report.handle.run_id, RunId(1001));
        assert_eq!(report.result.status, RunStatus::Completed);
        assert_eq!(report.result.conclusion, Conclusion::Success);
        assert!(report.result.succeeded());
        let logs = report.logs.expect("logs");
        assert!(logs.text().contains("hi"));
    }

    #[tokio::test]
    async fn test_run_still_in_progress_times_out() {
        let server = MockServer::start().await;
        mount_contents(&server, 200).await;
        mount_dispatch(&server, 1).await;
        mount_run_search(&server).await;
        mount_run_status(&server, &[("in_progress", None)]).await;
        Mock::given(path(format!("{}/logs", run_path(RunId(1001)))))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;
        let poll = PollConfig { timeout_secs: 120, ..PollConfig::default() };
        let orchestrator = orchestrator(&server, poll).await;

        let err = orchestrator
            .run(&workflow(), "main", &BTreeMap::new(), None, &CancelSignal::never())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RunTimeout);
        assert!(matches!(err, Error::RunTimeout { status: RunStatus::InProgress, .. }));
    }

    #[tokio::test]
    async fn test_missing_logs_do_not_fail_the_run() {
        let server = MockServer::start().await;
        mount_contents(&server, 200).await;
        mount_dispatch(&server, 1).await;
        mount_run_search(&server).await;
        mount_run_status(&server, &[("completed", Some("cancelled"))]).await;
        mount_jobs(&server, RunId(1001)).await;
        Mock::given(path(format!("{}/logs", run_path(RunId(1001)))))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        let orchestrator = orchestrator(&server, PollConfig::default()).await;

        let report = orchestrator
            .execute(&workflow(), "main", &BTreeMap::new(), &CancelSignal::never())
            .await
            .unwrap();
        assert_eq!(report.result.conclusion, Conclusion::Cancelled);
        assert!(report.logs.is_none());
    }

    #[tokio::test]
    async fn test_transient_inspect_is_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(CONTENTS))
            .respond_with(ResponseTemplate::new(502).set_body_string("Bad Gateway"))
            .up_to_n_times(2)
            .with_priority(1)
            .expect(2)
            .mount(&server)
            .await;
        mount_contents(&server, 200).await;
        let orchestrator = orchestrator(&server, PollConfig::default()).await;

        let status = orchestrator
            .workflow_status(&workflow(), "main", &CancelSignal::never())
            .await
            .unwrap();
        assert_eq!(status, WorkflowStatus::Present);
    }

    #[tokio::test]
    async fn test_transient_retries_are_bounded() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(CONTENTS))
            .respond_with(ResponseTemplate::new(503))
            .expect(2)
            .mount(&server)
            .await;
        let poll = PollConfig { transient_retries: 1, ..PollConfig::default() };
        let orchestrator = orchestrator(&server, poll).await;

        let err = orchestrator
            .workflow_status(&workflow(), "main", &CancelSignal::never())
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_dispatch_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(DISPATCHES))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;
        let orchestrator = orchestrator(&server, PollConfig::default()).await;

        let err = orchestrator
            .execute(&workflow(), "main", &BTreeMap::new(), &CancelSignal::never())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transient);
    }
}
