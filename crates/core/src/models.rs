use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

macro_rules! id_type {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl $name {
            pub const fn into_inner(self) -> u64 { self.0 }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self { Self(value) }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { self.0.fmt(f) }
        }
    };
}

id_type!(AppId);
id_type!(InstallationId);
id_type!(RunId);
id_type!(JobId);

/// An `owner/name` repository coordinate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepoRef {
    pub owner: String,
    pub name: String,
}

impl RepoRef {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self { owner: owner.into(), name: name.into() }
    }
}

impl fmt::Display for RepoRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

impl FromStr for RepoRef {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((owner, name))
                if !owner.is_empty() && !name.is_empty() && !name.contains('/') =>
            {
                Ok(Self::new(owner, name))
            }
            _ => Err(format!("expected owner/name, got '{s}'")),
        }
    }
}

/// Read-only descriptor of the workflow file being inspected and dispatched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowRef {
    pub repo: RepoRef,
    /// Path of the workflow file, e.g. `.github/workflows/test-workflow.yml`.
    pub path: String,
    pub default_branch: String,
}

impl WorkflowRef {
    /// The identifier accepted by the actions endpoints (the file name).
    pub fn file_name(&self) -> &str {
        self.path.rsplit_once('/').map_or(self.path.as_str(), |(_, name)| name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    pub content: String,
}

impl FileChange {
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self { path: path.into(), content: content.into() }
    }
}

/// A set of files to land on a fresh branch and propose as a pull request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishRequest {
    pub branch_name: String,
    pub base_branch: String,
    /// Applied in order; a later entry for the same path replaces an earlier one.
    pub files: Vec<FileChange>,
    pub commit_message: String,
    pub pr_title: String,
    pub pr_body: String,
    /// Posted on the pull request after it is opened.
    pub comment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PrHandle {
    pub number: u64,
    pub url: String,
    pub branch: String,
    pub commit_sha: String,
}

/// An open pull request found while checking for the workflow file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PrSummary {
    pub number: u64,
    pub title: String,
    pub url: String,
    pub author: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub created_at: Option<OffsetDateTime>,
}

/// Acknowledgement of a workflow dispatch. The platform returns no run id, so
/// this only records what was asked for and when.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchAck {
    pub workflow: WorkflowRef,
    pub git_ref: String,
    /// Truncated to whole seconds, matching the precision of run timestamps.
    pub dispatched_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunHandle {
    pub run_id: RunId,
    pub repo: RepoRef,
    pub created_after: OffsetDateTime,
    pub html_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    InProgress,
    Completed,
}

impl RunStatus {
    /// Maps the platform's status string. Pre-start states (`requested`,
    /// `waiting`, `pending`) are all treated as queued.
    pub fn from_api(s: &str) -> Self {
        match s {
            "in_progress" => Self::InProgress,
            "completed" => Self::Completed,
            _ => Self::Queued,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
        }
    }

    pub fn is_terminal(&self) -> bool { matches!(self, Self::Completed) }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Conclusion {
    Success,
    Failure,
    Cancelled,
    TimedOut,
    Unknown,
}

impl Conclusion {
    pub fn from_api(s: Option<&str>) -> Self {
        match s {
            Some("success") => Self::Success,
            Some("failure") => Self::Failure,
            Some("cancelled") => Self::Cancelled,
            Some("timed_out") => Self::TimedOut,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Cancelled => "cancelled",
            Self::TimedOut => "timed_out",
            Self::Unknown => "unknown",
        }
    }

    pub fn is_success(&self) -> bool { matches!(self, Self::Success) }
}

impl fmt::Display for Conclusion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepOutcome {
    pub number: u64,
    pub name: String,
    pub status: RunStatus,
    pub conclusion: Option<Conclusion>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobOutcome {
    pub id: JobId,
    pub name: String,
    pub status: RunStatus,
    pub conclusion: Option<Conclusion>,
    pub steps: Vec<StepOutcome>,
}

/// Final state of a workflow run. Immutable once `status` is completed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunResult {
    pub run_id: RunId,
    pub status: RunStatus,
    /// Only meaningful when `status` is completed.
    pub conclusion: Conclusion,
    pub html_url: Option<String>,
    pub jobs: Vec<JobOutcome>,
    /// Endpoint serving the zipped log archive.
    pub logs_url: Option<String>,
}

impl RunResult {
    pub fn succeeded(&self) -> bool { self.status.is_terminal() && self.conclusion.is_success() }
}
