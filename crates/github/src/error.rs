use std::{fmt, time::Duration};

use http::StatusCode;
use indent_core::models::{RunId, RunStatus};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Bad credentials or key material. Never retried.
    #[error("{0}")]
    Config(String),
    #[error("{endpoint} rejected credentials ({status}): {body}")]
    Auth { endpoint: String, status: StatusCode, body: String },
    #[error("{endpoint} not found: {body}")]
    NotFound { endpoint: String, body: String },
    #[error("{endpoint} conflict: {body}")]
    Conflict { endpoint: String, body: String },
    #[error("{endpoint} failed ({status}): {body}")]
    Api { endpoint: String, status: StatusCode, body: String },
    #[error("{endpoint} temporarily unavailable: {message}")]
    Transient { endpoint: String, status: Option<StatusCode>, message: String },
    #[error("failed to decode response from {endpoint}: {source}")]
    Decode {
        endpoint: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("{0}")]
    InvalidRequest(String),
    #[error("no run of {workflow} appeared within {waited:?} of dispatch")]
    CorrelationTimeout { workflow: String, waited: Duration },
    #[error("run {run_id} still {status} after {elapsed:?}")]
    RunTimeout { run_id: RunId, status: RunStatus, elapsed: Duration },
    #[error("publish failed at {step}: {source}")]
    Publish {
        step: PublishStep,
        #[source]
        source: Box<Error>,
    },
    #[error("logs for run {run_id} are unavailable")]
    LogsUnavailable { run_id: RunId },
    #[error("log archive for run {run_id} is unreadable: {source}")]
    Archive {
        run_id: RunId,
        #[source]
        source: zip::result::ZipError,
    },
    #[error("cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Config,
    Auth,
    NotFound,
    Conflict,
    Api,
    Transient,
    InvalidRequest,
    CorrelationTimeout,
    RunTimeout,
    Publish,
    LogsUnavailable,
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Config => "config",
            Self::Auth => "auth",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::Api => "api",
            Self::Transient => "transient",
            Self::InvalidRequest => "invalid_request",
            Self::CorrelationTimeout => "correlation_timeout",
            Self::RunTimeout => "run_timeout",
            Self::Publish => "publish",
            Self::LogsUnavailable => "logs_unavailable",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::Config,
            Self::Auth { .. } => ErrorKind::Auth,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::Api { .. } | Self::Decode { .. } => ErrorKind::Api,
            Self::Transient { .. } => ErrorKind::Transient,
            Self::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Self::CorrelationTimeout { .. } => ErrorKind::CorrelationTimeout,
            Self::RunTimeout { .. } => ErrorKind::RunTimeout,
            Self::Publish { .. } => ErrorKind::Publish,
            Self::LogsUnavailable { .. } | Self::Archive { .. } => ErrorKind::LogsUnavailable,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Whether the orchestration boundary may retry the failed step.
    pub fn is_transient(&self) -> bool { matches!(self, Self::Transient { .. }) }

    pub fn is_not_found(&self) -> bool { matches!(self, Self::NotFound { .. }) }

    /// True for a conflict, including one raised inside a publish step.
    pub fn is_conflict(&self) -> bool {
        match self {
            Self::Conflict { .. } => true,
            Self::Publish { source, .. } => source.is_conflict(),
            _ => false,
        }
    }

    pub(crate) fn publish(step: PublishStep) -> impl FnOnce(Error) -> Error {
        move |source| Self::Publish { step, source: Box::new(source) }
    }

    /// Maps an unsuccessful response onto the error taxonomy.
    pub(crate) fn from_status(endpoint: String, status: StatusCode, body: String) -> Self {
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Self::Auth { endpoint, status, body }
            }
            StatusCode::NOT_FOUND => Self::NotFound { endpoint, body },
            StatusCode::CONFLICT => Self::Conflict { endpoint, body },
            StatusCode::TOO_MANY_REQUESTS => {
                Self::Transient { endpoint, status: Some(status), message: body }
            }
            status if status.is_server_error() => {
                Self::Transient { endpoint, status: Some(status), message: body }
            }
            status => Self::Api { endpoint, status, body },
        }
    }

    pub(crate) fn from_reqwest(endpoint: String, err: reqwest::Error) -> Self {
        Self::Transient { endpoint, status: err.status(), message: err.to_string() }
    }
}

/// The individual Git data / pulls calls that make up a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PublishStep {
    ResolveBase,
    CreateBlob,
    CreateTree,
    CreateCommit,
    CreateRef,
    OpenPullRequest,
    PostComment,
}

impl PublishStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ResolveBase => "resolve_base",
            Self::CreateBlob => "create_blob",
            Self::CreateTree => "create_tree",
            Self::CreateCommit => "create_commit",
            Self::CreateRef => "create_ref",
            Self::OpenPullRequest => "open_pull_request",
            Self::PostComment => "post_comment",
        }
    }
}

impl fmt::Display for PublishStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}
