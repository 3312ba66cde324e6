use std::{collections::BTreeMap, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use url::Url;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub github: GitHubConfig,
    #[serde(default)]
    pub workflow: WorkflowConfig,
    #[serde(default)]
    pub publish: PublishConfig,
    #[serde(default)]
    pub poll: PollConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self { Self { port: 3000 } }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GitHubConfig {
    #[serde(default = "default_api_url")]
    pub api_url: Url,
    pub owner: String,
    pub repo: String,
    pub app: GitHubAppConfig,
}

fn default_api_url() -> Url {
    Url::parse("https://api.github.com").expect("static URL is valid")
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GitHubAppConfig {
    pub id: u64,
    /// Inline PEM. Takes precedence over `private_key_path`.
    pub private_key: Option<String>,
    pub private_key_path: Option<PathBuf>,
    /// Looked up from the repository owner when absent.
    pub installation_id: Option<u64>,
    pub webhook_secret: Option<String>,
    /// Installation tokens are re-minted this long before they expire.
    #[serde(default = "default_token_refresh_margin")]
    pub token_refresh_margin_secs: u64,
}

fn default_token_refresh_margin() -> u64 { 600 }

impl GitHubAppConfig {
    pub fn token_refresh_margin(&self) -> Duration {
        Duration::from_secs(self.token_refresh_margin_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkflowConfig {
    pub path: String,
    /// Branch, tag or SHA to dispatch on. Defaults to the repository's default branch.
    #[serde(rename = "ref")]
    pub git_ref: Option<String>,
    pub inputs: BTreeMap<String, String>,
    /// File published when the workflow is missing.
    pub content_path: Option<PathBuf>,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            path: ".github/workflows/test-workflow.yml".to_string(),
            git_ref: None,
            inputs: BTreeMap::new(),
            content_path: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PublishConfig {
    pub branch: String,
    /// Append a `-YYYYMMDD-HHMMSS` suffix so repeated runs never collide.
    pub unique_branch: bool,
    pub title: String,
    pub body: String,
    pub commit_message: String,
    pub comment: Option<String>,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            branch: "add-workflow".to_string(),
            unique_branch: false,
            title: "Add test workflow".to_string(),
            body: "This PR adds a GitHub Actions workflow that can be triggered manually via \
                   workflow_dispatch.\n\nIt is used for programmatic workflow execution via the \
                   GitHub App."
                .to_string(),
            commit_message: "Add test workflow".to_string(),
            comment: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PollConfig {
    /// How long to look for the dispatched run before giving up.
    pub search_window_secs: u64,
    pub search_initial_backoff_secs: u64,
    pub search_max_backoff_secs: u64,
    pub poll_interval_secs: u64,
    /// Ceiling on the time from dispatch to a completed run.
    pub timeout_secs: u64,
    /// Retries of idempotent steps after a transient failure.
    pub transient_retries: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            search_window_secs: 30,
            search_initial_backoff_secs: 1,
            search_max_backoff_secs: 5,
            poll_interval_secs: 5,
            timeout_secs: 600,
            transient_retries: 2,
        }
    }
}

impl PollConfig {
    pub fn search_window(&self) -> Duration { Duration::from_secs(self.search_window_secs) }

    pub fn search_initial_backoff(&self) -> Duration {
        Duration::from_secs(self.search_initial_backoff_secs.max(1))
    }

    pub fn search_max_backoff(&self) -> Duration {
        Duration::from_secs(self.search_max_backoff_secs.max(self.search_initial_backoff_secs))
    }

    pub fn poll_interval(&self) -> Duration { Duration::from_secs(self.poll_interval_secs.max(1)) }

    pub fn timeout(&self) -> Duration { Duration::from_secs(self.timeout_secs) }
}
