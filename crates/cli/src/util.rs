use std::{fs::File, io::BufReader, sync::Arc};

use anyhow::{Context, Result, bail};
use indent_core::{
    config::Config,
    models::{AppId, FileChange, InstallationId, PublishRequest, RepoRef, WorkflowRef},
};
use indent_github::{
    GitHub,
    api::ApiClient,
    auth::{AppIdentity, Credentials},
    clock::{CancelSignal, SystemClock},
};
use time::{OffsetDateTime, macros::format_description};
use tokio::signal;
use typed_path::Utf8NativePathBuf;

const DEFAULT_WORKFLOW: &str = include_str!("../assets/test-workflow.yml");

// For argp::FromArgs
pub fn native_path(value: &str) -> Result<Utf8NativePathBuf, String> {
    Ok(Utf8NativePathBuf::from(value))
}

pub fn load_config(path: &Utf8NativePathBuf) -> Result<Config> {
    let file = File::open(path.with_platform_encoding())
        .with_context(|| format!("Failed to open config file {}", path))?;
    serde_yaml::from_reader(BufReader::new(file))
        .with_context(|| format!("Failed to parse config file {}", path))
}

fn private_key(config: &Config) -> Result<Vec<u8>> {
    let app = &config.github.app;
    match (&app.private_key, &app.private_key_path) {
        (Some(pem), _) => Ok(pem.as_bytes().to_vec()),
        (None, Some(path)) => std::fs::read(path)
            .with_context(|| format!("Failed to read private key {}", path.display())),
        (None, None) => bail!("github.app.private_key or github.app.private_key_path is required"),
    }
}

pub fn credentials(config: &Config) -> Result<Arc<Credentials>> {
    let identity = AppIdentity::from_pem(AppId(config.github.app.id), &private_key(config)?)?;
    let api = ApiClient::new(config.github.api_url.clone())?;
    Ok(Arc::new(
        Credentials::new(identity, api, Arc::new(SystemClock))
            .with_refresh_margin(config.github.app.token_refresh_margin()),
    ))
}

pub fn repo(config: &Config) -> RepoRef {
    RepoRef::new(config.github.owner.clone(), config.github.repo.clone())
}

/// Client for the installation that covers the configured repository.
pub async fn connect(config: &Config) -> Result<GitHub> {
    let credentials = credentials(config)?;
    let installation_id = match config.github.app.installation_id {
        Some(id) => InstallationId(id),
        None => credentials.find_installation(&config.github.owner).await?,
    };
    Ok(GitHub::new(credentials, installation_id))
}

pub async fn workflow_ref(github: &GitHub, config: &Config) -> Result<WorkflowRef> {
    let repo = repo(config);
    let repository = github.repository(&repo).await?;
    Ok(WorkflowRef {
        repo,
        path: config.workflow.path.clone(),
        default_branch: repository.default_branch.unwrap_or_else(|| "main".to_string()),
    })
}

/// Ref to inspect and dispatch: the configured one, else the default branch.
pub fn git_ref(config: &Config, workflow: &WorkflowRef, explicit: Option<String>) -> String {
    explicit
        .or_else(|| config.workflow.git_ref.clone())
        .unwrap_or_else(|| workflow.default_branch.clone())
}

/// The pull request that adds the workflow file onto `base`.
pub fn publish_request(
    config: &Config,
    workflow: &WorkflowRef,
    base: &str,
    now: OffsetDateTime,
) -> Result<PublishRequest> {
    let content = match &config.workflow.content_path {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read workflow file {}", path.display()))?,
        None => DEFAULT_WORKFLOW.to_string(),
    };
    let publish = &config.publish;
    let branch_name = if publish.unique_branch {
        let suffix = now
            .format(format_description!("[year][month][day]-[hour][minute][second]"))
            .context("Failed to format branch suffix")?;
        format!("{}-{}", publish.branch, suffix)
    } else {
        publish.branch.clone()
    };
    Ok(PublishRequest {
        branch_name,
        base_branch: base.to_string(),
        files: vec![FileChange::new(workflow.path.clone(), content)],
        commit_message: publish.commit_message.clone(),
        pr_title: publish.title.clone(),
        pr_body: publish.body.clone(),
        comment: publish.comment.clone(),
    })
}

pub async fn shutdown_signal() {
    if let Err(e) = shutdown_signal_io().await {
        tracing::error!("Failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
}

async fn shutdown_signal_io() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = signal::ctrl_c() => result,
            _ = sigterm.recv() => Ok(()),
        }
    }
    #[cfg(not(unix))]
    {
        signal::ctrl_c().await
    }
}

/// A cancel signal tripped by Ctrl-C or SIGTERM.
pub fn cancel_on_shutdown() -> CancelSignal {
    let (handle, signal) = CancelSignal::channel();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::warn!("Interrupted, cancelling");
        handle.cancel();
    });
    signal
}
