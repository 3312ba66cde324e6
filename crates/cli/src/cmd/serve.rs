use std::{
    net::{Ipv4Addr, SocketAddr},
    process::ExitCode,
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use argp::FromArgs;
use axum::{
    Json, Router,
    extract::{FromRef, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use indent_core::config::Config;
use indent_github::{
    auth::Credentials,
    webhook::{EventOutcome, GitHubEvent, handle_event},
};
use tokio::net::TcpListener;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::util;

#[derive(FromArgs, PartialEq, Eq, Debug)]
/// Listen for GitHub App webhook events.
#[argp(subcommand, name = "serve")]
pub struct Args {
    #[argp(option, short = 'p')]
    /// port to listen on (default: server.port from the config, 3000)
    port: Option<u16>,
}

#[derive(Clone, FromRef)]
pub struct AppState {
    config: Arc<Config>,
    credentials: Arc<Credentials>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/webhook", post(webhook))
        .route("/health", get(health))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(30),
        ))
}

async fn health() -> impl IntoResponse { Json(serde_json::json!({ "status": "healthy" })) }

async fn webhook(
    State(state): State<AppState>,
    GitHubEvent { event }: GitHubEvent,
) -> impl IntoResponse {
    // Log the event source
    if let Some(full_name) = event.repository.as_ref().and_then(|r| r.full_name.as_ref()) {
        tracing::info!("Received webhook event {:?} from repository {}", event.kind, full_name);
    } else if let Some(organization) = &event.organization {
        tracing::info!("Received webhook event {:?} from org {}", event.kind, organization.login);
    } else if let Some(sender) = &event.sender {
        tracing::info!("Received webhook event {:?} from @{}", event.kind, sender.login);
    } else {
        tracing::info!("Received webhook event {:?} from unknown source", event.kind);
    }

    let outcome = handle_event(&state.credentials, &event).await;
    let message = match outcome {
        EventOutcome::InstallationRemoved(_) => "Installation removed",
        EventOutcome::WorkflowRun { .. } => "Workflow run logged",
        EventOutcome::Ignored => "Event ignored",
    };
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok", "message": message })))
}

pub async fn run(args: Args, config: Config) -> Result<ExitCode> {
    let credentials = util::credentials(&config)?;
    if config.github.app.webhook_secret.is_none() {
        tracing::warn!("No webhook secret configured, signatures will not be verified");
    }
    let port = args.port.unwrap_or(config.server.port);
    let state = AppState { config: Arc::new(config), credentials };

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    let listener = TcpListener::bind(addr).await.with_context(|| format!("Failed to bind {addr}"))?;
    tracing::info!("Web server: Listening on {}", addr);
    axum::serve(listener, app(state))
        .with_graceful_shutdown(util::shutdown_signal())
        .await
        .context("Web server error")?;
    tracing::info!("Shut down gracefully");
    Ok(ExitCode::SUCCESS)
}
