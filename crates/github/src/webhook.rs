use std::{fmt::Display, sync::Arc};

use axum::{
    body::Bytes,
    extract::{FromRef, FromRequest, Request},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use hmac::{Hmac, Mac};
use indent_core::{config::Config, models::InstallationId};
use octocrab::models::webhook_events::{
    EventInstallation, WebhookEvent, WebhookEventPayload,
    payload::InstallationWebhookEventAction,
};
use sha2::Sha256;

use crate::{auth::Credentials, runs::WorkflowRun};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    #[error("X-Hub-Signature-256 sha256= prefix missing")]
    MissingPrefix,
    #[error("X-Hub-Signature-256 malformed")]
    Malformed,
    #[error("signature mismatch")]
    Mismatch,
}

/// Checks an `X-Hub-Signature-256` header value (`sha256=<hex>`) against the
/// HMAC-SHA256 of `body` keyed with `secret`. The comparison is constant-time.
pub fn verify_signature(secret: &[u8], body: &[u8], header: &str) -> Result<(), SignatureError> {
    let hex_digest = header.strip_prefix("sha256=").ok_or(SignatureError::MissingPrefix)?;
    let signature = hex::decode(hex_digest).map_err(|_| SignatureError::Malformed)?;
    let mut mac = Hmac::<Sha256>::new_from_slice(secret).expect("HMAC can take key of any size");
    mac.update(body);
    mac.verify_slice(&signature).map_err(|_| SignatureError::Mismatch)
}

/// Verify and extract GitHub Event Payload.
#[derive(Clone)]
#[must_use]
pub struct GitHubEvent {
    pub event: WebhookEvent,
}

impl<S> FromRequest<S> for GitHubEvent
where
    Arc<Config>: FromRef<S>,
    S: Send + Sync + Clone,
{
    type Rejection = Response;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        fn err(m: impl Display) -> Response {
            tracing::error!("{m}");
            (StatusCode::BAD_REQUEST, m.to_string()).into_response()
        }
        let event = req
            .headers()
            .get("X-GitHub-Event")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| err("X-GitHub-Event header missing"))?
            .to_string();
        let config = <Arc<Config>>::from_ref(state);
        let signature = match &config.github.app.webhook_secret {
            Some(_) => Some(
                req.headers()
                    .get("X-Hub-Signature-256")
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| err("X-Hub-Signature-256 missing"))?
                    .to_string(),
            ),
            None => None,
        };
        let body = Bytes::from_request(req, state).await.map_err(|_| err("error reading body"))?;
        if let (Some(secret), Some(signature)) = (&config.github.app.webhook_secret, signature) {
            verify_signature(secret.as_bytes(), &body, &signature).map_err(err)?;
        }
        let value = WebhookEvent::try_from_header_and_body(&event, &body)
            .map_err(|_| err("error parsing body"))?;
        Ok(GitHubEvent { event: value })
    }
}

/// What the listener did with an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    /// The app was uninstalled; its cached credential was dropped.
    InstallationRemoved(InstallationId),
    WorkflowRun { run_id: String, action: String },
    Ignored,
}

fn installation_id(event: &WebhookEvent) -> Option<InstallationId> {
    match &event.installation {
        Some(EventInstallation::Full(installation)) => {
            Some(InstallationId(installation.id.into_inner()))
        }
        Some(EventInstallation::Minimal(installation)) => {
            Some(InstallationId(installation.id.into_inner()))
        }
        None => None,
    }
}

/// Applies a verified event: uninstalls evict the credential cache and
/// workflow runs are logged. Everything else is ignored.
pub async fn handle_event(credentials: &Credentials, event: &WebhookEvent) -> EventOutcome {
    match &event.specific {
        WebhookEventPayload::Installation(inner) => {
            tracing::info!("Installation {:?} event", inner.action);
            if inner.action != InstallationWebhookEventAction::Deleted {
                return EventOutcome::Ignored;
            }
            let Some(id) = installation_id(event) else {
                tracing::warn!("Received installation deleted event with no installation ID");
                return EventOutcome::Ignored;
            };
            if credentials.invalidate(id).await {
                tracing::info!("Dropped cached credential for installation {}", id);
            }
            EventOutcome::InstallationRemoved(id)
        }
        WebhookEventPayload::WorkflowRun(inner) => {
            let action = format!("{:?}", inner.action);
            match serde_json::from_value::<WorkflowRun>(inner.workflow_run.clone()) {
                Ok(run) => {
                    tracing::info!(
                        "Workflow run {} {} ({}, {})",
                        run.id,
                        action,
                        run.run_status(),
                        run.run_conclusion()
                    );
                    EventOutcome::WorkflowRun { run_id: run.id.to_string(), action }
                }
                Err(e) => {
                    tracing::error!("Received workflow_run event with invalid workflow_run: {e}");
                    EventOutcome::Ignored
                }
            }
        }
        _ => {
            tracing::debug!("Ignoring webhook event {:?}", event.kind);
            EventOutcome::Ignored
        }
    }
}
