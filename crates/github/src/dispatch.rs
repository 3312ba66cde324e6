use std::collections::BTreeMap;

use indent_core::models::{DispatchAck, WorkflowRef};
use serde::Serialize;
use time::OffsetDateTime;

use crate::{GitHub, Result};

#[derive(Serialize)]
struct DispatchEvent<'a> {
    #[serde(rename = "ref")]
    git_ref: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    inputs: Option<&'a BTreeMap<String, String>>,
}

/// Run timestamps have whole-second precision; the dispatch time is rounded
/// down so a run created in the same second still correlates.
fn truncate_to_second(at: OffsetDateTime) -> OffsetDateTime {
    at.replace_nanosecond(0).unwrap_or(at)
}

/// Fires a `workflow_dispatch` event for `workflow` on `git_ref`.
///
/// The platform answers `204` without a run id; the returned ack records when
/// the event was sent so the poller can find the run it created.
pub async fn dispatch(
    github: &GitHub,
    workflow: &WorkflowRef,
    git_ref: &str,
    inputs: &BTreeMap<String, String>,
) -> Result<DispatchAck> {
    let dispatched_at = truncate_to_second(github.clock().now());
    let endpoint = format!(
        "/repos/{}/{}/actions/workflows/{}/dispatches",
        workflow.repo.owner,
        workflow.repo.name,
        workflow.file_name()
    );
    let event = DispatchEvent { git_ref, inputs: (!inputs.is_empty()).then_some(inputs) };
    github.post_no_content(&endpoint, &event).await?;
    tracing::info!("Dispatched {} on {} at {}", workflow.path, git_ref, dispatched_at);
    Ok(DispatchAck { workflow: workflow.clone(), git_ref: git_ref.to_string(), dispatched_at })
}
