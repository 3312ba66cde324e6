use indent_core::models::{PrSummary, RepoRef};
use serde::{Deserialize, de::IgnoredAny};
use time::OffsetDateTime;

use crate::{GitHub, Result};

#[derive(Deserialize)]
struct PullRequest {
    number: u64,
    title: Option<String>,
    html_url: Option<String>,
    user: Option<User>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    created_at: Option<OffsetDateTime>,
}

#[derive(Deserialize)]
struct User {
    login: String,
}

#[derive(Deserialize)]
struct PullRequestFile {
    filename: String,
    #[serde(default)]
    status: Option<String>,
}

impl PullRequestFile {
    /// Whether merging the pull request leaves `path` in the tree.
    fn provides(&self, path: &str) -> bool {
        self.filename == path && self.status.as_deref() != Some("removed")
    }
}

/// Whether `path` exists in `repo` at `git_ref`. Only a 404 means "no";
/// every other failure is returned as-is.
pub async fn exists(github: &GitHub, repo: &RepoRef, path: &str, git_ref: &str) -> Result<bool> {
    let endpoint = format!("/repos/{}/{}/contents/{}", repo.owner, repo.name, path);
    match github.get_query::<IgnoredAny, _>(&endpoint, &[("ref", git_ref)]).await {
        Ok(_) => Ok(true),
        Err(e) if e.is_not_found() => {
            tracing::debug!("{} not present at {} in {}", path, git_ref, repo);
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

/// Open pull requests that would leave `path` in place once merged. Pulls
/// deleting it are skipped.
pub async fn find_pull_requests_touching(
    github: &GitHub,
    repo: &RepoRef,
    path: &str,
) -> Result<Vec<PrSummary>> {
    let pulls: Vec<PullRequest> = github
        .get_all_pages(&format!("/repos/{}/{}/pulls", repo.owner, repo.name), &[("state", "open")])
        .await?;
    let mut matching = Vec::new();
    for pull in pulls {
        let files: Vec<PullRequestFile> = github
            .get_all_pages(
                &format!("/repos/{}/{}/pulls/{}/files", repo.owner, repo.name, pull.number),
                &[],
            )
            .await?;
        if files.iter().any(|f| f.provides(path)) {
            matching.push(PrSummary {
                number: pull.number,
                title: pull.title.unwrap_or_default(),
                url: pull.html_url.unwrap_or_default(),
                author: pull.user.map(|u| u.login),
                created_at: pull.created_at,
            });
        }
    }
    Ok(matching)
}
