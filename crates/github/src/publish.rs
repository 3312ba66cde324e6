//! Branch, commit and pull request creation through the Git data API.
//!
//! All files land in a single commit: blobs are written first, then one tree
//! layered on the base tree, one commit and finally the branch ref. Nothing is
//! visible on the branch until the ref exists, so a failure part way leaves
//! only unreferenced objects behind.

use http::StatusCode;
use indent_core::models::{FileChange, PrHandle, PublishRequest, RepoRef};
use serde::{Deserialize, Serialize};

use crate::{Error, GitHub, PublishStep, Result};

const FILE_MODE: &str = "100644";

#[derive(Deserialize)]
struct GitRef {
    object: GitObject,
}

#[derive(Deserialize)]
struct GitObject {
    sha: String,
}

#[derive(Deserialize)]
struct GitCommit {
    sha: String,
    tree: GitObject,
}

#[derive(Serialize)]
struct NewBlob<'a> {
    content: &'a str,
    encoding: &'static str,
}

#[derive(Serialize)]
struct NewTree<'a> {
    base_tree: &'a str,
    tree: Vec<TreeEntry<'a>>,
}

#[derive(Serialize)]
struct TreeEntry<'a> {
    path: &'a str,
    mode: &'static str,
    #[serde(rename = "type")]
    kind: &'static str,
    sha: String,
}

#[derive(Serialize)]
struct NewCommit<'a> {
    message: &'a str,
    tree: &'a str,
    parents: [&'a str; 1],
}

#[derive(Serialize)]
struct NewRef<'a> {
    #[serde(rename = "ref")]
    git_ref: String,
    sha: &'a str,
}

#[derive(Serialize)]
struct NewPullRequest<'a> {
    title: &'a str,
    head: &'a str,
    base: &'a str,
    body: &'a str,
}

#[derive(Deserialize)]
struct CreatedPullRequest {
    number: u64,
    html_url: String,
}

#[derive(Serialize)]
struct NewComment<'a> {
    body: &'a str,
}

/// Collapses repeated paths, keeping the position of the first occurrence and
/// the content of the last.
fn dedup_files(files: &[FileChange]) -> Vec<&FileChange> {
    let mut out: Vec<&FileChange> = Vec::with_capacity(files.len());
    for file in files {
        match out.iter_mut().find(|f| f.path == file.path) {
            Some(existing) => *existing = file,
            None => out.push(file),
        }
    }
    out
}

fn validate(request: &PublishRequest) -> Result<()> {
    if request.files.is_empty() {
        return Err(Error::InvalidRequest("publish request contains no files".to_string()));
    }
    if request.branch_name.is_empty() || request.base_branch.is_empty() {
        return Err(Error::InvalidRequest("branch names must not be empty".to_string()));
    }
    if request.branch_name == request.base_branch {
        return Err(Error::InvalidRequest(format!(
            "cannot open a pull request from {} onto itself",
            request.base_branch
        )));
    }
    if let Some(file) = request.files.iter().find(|f| f.path.is_empty() || f.path.starts_with('/'))
    {
        return Err(Error::InvalidRequest(format!("invalid file path {:?}", file.path)));
    }
    Ok(())
}

/// Ref creation answers 422 rather than 409 when the branch exists.
fn ref_conflict(err: Error) -> Error {
    match err {
        Error::Api { endpoint, status, body }
            if status == StatusCode::UNPROCESSABLE_ENTITY
                && body.contains("Reference already exists") =>
        {
            Error::Conflict { endpoint, body }
        }
        other => other,
    }
}

/// Commits `request.files` onto a new branch off `request.base_branch` and
/// opens a pull request for it.
pub async fn publish(github: &GitHub, repo: &RepoRef, request: &PublishRequest) -> Result<PrHandle> {
    validate(request)?;
    let root = format!("/repos/{}/{}", repo.owner, repo.name);

    let base: GitRef = github
        .get(&format!("{root}/git/ref/heads/{}", request.base_branch))
        .await
        .map_err(Error::publish(PublishStep::ResolveBase))?;
    let base_commit: GitCommit = github
        .get(&format!("{root}/git/commits/{}", base.object.sha))
        .await
        .map_err(Error::publish(PublishStep::ResolveBase))?;
    tracing::debug!(
        "Base {} at {} (tree {})",
        request.base_branch,
        base_commit.sha,
        base_commit.tree.sha
    );

    let files = dedup_files(&request.files);
    let mut entries = Vec::with_capacity(files.len());
    for file in files {
        let blob: GitObject = github
            .post(&format!("{root}/git/blobs"), &NewBlob {
                content: &file.content,
                encoding: "utf-8",
            })
            .await
            .map_err(Error::publish(PublishStep::CreateBlob))?;
        entries.push(TreeEntry { path: &file.path, mode: FILE_MODE, kind: "blob", sha: blob.sha });
    }

    let tree: GitObject = github
        .post(&format!("{root}/git/trees"), &NewTree {
            base_tree: &base_commit.tree.sha,
            tree: entries,
        })
        .await
        .map_err(Error::publish(PublishStep::CreateTree))?;

    let commit: GitObject = github
        .post(&format!("{root}/git/commits"), &NewCommit {
            message: &request.commit_message,
            tree: &tree.sha,
            parents: [&base_commit.sha],
        })
        .await
        .map_err(Error::publish(PublishStep::CreateCommit))?;

    github
        .post::<_, GitRef>(&format!("{root}/git/refs"), &NewRef {
            git_ref: format!("refs/heads/{}", request.branch_name),
            sha: &commit.sha,
        })
        .await
        .map_err(|e| Error::publish(PublishStep::CreateRef)(ref_conflict(e)))?;
    tracing::info!("Created branch {} at {} in {}", request.branch_name, commit.sha, repo);

    let pull: CreatedPullRequest = match github
        .post(&format!("{root}/pulls"), &NewPullRequest {
            title: &request.pr_title,
            head: &request.branch_name,
            base: &request.base_branch,
            body: &request.pr_body,
        })
        .await
    {
        Ok(pull) => pull,
        Err(e) => {
            let branch_ref = format!("{root}/git/refs/heads/{}", request.branch_name);
            if let Err(cleanup) = github.delete(&branch_ref).await {
                tracing::warn!("Failed to delete branch {}: {}", request.branch_name, cleanup);
            }
            return Err(Error::publish(PublishStep::OpenPullRequest)(e));
        }
    };
    tracing::info!("Opened pull request #{} ({})", pull.number, pull.html_url);

    if let Some(comment) = &request.comment {
        github
            .post::<_, serde::de::IgnoredAny>(
                &format!("{root}/issues/{}/comments", pull.number),
                &NewComment { body: comment },
            )
            .await
            .map_err(Error::publish(PublishStep::PostComment))?;
    }

    Ok(PrHandle {
        number: pull.number,
        url: pull.html_url,
        branch: request.branch_name.clone(),
        commit_sha: commit.sha,
    })
}
