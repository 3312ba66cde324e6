use std::io::{Cursor, Read};

use http::StatusCode;
use indent_core::models::{RepoRef, RunId};

use crate::{Error, GitHub, Result};

/// Upper bound on the buffer reserved up front for one log file. The size an
/// archive header declares is untrusted.
const MAX_PREALLOC: usize = 1 << 20;

fn prealloc(declared: u64) -> usize { usize::try_from(declared).unwrap_or(usize::MAX).min(MAX_PREALLOC) }

/// One log file from a run's archive, usually one per job step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFile {
    pub name: String,
    pub text: String,
}

/// A run's downloaded log archive and its unpacked text files.
#[derive(Debug, Clone)]
pub struct RunLogs {
    pub archive: Vec<u8>,
    pub files: Vec<LogFile>,
}

impl RunLogs {
    /// All files concatenated, each under a `==> name <==` header.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for file in &self.files {
            out.push_str("==> ");
            out.push_str(&file.name);
            out.push_str(" <==\n");
            out.push_str(&file.text);
            if !file.text.ends_with('\n') {
                out.push('\n');
            }
        }
        out
    }

    pub fn is_empty(&self) -> bool { self.files.iter().all(|f| f.text.is_empty()) }
}

fn unpack(run_id: RunId, bytes: &[u8]) -> Result<Vec<LogFile>> {
    let archive_err = |source: zip::result::ZipError| Error::Archive { run_id, source };
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).map_err(archive_err)?;
    let mut files = Vec::with_capacity(archive.len());
    for i in 0..archive.len() {
        let mut file = archive.by_index(i).map_err(archive_err)?;
        if file.is_dir() {
            continue;
        }
        let Some(name) = file.enclosed_name().map(|p| p.to_string_lossy().into_owned()) else {
            tracing::warn!("Skipping unsafe path {:?} in logs of run {}", file.name(), run_id);
            continue;
        };
        let mut contents = Vec::with_capacity(prealloc(file.size()));
        file.read_to_end(&mut contents).map_err(|e| archive_err(e.into()))?;
        files.push(LogFile { name, text: String::from_utf8_lossy(&contents).into_owned() });
    }
    Ok(files)
}

/// Downloads and unpacks the logs of `run_id`. The endpoint redirects to a
/// short-lived signed URL, which the client follows.
///
/// A run that never produced logs (404, or 410 once they have expired)
/// yields [`Error::LogsUnavailable`].
pub async fn fetch_logs(github: &GitHub, repo: &RepoRef, run_id: RunId) -> Result<RunLogs> {
    let endpoint = format!("/repos/{}/{}/actions/runs/{}/logs", repo.owner, repo.name, run_id);
    let archive = match github.get_bytes(&endpoint).await {
        Ok(bytes) => bytes,
        Err(Error::NotFound { .. }) => return Err(Error::LogsUnavailable { run_id }),
        Err(Error::Api { status, .. }) if status == StatusCode::GONE => {
            return Err(Error::LogsUnavailable { run_id });
        }
        Err(e) => return Err(e),
    };
    let files = unpack(run_id, &archive)?;
    tracing::info!("Fetched {} log files ({} bytes) for run {}", files.len(), archive.len(), run_id);
    Ok(RunLogs { archive, files })
}
