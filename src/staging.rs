//! Transient input files written before a job is scheduled.

use std::path::{Path, PathBuf};

use reqwest::Url;
use tracing::{debug, warn};

use crate::{error::ServiceError, jobs::JobId};

/// An input file owned by one job. It is deleted by [`StagedInput::remove`],
/// or on drop if the job never got that far.
#[derive(Debug)]
pub struct StagedInput {
    path: Option<PathBuf>,
}

impl StagedInput {
    pub fn new(path: PathBuf) -> Self {
        Self { path: Some(path) }
    }

    pub fn path(&self) -> &Path {
        self.path.as_deref().unwrap_or_else(|| Path::new(""))
    }

    pub async fn remove(mut self) {
        if let Some(path) = self.path.take() {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => debug!(path = %path.display(), "removed staged input"),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => warn!(path = %path.display(), %err, "failed to remove staged input"),
            }
        }
    }
}

impl Drop for StagedInput {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Writes an uploaded file to `<dir>/<task_id>_<filename>`.
pub async fn stage_upload(
    dir: &Path,
    task_id: JobId,
    filename: Option<&str>,
    bytes: &[u8],
) -> Result<StagedInput, ServiceError> {
    if bytes.is_empty() {
        return Err(ServiceError::InvalidRequest("uploaded file is empty".into()));
    }
    let name = sanitize_filename(filename.unwrap_or_default());
    let path = dir.join(format!("{task_id}_{name}"));
    tokio::fs::write(&path, bytes).await?;
    Ok(StagedInput::new(path))
}

/// Downloads `url` to `<dir>/<task_id>.<ext>`.
pub async fn fetch_url(
    client: &reqwest::Client,
    dir: &Path,
    task_id: JobId,
    url: &str,
) -> Result<StagedInput, ServiceError> {
    let parsed = Url::parse(url)
        .map_err(|e| ServiceError::InvalidRequest(format!("invalid audio_url: {e}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ServiceError::InvalidRequest(
            "audio_url must use http or https".into(),
        ));
    }

    let bytes = client
        .get(parsed.clone())
        .send()
        .await
        .and_then(|resp| resp.error_for_status())
        .map_err(|e| ServiceError::Fetch(e.to_string()))?
        .bytes()
        .await
        .map_err(|e| ServiceError::Fetch(e.to_string()))?;

    let path = dir.join(format!("{task_id}.{}", url_extension(&parsed)));
    tokio::fs::write(&path, &bytes).await?;
    debug!(%task_id, bytes = bytes.len(), "fetched remote audio");
    Ok(StagedInput::new(path))
}

fn sanitize_filename(raw: &str) -> String {
    let base = raw.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "upload".to_string()
    } else {
        cleaned.to_string()
    }
}

fn url_extension(url: &Url) -> String {
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .and_then(|last| last.rsplit_once('.'))
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .filter(|ext| !ext.is_empty() && ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .unwrap_or_else(|| "wav".to_string())
}
