use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use imbridge_cdp::PageEvaluator;
use imbridge_core::AttachmentRef;

use crate::error::StrategyError;

const MAX_FILE_NAME_CHARS: usize = 120;
const DEFAULT_EXTENSION: &str = "dat";

/// Everything a strategy needs to retrieve one attachment.
#[derive(Clone)]
pub struct FetchRequest {
    pub attachment: AttachmentRef,
    pub session_id: String,
    pub id_client: String,
    /// Attached page, when there is one.
    pub page: Option<Arc<dyn PageEvaluator>>,
    /// Where the file must end up.
    pub dest: PathBuf,
}

impl FetchRequest {
    pub fn page(&self) -> Result<&dyn PageEvaluator, StrategyError> {
        self.page.as_deref().ok_or(StrategyError::NoPage)
    }
}

/// One way of obtaining an attachment. Strategies are tried in order and
/// each attempt is bounded by `timeout`.
pub trait FetchStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn timeout(&self) -> Duration;

    /// Write the attachment to `req.dest` and return the path.
    fn fetch<'a>(&'a self, req: &'a FetchRequest) -> BoxFuture<'a, Result<PathBuf, StrategyError>>;
}

/// Replace anything outside `[A-Za-z0-9._-]`; no leading dots, bounded length.
pub fn sanitize_file_name(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = cleaned.trim_start_matches('.');
    let bounded: String = trimmed.chars().take(MAX_FILE_NAME_CHARS).collect();
    if bounded.is_empty() {
        "attachment".into()
    } else {
        bounded
    }
}

/// `<session>_<id>.<ext>`, sanitized.
pub fn local_file_name(session_id: &str, id: &str, attachment: &AttachmentRef) -> String {
    let ext = attachment
        .extension()
        .map(sanitize_file_name)
        .unwrap_or_else(|| DEFAULT_EXTENSION.into());
    format!("{}.{ext}", sanitize_file_name(&format!("{session_id}_{id}")))
}

/// Last path segment of a URL, without query or fragment.
pub fn url_file_segment(url: &str) -> Option<&str> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.rsplit('/').next().filter(|s| !s.is_empty())
}

/// Reject empty results; they mean the strategy did not really succeed.
pub(crate) async fn ensure_non_empty(path: &Path) -> Result<(), StrategyError> {
    let meta = tokio::fs::metadata(path).await?;
    if meta.len() == 0 {
        let _ = tokio::fs::remove_file(path).await;
        return Err(StrategyError::Empty);
    }
    Ok(())
}
