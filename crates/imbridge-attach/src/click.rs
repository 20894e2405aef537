//! Simulated download click. The host's own download pipeline writes the
//! file into a directory we point it at; we wait for it to land.
//!
//! Each request gets its own scratch directory under the download root,
//! removed when the attempt ends (success, failure or timeout), so a file
//! can only ever be claimed by the click that produced it.

use std::path::{Path, PathBuf};
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde_json::json;
use tokio::sync::Mutex;

use crate::error::StrategyError;
use crate::strategy::{FetchRequest, FetchStrategy, ensure_non_empty, sanitize_file_name};

const POLL_INTERVAL: Duration = Duration::from_millis(250);
const PARTIAL_SUFFIXES: [&str; 3] = [".crdownload", ".part", ".tmp"];

const CLICK_DOWNLOAD: &str = r#"/* imbridge:click-download */
function(url, name) {
  var a = document.createElement('a');
  a.href = url;
  a.download = name || '';
  a.style.display = 'none';
  document.body.appendChild(a);
  a.click();
  setTimeout(function() { a.remove(); }, 1000);
  return true;
}"#;

pub struct ClickDownload {
    download_root: PathBuf,
    timeout: Duration,
    /// `Page.setDownloadBehavior` is page-wide, so clicks run one at a time.
    turn: Mutex<()>,
}

impl ClickDownload {
    pub fn new(download_root: PathBuf, timeout: Duration) -> Self {
        Self {
            download_root,
            timeout,
            turn: Mutex::new(()),
        }
    }

    /// Scratch directory the host is told to download into for `req`.
    pub fn request_dir(&self, req: &FetchRequest) -> PathBuf {
        self.download_root
            .join(sanitize_file_name(&format!("{}_{}", req.session_id, req.id_client)))
    }

    async fn download(&self, req: &FetchRequest) -> Result<PathBuf, StrategyError> {
        let page = req.page()?;
        let _turn = self.turn.lock().await;
        let scratch = ScratchDir::create(self.request_dir(req)).await?;

        page.call(
            "Page.setDownloadBehavior",
            json!({
                "behavior": "allow",
                "downloadPath": scratch.path().display().to_string(),
            }),
        )
        .await?;
        let script = format!(
            "({CLICK_DOWNLOAD})({}, {})",
            imbridge_cdp::scripts::js_literal(&req.attachment.url),
            imbridge_cdp::scripts::js_literal(&req.attachment.name),
        );
        page.evaluate(&script, false).await?;

        // Bounded by the caller's per-strategy timeout.
        loop {
            if let Some(found) = landed_file(scratch.path(), &req.attachment.name).await? {
                tokio::fs::rename(&found, &req.dest).await?;
                ensure_non_empty(&req.dest).await?;
                return Ok(req.dest.clone());
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

/// A complete file in `dir`, preferring one carrying the expected name.
async fn landed_file(dir: &Path, expected_name: &str) -> Result<Option<PathBuf>, StrategyError> {
    let mut complete = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if !PARTIAL_SUFFIXES.iter().any(|s| name.ends_with(s)) {
            complete.push(name);
        }
    }
    complete.sort();
    let pick = complete
        .iter()
        .find(|name| !expected_name.is_empty() && name.as_str() == expected_name)
        .or_else(|| complete.first());
    Ok(pick.map(|name| dir.join(name)))
}

/// Per-request download directory; emptied on creation, removed on drop
/// together with anything that landed after the attempt gave up.
struct ScratchDir(PathBuf);

impl ScratchDir {
    async fn create(path: PathBuf) -> Result<Self, StrategyError> {
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tokio::fs::create_dir_all(&path).await?;
        Ok(Self(path))
    }

    fn path(&self) -> &Path {
        &self.0
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.0)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::debug!("failed to remove {}: {e}", self.0.display());
        }
    }
}

impl FetchStrategy for ClickDownload {
    fn name(&self) -> &'static str {
        "click-download"
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn fetch<'a>(&'a self, req: &'a FetchRequest) -> BoxFuture<'a, Result<PathBuf, StrategyError>> {
        Box::pin(self.download(req))
    }
}
