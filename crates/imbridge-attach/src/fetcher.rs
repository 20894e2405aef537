//! Ordered fallback chain plus retention of what it stored.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use imbridge_cdp::PageEvaluator;
use imbridge_core::AttachmentRef;

use crate::click::ClickDownload;
use crate::direct::DirectHttp;
use crate::error::{AttachmentError, StrategyAttempt, StrategyError};
use crate::host_cache::HostCache;
use crate::page_fetch::PageFetch;
use crate::strategy::{FetchRequest, FetchStrategy, local_file_name};

pub const DIRECT_TIMEOUT: Duration = Duration::from_secs(15);
pub const PAGE_FETCH_TIMEOUT: Duration = Duration::from_secs(20);
pub const CLICK_TIMEOUT: Duration = Duration::from_secs(30);
pub const HOST_CACHE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
struct StoredFile {
    path: PathBuf,
    stored_at: Instant,
}

pub struct AttachmentFetcher {
    strategies: Vec<Box<dyn FetchStrategy>>,
    dest_dir: PathBuf,
    retention: Duration,
    stored: Mutex<Vec<StoredFile>>,
    unnamed: AtomicU64,
}

impl AttachmentFetcher {
    pub fn new(dest_dir: PathBuf, retention: Duration, strategies: Vec<Box<dyn FetchStrategy>>) -> Self {
        Self {
            strategies,
            dest_dir,
            retention,
            stored: Mutex::new(Vec::new()),
            unnamed: AtomicU64::new(0),
        }
    }

    /// Direct HTTP, in-page fetch, simulated click, then the host cache
    /// when a cache directory is configured.
    pub fn standard(dest_dir: PathBuf, retention: Duration, host_cache: Option<PathBuf>) -> Self {
        let mut strategies: Vec<Box<dyn FetchStrategy>> = vec![
            Box::new(DirectHttp::new(DIRECT_TIMEOUT)),
            Box::new(PageFetch::new(PAGE_FETCH_TIMEOUT)),
            Box::new(ClickDownload::new(dest_dir.join(".downloads"), CLICK_TIMEOUT)),
        ];
        if let Some(cache_dir) = host_cache {
            strategies.push(Box::new(HostCache::new(cache_dir, HOST_CACHE_TIMEOUT)));
        }
        Self::new(dest_dir, retention, strategies)
    }

    pub fn dest_dir(&self) -> &Path {
        &self.dest_dir
    }

    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    /// Try each strategy in order until one yields a file. Attempts are
    /// individually bounded; a failed attempt never aborts the chain.
    pub async fn fetch(
        &self,
        attachment: &AttachmentRef,
        session_id: &str,
        id_client: &str,
        page: Option<Arc<dyn PageEvaluator>>,
    ) -> Result<PathBuf, AttachmentError> {
        tokio::fs::create_dir_all(&self.dest_dir).await?;
        let id = if id_client.is_empty() {
            format!("n{}", self.unnamed.fetch_add(1, Ordering::Relaxed))
        } else {
            id_client.to_string()
        };
        let req = FetchRequest {
            attachment: attachment.clone(),
            session_id: session_id.to_string(),
            id_client: id.clone(),
            page,
            dest: self.dest_dir.join(local_file_name(session_id, &id, attachment)),
        };

        let mut attempts = Vec::new();
        for strategy in &self.strategies {
            let limit = strategy.timeout();
            let result = match tokio::time::timeout(limit, strategy.fetch(&req)).await {
                Ok(result) => result,
                Err(_) => Err(StrategyError::TimedOut(limit)),
            };
            match result {
                Ok(path) => {
                    tracing::info!(
                        "attachment {} fetched via {} -> {}",
                        attachment.url,
                        strategy.name(),
                        path.display()
                    );
                    self.remember(path.clone(), Instant::now());
                    return Ok(path);
                }
                Err(error) => {
                    tracing::debug!("{} failed for {}: {error}", strategy.name(), attachment.url);
                    attempts.push(StrategyAttempt {
                        strategy: strategy.name(),
                        error,
                    });
                }
            }
        }

        let err = AttachmentError::Unavailable {
            url: attachment.url.clone(),
            attempts,
        };
        tracing::warn!("{err}");
        Err(err)
    }

    fn remember(&self, path: PathBuf, stored_at: Instant) {
        if let Ok(mut stored) = self.stored.lock() {
            stored.push(StoredFile { path, stored_at });
        }
    }

    /// Delete stored files older than the retention period. Returns how
    /// many were removed.
    pub async fn sweep(&self, now: Instant) -> usize {
        let expired: Vec<PathBuf> = match self.stored.lock() {
            Ok(mut stored) => {
                let (old, keep): (Vec<StoredFile>, Vec<StoredFile>) = std::mem::take(&mut *stored)
                    .into_iter()
                    .partition(|f| now.saturating_duration_since(f.stored_at) >= self.retention);
                *stored = keep;
                old.into_iter().map(|f| f.path).collect()
            }
            Err(_) => return 0,
        };
        let mut removed = 0;
        for path in expired {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!("failed to remove {}: {e}", path.display()),
            }
        }
        if removed > 0 {
            tracing::debug!("swept {removed} expired attachments");
        }
        removed
    }

    pub fn stored_len(&self) -> usize {
        self.stored.lock().map(|s| s.len()).unwrap_or(0)
    }
}
