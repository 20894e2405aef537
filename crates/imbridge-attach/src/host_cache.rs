//! Last resort: the host application may already have cached the file on
//! disk. Scan its cache directory for a file matching the attachment's name
//! (and size, when known) and copy the newest match.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use futures_util::future::BoxFuture;
use imbridge_core::AttachmentRef;
use walkdir::WalkDir;

use crate::error::StrategyError;
use crate::strategy::{FetchRequest, FetchStrategy, ensure_non_empty, url_file_segment};

const MAX_DEPTH: usize = 6;

pub struct HostCache {
    cache_dir: PathBuf,
    timeout: Duration,
}

impl HostCache {
    pub fn new(cache_dir: PathBuf, timeout: Duration) -> Self {
        Self { cache_dir, timeout }
    }

    async fn copy_from_cache(&self, req: &FetchRequest) -> Result<PathBuf, StrategyError> {
        let cache_dir = self.cache_dir.clone();
        let attachment = req.attachment.clone();
        let found = tokio::task::spawn_blocking(move || find_cached(&cache_dir, &attachment))
            .await
            .map_err(|e| StrategyError::Io(std::io::Error::other(e)))?
            .ok_or(StrategyError::NotFound)?;
        tracing::debug!("host cache hit: {}", found.display());
        tokio::fs::copy(&found, &req.dest).await?;
        ensure_non_empty(&req.dest).await?;
        Ok(req.dest.clone())
    }
}

/// Best file under `root` for the attachment. A file matches when its name
/// equals a key or its stem contains the key's stem, since the host appends
/// timestamps to cached names. Among matches, agreeing size wins, then an
/// exact name, then the newest.
pub fn find_cached(root: &Path, attachment: &AttachmentRef) -> Option<PathBuf> {
    let keys: Vec<(&str, &str)> = [Some(attachment.name.as_str()), url_file_segment(&attachment.url)]
        .into_iter()
        .flatten()
        .filter(|k| !k.is_empty())
        .map(|k| (k, file_stem(k)))
        .filter(|(_, stem)| !stem.is_empty())
        .collect();
    if keys.is_empty() {
        return None;
    }

    let mut best: Option<((bool, bool, SystemTime), PathBuf)> = None;
    for entry in WalkDir::new(root)
        .max_depth(MAX_DEPTH)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
    {
        let name = entry.file_name().to_string_lossy().into_owned();
        let stem = file_stem(&name);
        let exact = keys.iter().any(|(k, _)| name == *k);
        if !exact && !keys.iter().any(|(_, key_stem)| stem.contains(key_stem)) {
            continue;
        }
        let Ok(meta) = entry.metadata() else { continue };
        let size_agrees = attachment.size.is_none_or(|size| meta.len() == size);
        let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        let score = (size_agrees, exact, modified);
        if best.as_ref().is_none_or(|(s, _)| score > *s) {
            best = Some((score, entry.into_path()));
        }
    }
    best.map(|(_, path)| path)
}

fn file_stem(name: &str) -> &str {
    Path::new(name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(name)
}

impl FetchStrategy for HostCache {
    fn name(&self) -> &'static str {
        "host-cache"
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn fetch<'a>(&'a self, req: &'a FetchRequest) -> BoxFuture<'a, Result<PathBuf, StrategyError>> {
        Box::pin(self.copy_from_cache(req))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attachment(name: &str, size: Option<u64>) -> AttachmentRef {
        AttachmentRef {
            url: "https://nos.example/f/9f8e7d".into(),
            name: name.into(),
            ext: String::new(),
            size,
        }
    }

    #[test]
    fn matches_by_name_in_nested_dirs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let nested = dir.path().join("a/b");
        std::fs::create_dir_all(&nested).expect("mkdir");
        std::fs::write(nested.join("invoice.pdf"), b"1234").expect("write");
        std::fs::write(dir.path().join("other.pdf"), b"1234").expect("write");

        let found = find_cached(dir.path(), &attachment("invoice.pdf", None)).expect("hit");
        assert_eq!(found, nested.join("invoice.pdf"));
    }

    #[test]
    fn size_breaks_ties() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("invoice.pdf"), b"1234").expect("write");
        std::fs::write(dir.path().join("invoice_20240101120000.pdf"), b"123456789").expect("write");

        let found = find_cached(dir.path(), &attachment("invoice.pdf", Some(9))).expect("hit");
        assert_eq!(found, dir.path().join("invoice_20240101120000.pdf"));
        let found = find_cached(dir.path(), &attachment("invoice.pdf", Some(4))).expect("hit");
        assert_eq!(found, dir.path().join("invoice.pdf"));
    }

    #[test]
    fn exact_name_beats_suffixed_copy() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("invoice_20240101120000.pdf"), b"1234").expect("write");
        std::fs::write(dir.path().join("invoice.pdf"), b"1234").expect("write");
        let found = find_cached(dir.path(), &attachment("invoice.pdf", None)).expect("hit");
        assert_eq!(found, dir.path().join("invoice.pdf"));
    }

    #[test]
    fn matches_timestamp_suffixed_cache_name() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("report_20240101120000.pdf"), b"%PDF").expect("write");
        std::fs::write(dir.path().join("unrelated.pdf"), b"%PDF").expect("write");

        let found = find_cached(dir.path(), &attachment("report.pdf", None)).expect("hit");
        assert_eq!(found, dir.path().join("report_20240101120000.pdf"));
    }

    #[test]
    fn matches_url_segment_with_extension() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("9f8e7d.jpg"), b"img").expect("write");
        assert!(find_cached(dir.path(), &attachment("", None)).is_some());
    }

    #[tokio::test]
    async fn copies_into_destination() {
        let cache = tempfile::tempdir().expect("cache");
        let out = tempfile::tempdir().expect("out");
        std::fs::write(cache.path().join("invoice.pdf"), b"%PDF-1.7").expect("write");

        let req = FetchRequest {
            attachment: attachment("invoice.pdf", None),
            session_id: "p2p-1".into(),
            id_client: "c1".into(),
            page: None,
            dest: out.path().join("p2p-1_c1.pdf"),
        };
        let path = HostCache::new(cache.path().to_path_buf(), Duration::from_secs(5))
            .fetch(&req)
            .await
            .expect("fetch");
        assert_eq!(std::fs::read(path).expect("read"), b"%PDF-1.7");
        assert!(cache.path().join("invoice.pdf").exists());
    }

    #[tokio::test]
    async fn miss_is_not_found() {
        let cache = tempfile::tempdir().expect("cache");
        let req = FetchRequest {
            attachment: attachment("missing.doc", None),
            session_id: "p2p-1".into(),
            id_client: "c1".into(),
            page: None,
            dest: cache.path().join("out.doc"),
        };
        let err = HostCache::new(cache.path().to_path_buf(), Duration::from_secs(5))
            .fetch(&req)
            .await
            .expect_err("miss");
        assert!(matches!(err, StrategyError::NotFound));
    }
}
