//! Plain HTTP GET. Works for public object-storage URLs; fails on anything
//! behind the host's session cookies.

use std::path::PathBuf;
use std::time::Duration;

use futures_util::future::BoxFuture;

use crate::error::StrategyError;
use crate::strategy::{FetchRequest, FetchStrategy, ensure_non_empty};

pub struct DirectHttp {
    http: reqwest::Client,
    timeout: Duration,
}

impl DirectHttp {
    pub fn new(timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            timeout,
        }
    }

    async fn download(&self, req: &FetchRequest) -> Result<PathBuf, StrategyError> {
        let url = req.attachment.url.as_str();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(StrategyError::Request(format!("unsupported scheme: {url}")));
        }
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| StrategyError::Request(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(StrategyError::Http(status.as_u16()));
        }
        let body = resp
            .bytes()
            .await
            .map_err(|e| StrategyError::Request(e.to_string()))?;
        if body.is_empty() {
            return Err(StrategyError::Empty);
        }
        tokio::fs::write(&req.dest, &body).await?;
        ensure_non_empty(&req.dest).await?;
        Ok(req.dest.clone())
    }
}

impl FetchStrategy for DirectHttp {
    fn name(&self) -> &'static str {
        "direct"
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn fetch<'a>(&'a self, req: &'a FetchRequest) -> BoxFuture<'a, Result<PathBuf, StrategyError>> {
        Box::pin(self.download(req))
    }
}
