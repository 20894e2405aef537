//! Fetch from inside the page, carrying the host session's credentials.
//! The body comes back base64-encoded through the evaluation result.

use std::path::PathBuf;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use futures_util::future::BoxFuture;
use serde::Deserialize;

use crate::error::StrategyError;
use crate::strategy::{FetchRequest, FetchStrategy, ensure_non_empty};

const PAGE_FETCH: &str = r#"/* imbridge:page-fetch */
function(url) {
  return fetch(url, {credentials: 'include'}).then(function(resp) {
    if (!resp.ok) return {ok: false, status: resp.status};
    return resp.arrayBuffer().then(function(buf) {
      var bytes = new Uint8Array(buf);
      var chunks = [];
      for (var i = 0; i < bytes.length; i += 0x8000) {
        chunks.push(String.fromCharCode.apply(null, bytes.subarray(i, i + 0x8000)));
      }
      return {ok: true, status: resp.status, data: btoa(chunks.join(''))};
    });
  }).catch(function(e) {
    return {ok: false, status: 0, error: String((e && e.message) || e)};
  });
}"#;

#[derive(Debug, Deserialize)]
struct PageFetchReply {
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    status: u16,
    #[serde(default)]
    data: String,
    #[serde(default)]
    error: Option<String>,
}

pub struct PageFetch {
    timeout: Duration,
}

impl PageFetch {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn download(&self, req: &FetchRequest) -> Result<PathBuf, StrategyError> {
        let page = req.page()?;
        let script = format!(
            "({PAGE_FETCH})({})",
            imbridge_cdp::scripts::js_literal(&req.attachment.url)
        );
        let value = page.evaluate(&script, true).await?;
        let reply: PageFetchReply =
            serde_json::from_value(value).map_err(|e| StrategyError::Decode(e.to_string()))?;
        if !reply.ok {
            return Err(match reply.error {
                Some(error) => StrategyError::Request(error),
                None => StrategyError::Http(reply.status),
            });
        }
        let bytes = STANDARD
            .decode(reply.data.as_bytes())
            .map_err(|e| StrategyError::Decode(e.to_string()))?;
        if bytes.is_empty() {
            return Err(StrategyError::Empty);
        }
        tokio::fs::write(&req.dest, &bytes).await?;
        ensure_non_empty(&req.dest).await?;
        Ok(req.dest.clone())
    }
}

impl FetchStrategy for PageFetch {
    fn name(&self) -> &'static str {
        "page-fetch"
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn fetch<'a>(&'a self, req: &'a FetchRequest) -> BoxFuture<'a, Result<PathBuf, StrategyError>> {
        Box::pin(self.download(req))
    }
}
