use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde_json::json;

use crate::error::CdpError;
use crate::page::PageEvaluator;
use crate::session::CdpSession;
use crate::target::RemoteTarget;

pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Discovery and session opening against a remote control endpoint.
pub trait TargetDialer: Send + Sync {
    fn list_targets(&self) -> BoxFuture<'_, Result<Vec<RemoteTarget>, CdpError>>;

    fn open<'a>(
        &'a self,
        target: &'a RemoteTarget,
    ) -> BoxFuture<'a, Result<Arc<dyn PageEvaluator>, CdpError>>;
}

/// Real dialer: HTTP `/json` for discovery, WebSocket per target.
#[derive(Debug, Clone)]
pub struct DevtoolsDialer {
    http: reqwest::Client,
    base_url: String,
    discovery_timeout: Duration,
    call_timeout: Duration,
}

impl DevtoolsDialer {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: format!("http://{host}:{port}"),
            discovery_timeout: DEFAULT_DISCOVERY_TIMEOUT,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn fetch_targets(&self) -> Result<Vec<RemoteTarget>, CdpError> {
        let url = format!("{}/json", self.base_url);
        let resp = self
            .http
            .get(&url)
            .timeout(self.discovery_timeout)
            .send()
            .await
            .map_err(|e| CdpError::EndpointUnreachable(format!("{url}: {e}")))?;
        if !resp.status().is_success() {
            return Err(CdpError::EndpointUnreachable(format!(
                "{url}: HTTP {}",
                resp.status()
            )));
        }
        resp.json::<Vec<RemoteTarget>>()
            .await
            .map_err(|e| CdpError::Decode(format!("target listing: {e}")))
    }

    async fn open_session(&self, target: &RemoteTarget) -> Result<Arc<dyn PageEvaluator>, CdpError> {
        let session =
            CdpSession::connect(target.clone(), self.discovery_timeout, self.call_timeout).await?;
        session.call("Runtime.enable", json!({})).await?;
        Ok(Arc::new(session))
    }
}

impl TargetDialer for DevtoolsDialer {
    fn list_targets(&self) -> BoxFuture<'_, Result<Vec<RemoteTarget>, CdpError>> {
        Box::pin(self.fetch_targets())
    }

    fn open<'a>(
        &'a self,
        target: &'a RemoteTarget,
    ) -> BoxFuture<'a, Result<Arc<dyn PageEvaluator>, CdpError>> {
        Box::pin(self.open_session(target))
    }
}
