//! Connector: discovers, attaches to and supervises the chat page.

use std::sync::Arc;

use crate::dialer::TargetDialer;
use crate::error::CdpError;
use crate::messaging::probe_framework;
use crate::page::PageEvaluator;
use crate::target::{RemoteTarget, rank_targets};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectOutcome {
    AlreadyConnected,
    /// A fresh attachment; injected logic must be reinstalled.
    Attached(RemoteTarget),
}

pub struct Connector {
    dialer: Arc<dyn TargetDialer>,
    url_pattern: String,
    page: Option<Arc<dyn PageEvaluator>>,
    target: Option<RemoteTarget>,
    attachments: u64,
}

impl Connector {
    pub fn new(dialer: Arc<dyn TargetDialer>, url_pattern: impl Into<String>) -> Self {
        Self {
            dialer,
            url_pattern: url_pattern.into(),
            page: None,
            target: None,
            attachments: 0,
        }
    }

    /// Discover targets and attach to the best one that exposes the chat
    /// application. Candidates are tried in rank order; one that fails to
    /// open or answers the probe with nothing is skipped.
    pub async fn attach(&mut self) -> Result<RemoteTarget, CdpError> {
        self.disconnect();

        let targets = self.dialer.list_targets().await?;
        let candidates = rank_targets(targets, &self.url_pattern);
        tracing::debug!("{} attachable targets", candidates.len());

        for candidate in candidates {
            let page = match self.dialer.open(&candidate).await {
                Ok(page) => page,
                Err(e) => {
                    tracing::debug!("open {} failed: {e}", candidate.id);
                    continue;
                }
            };
            match probe_framework(page.as_ref()).await {
                Ok(Some(framework)) => {
                    tracing::info!(
                        "attached to {} ({}) [{framework}]",
                        candidate.id,
                        candidate.url
                    );
                    self.page = Some(page);
                    self.target = Some(candidate.clone());
                    self.attachments += 1;
                    return Ok(candidate);
                }
                Ok(None) => tracing::debug!("{} does not expose the app, skipping", candidate.id),
                Err(e) => tracing::debug!("probe {} failed: {e}", candidate.id),
            }
        }

        Err(CdpError::TargetNotFound {
            pattern: self.url_pattern.clone(),
        })
    }

    pub fn is_alive(&self) -> bool {
        self.page.as_ref().is_some_and(|p| p.is_alive())
    }

    /// No-op while the attachment is healthy; otherwise attach afresh.
    pub async fn reconnect(&mut self) -> Result<ReconnectOutcome, CdpError> {
        if self.is_alive() {
            return Ok(ReconnectOutcome::AlreadyConnected);
        }
        self.attach().await.map(ReconnectOutcome::Attached)
    }

    /// Drop the current attachment. The next `reconnect` attaches afresh.
    pub fn disconnect(&mut self) {
        if let Some(target) = self.target.take() {
            tracing::debug!("detaching from {}", target.id);
        }
        self.page = None;
    }

    pub fn page(&self) -> Option<Arc<dyn PageEvaluator>> {
        self.page.clone()
    }

    pub fn target(&self) -> Option<&RemoteTarget> {
        self.target.as_ref()
    }

    /// Successful attachments so far.
    pub fn attachments(&self) -> u64 {
        self.attachments
    }
}
