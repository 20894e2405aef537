//! Error types for the remote control boundary.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CdpError {
    #[error("no attachable target matches `{pattern}`")]
    TargetNotFound { pattern: String },

    #[error("remote control endpoint unreachable: {0}")]
    EndpointUnreachable(String),

    #[error("transport to remote target lost")]
    TransportLost,

    #[error("remote call timed out: {method}")]
    Timeout { method: String },

    #[error("injection failed: {0}")]
    InjectionFailed(String),

    #[error("remote rejected request: {0}")]
    Rejected(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("script error: {0}")]
    Script(String),

    #[error("unexpected reply: {0}")]
    Decode(String),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

impl CdpError {
    /// Failures after which the attached target must be considered gone.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::TransportLost
                | Self::Timeout { .. }
                | Self::WebSocket(_)
                | Self::EndpointUnreachable(_)
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
