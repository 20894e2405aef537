use std::time::Duration;

use imbridge_cdp::CdpError;
use thiserror::Error;

/// Why a single strategy did not produce a file.
#[derive(Debug, Error)]
pub enum StrategyError {
    #[error("HTTP {0}")]
    Http(u16),

    #[error("request failed: {0}")]
    Request(String),

    #[error("no page attached")]
    NoPage,

    #[error("page: {0}")]
    Page(#[from] CdpError),

    #[error("no matching file")]
    NotFound,

    #[error("empty body")]
    Empty,

    #[error("decode: {0}")]
    Decode(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("timed out after {0:?}")]
    TimedOut(Duration),
}

#[derive(Debug)]
pub struct StrategyAttempt {
    pub strategy: &'static str,
    pub error: StrategyError,
}

#[derive(Debug, Error)]
pub enum AttachmentError {
    #[error("attachment unavailable: {url} ({})", summarize(.attempts))]
    Unavailable {
        url: String,
        attempts: Vec<StrategyAttempt>,
    },

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

fn summarize(attempts: &[StrategyAttempt]) -> String {
    if attempts.is_empty() {
        return "no strategies".into();
    }
    attempts
        .iter()
        .map(|a| format!("{}: {}", a.strategy, a.error))
        .collect::<Vec<_>>()
        .join("; ")
}
