use std::path::PathBuf;
use std::time::Duration;

use imbridge_core::EchoFilterConfig;

use crate::cli::BridgeOpts;

/// Resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub ws_host: String,
    pub ws_port: u16,
    pub cdp_host: String,
    pub cdp_port: u16,
    pub poll_interval: Duration,
    /// Per-run download directory under the files root.
    pub run_dir: PathBuf,
    pub host_cache_dir: Option<PathBuf>,
    pub filter: EchoFilterConfig,
    pub retention: Duration,
    pub target_pattern: String,
    pub max_fetches: usize,
    pub outbox_capacity: usize,
}

impl BridgeConfig {
    pub fn from_opts(opts: &BridgeOpts) -> Self {
        Self {
            ws_host: opts.ws_host.clone(),
            ws_port: opts.ws_port,
            cdp_host: opts.cdp_host.clone(),
            cdp_port: opts.cdp_port,
            poll_interval: Duration::from_secs(opts.poll_interval_secs.max(1)),
            run_dir: opts.files_dir.join(run_id()),
            host_cache_dir: opts.host_cache_dir.clone(),
            filter: EchoFilterConfig {
                echo_window: Duration::from_secs(opts.echo_window_secs),
                dedup_window: Duration::from_secs(opts.dedup_window_secs),
            },
            retention: Duration::from_secs(opts.retention_hours.saturating_mul(3600)),
            target_pattern: opts.target_pattern.clone(),
            max_fetches: opts.max_fetches.max(1),
            outbox_capacity: opts.outbox_capacity.max(1),
        }
    }

    pub fn ws_addr(&self) -> String {
        format!("{}:{}", self.ws_host, self.ws_port)
    }
}

/// Start time (UTC) plus pid, so concurrent runs never share a directory.
fn run_id() -> String {
    format!(
        "{}-{}",
        chrono::Utc::now().format("%Y%m%dT%H%M%SZ"),
        std::process::id()
    )
}
