//! CLI definition using clap derive. Every option can also come from the
//! environment.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "imbridge", about = "Chat client relay bridge", version)]
pub struct Cli {
    #[command(flatten)]
    pub opts: BridgeOpts,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Run the bridge (default)
    Serve,
    /// List attachable targets of the remote control endpoint
    Targets,
    /// Attach to the best target and print a page diagnosis
    Probe,
}

#[derive(clap::Args, Debug, Clone)]
pub struct BridgeOpts {
    /// Relay socket bind host
    #[arg(long, env = "IMBRIDGE_WS_HOST", default_value = "0.0.0.0", global = true)]
    pub ws_host: String,

    /// Relay socket port
    #[arg(long, env = "IMBRIDGE_WS_PORT", default_value_t = 3010, global = true)]
    pub ws_port: u16,

    /// Remote control endpoint host
    #[arg(long, env = "IMBRIDGE_CDP_HOST", default_value = "127.0.0.1", global = true)]
    pub cdp_host: String,

    /// Remote control endpoint port
    #[arg(long, env = "IMBRIDGE_CDP_PORT", default_value_t = 9222, global = true)]
    pub cdp_port: u16,

    /// Poll interval in seconds
    #[arg(long, env = "IMBRIDGE_POLL_INTERVAL", default_value_t = 3, global = true)]
    pub poll_interval_secs: u64,

    /// Root directory for downloaded attachments
    #[arg(long, env = "IMBRIDGE_FILES_DIR", default_value = "./workspace/bridge-files", global = true)]
    pub files_dir: PathBuf,

    /// Host application's own file cache, searched as a last resort
    #[arg(long, env = "IMBRIDGE_HOST_CACHE", global = true)]
    pub host_cache_dir: Option<PathBuf>,

    /// Window for collapsing identical events, in seconds
    #[arg(long, env = "IMBRIDGE_DEDUP_WINDOW", default_value_t = 5, global = true)]
    pub dedup_window_secs: u64,

    /// Window for matching echoes of our own sends, in seconds
    #[arg(long, env = "IMBRIDGE_ECHO_WINDOW", default_value_t = 5, global = true)]
    pub echo_window_secs: u64,

    /// Hours to keep downloaded attachments
    #[arg(long, env = "IMBRIDGE_RETENTION_HOURS", default_value_t = 1, global = true)]
    pub retention_hours: u64,

    /// URL fragment identifying the conversation view
    #[arg(long, env = "IMBRIDGE_TARGET_PATTERN", default_value = "im-view", global = true)]
    pub target_pattern: String,

    /// Attachment fetches allowed in flight
    #[arg(long, env = "IMBRIDGE_MAX_FETCHES", default_value_t = 4, global = true)]
    pub max_fetches: usize,

    /// Frames buffered for the consumer before the oldest are dropped
    #[arg(long, env = "IMBRIDGE_OUTBOX_CAPACITY", default_value_t = 256, global = true)]
    pub outbox_capacity: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cli = Cli::try_parse_from(["imbridge"]).expect("parse");
        assert_eq!(cli.command, None);
        assert_eq!(cli.opts.ws_port, 3010);
        assert_eq!(cli.opts.cdp_port, 9222);
        assert_eq!(cli.opts.poll_interval_secs, 3);
        assert_eq!(cli.opts.target_pattern, "im-view");
        assert!(cli.opts.host_cache_dir.is_none());
    }

    #[test]
    fn flags_after_subcommand() {
        let cli = Cli::try_parse_from(["imbridge", "probe", "--cdp-port", "9333"]).expect("parse");
        assert_eq!(cli.command, Some(Command::Probe));
        assert_eq!(cli.opts.cdp_port, 9333);
    }
}
