//! imbridge: relay bridge between a desktop chat client and a downstream
//! agent process.

use clap::Parser;

mod cli;
mod cmd_probe;
mod cmd_targets;
mod config;
mod outbox;
mod poll_loop;
mod server;
mod worker;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = cli::Cli::parse();

    let filter = std::env::var("IMBRIDGE_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .init();

    let config = config::BridgeConfig::from_opts(&args.opts);

    match args.command.unwrap_or(cli::Command::Serve) {
        cli::Command::Serve => {
            tracing::info!(version = env!("CARGO_PKG_VERSION"), "imbridge starting");
            poll_loop::run_bridge(config).await?;
        }
        cli::Command::Targets => cmd_targets::cmd_targets(&config).await?,
        cli::Command::Probe => cmd_probe::cmd_probe(&config).await?,
    }

    Ok(())
}
