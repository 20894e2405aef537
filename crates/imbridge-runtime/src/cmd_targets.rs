//! `imbridge targets`: what the remote control endpoint exposes, in the
//! order the bridge would try to attach.

use imbridge_cdp::target::target_rank;
use imbridge_cdp::{DevtoolsDialer, RemoteTarget, TargetDialer, rank_targets};

use crate::config::BridgeConfig;

pub async fn cmd_targets(config: &BridgeConfig) -> anyhow::Result<()> {
    let dialer = DevtoolsDialer::new(&config.cdp_host, config.cdp_port);
    let targets = dialer.list_targets().await?;
    let total = targets.len();
    let ranked = rank_targets(targets, &config.target_pattern);

    if ranked.is_empty() {
        println!("no attachable targets at {} ({total} listed)", dialer.base_url());
        return Ok(());
    }
    for line in format_targets(&ranked, &config.target_pattern) {
        println!("{line}");
    }
    Ok(())
}

pub(crate) fn format_targets(targets: &[RemoteTarget], url_pattern: &str) -> Vec<String> {
    targets
        .iter()
        .map(|t| {
            let title = if t.title.is_empty() { "-" } else { t.title.as_str() };
            format!(
                "{}  {:<10} {:<36} {}  {}",
                target_rank(t, url_pattern),
                t.kind,
                t.id,
                title,
                t.url
            )
        })
        .collect()
}
