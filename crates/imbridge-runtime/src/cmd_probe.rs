//! `imbridge probe`: attach once and print what the page exposes.

use std::sync::Arc;

use anyhow::Context;
use imbridge_cdp::{Connector, DevtoolsDialer, TargetDialer, messaging};
use serde_json::{Value, json};

use crate::config::BridgeConfig;

pub async fn cmd_probe(config: &BridgeConfig) -> anyhow::Result<()> {
    let dialer = DevtoolsDialer::new(&config.cdp_host, config.cdp_port);
    let mut connector = Connector::new(
        Arc::new(dialer) as Arc<dyn TargetDialer>,
        config.target_pattern.clone(),
    );
    let report = probe_report(&mut connector).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    connector.disconnect();
    Ok(())
}

/// Attach and collect the target, the page diagnosis, the logged-in
/// account and the session list into one document.
pub(crate) async fn probe_report(connector: &mut Connector) -> anyhow::Result<Value> {
    let target = connector
        .attach()
        .await
        .context("no target exposes the chat application")?;
    let page = connector
        .page()
        .context("attachment dropped right after attach")?;

    let diagnosis = messaging::diagnose(page.as_ref()).await?;
    let account = messaging::own_account(page.as_ref()).await.unwrap_or_else(|e| {
        tracing::debug!("own account lookup failed: {e}");
        None
    });
    let sessions = match messaging::session_list(page.as_ref()).await {
        Ok(list) => serde_json::to_value(list)?,
        Err(e) => json!({"error": e.to_string()}),
    };

    Ok(json!({
        "target": {"id": target.id, "title": target.title, "url": target.url},
        "diagnosis": diagnosis,
        "account": account,
        "sessions": sessions,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use imbridge_cdp::testing::{FakeDialer, FakePage, page_target};

    #[tokio::test]
    async fn report_combines_page_queries() {
        let page = Arc::new(FakePage::new());
        page.set_account("me-1");
        page.set_sessions(json!({"ok": true, "currSession": "p2p-7", "sessions": []}));
        let dialer = Arc::new(FakeDialer::new());
        dialer.add_target(page_target("im", "app://im-view"), Arc::clone(&page));

        let mut connector = Connector::new(dialer as Arc<dyn TargetDialer>, "im-view");
        let report = probe_report(&mut connector).await.expect("report");

        assert_eq!(report["target"]["id"], "im");
        assert_eq!(report["diagnosis"]["framework"], "vue2");
        assert_eq!(report["account"], "me-1");
        assert_eq!(report["sessions"]["currSession"], "p2p-7");
    }

    #[tokio::test]
    async fn no_target_is_an_error() {
        let dialer = Arc::new(FakeDialer::new());
        let mut connector = Connector::new(dialer as Arc<dyn TargetDialer>, "im-view");
        assert!(probe_report(&mut connector).await.is_err());
    }
}
