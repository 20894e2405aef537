//! Bridge assembly and the worker's event loop.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use imbridge_attach::AttachmentFetcher;
use imbridge_cdp::{Connector, DevtoolsDialer, TargetDialer};
use tokio::sync::{mpsc, watch};
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;

use crate::config::BridgeConfig;
use crate::outbox::Outbox;
use crate::server::RelayServer;
use crate::worker::{BridgeRequest, LinkState, Worker};

const REQUEST_QUEUE: usize = 32;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

pub async fn run_bridge(config: BridgeConfig) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    let outbox = Arc::new(Outbox::new(config.outbox_capacity));
    let (link_tx, link_rx) = watch::channel(LinkState::default());
    let (request_tx, request_rx) = mpsc::channel(REQUEST_QUEUE);

    // Failing to bind is the one fatal error.
    let server = RelayServer::new(
        config.ws_addr(),
        request_tx,
        Arc::clone(&outbox),
        link_rx,
        cancel.clone(),
    );
    let (listener, local_addr) = server
        .bind()
        .await
        .with_context(|| format!("failed to bind relay socket on {}", config.ws_addr()))?;
    tracing::info!(addr = %local_addr, "relay server listening");

    let dialer = DevtoolsDialer::new(&config.cdp_host, config.cdp_port);
    tracing::info!(endpoint = dialer.base_url(), pattern = %config.target_pattern, "remote control endpoint");
    let connector = Connector::new(
        Arc::new(dialer) as Arc<dyn TargetDialer>,
        config.target_pattern.clone(),
    );
    let fetcher = Arc::new(AttachmentFetcher::standard(
        config.run_dir.clone(),
        config.retention,
        config.host_cache_dir.clone(),
    ));
    tracing::info!(dir = %config.run_dir.display(), "attachment directory");

    let worker = Worker::new(
        connector,
        config.filter,
        fetcher,
        config.max_fetches,
        Arc::clone(&outbox),
        link_tx,
    );

    let mut server_handle = tokio::spawn(async move {
        if let Err(e) = server.serve(listener).await {
            tracing::error!("relay server error: {e}");
        }
    });
    let mut poll_handle = tokio::spawn(run_poll_loop(
        worker,
        request_rx,
        config.poll_interval,
        cancel.clone(),
    ));

    // Wait for shutdown signal (ctrl-c or SIGTERM)
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = ctrl_c => tracing::info!("received ctrl-c, shutting down"),
                        _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
                    }
                }
                Err(e) => {
                    tracing::warn!("SIGTERM handler unavailable: {e}");
                    ctrl_c.await.ok();
                    tracing::info!("received ctrl-c, shutting down");
                }
            }
        }

        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            tracing::info!("received ctrl-c, shutting down");
        }
    };

    let (mut poll_running, mut server_running) = (true, true);
    tokio::select! {
        () = shutdown => {}
        _ = &mut poll_handle => {
            poll_running = false;
            tracing::warn!("poll loop exited unexpectedly");
        }
        _ = &mut server_handle => {
            server_running = false;
            tracing::warn!("relay server exited unexpectedly");
        }
    }

    cancel.cancel();
    if poll_running {
        let _ = tokio::time::timeout(SHUTDOWN_GRACE, poll_handle).await;
    }
    if server_running {
        let _ = tokio::time::timeout(SHUTDOWN_GRACE, server_handle).await;
    }
    tracing::info!("bridge stopped");
    Ok(())
}

/// Drive the worker until cancelled: one tick per interval, consumer
/// commands as they arrive, attachment results as they complete.
pub async fn run_poll_loop(
    mut worker: Worker,
    mut requests: mpsc::Receiver<BridgeRequest>,
    poll_interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => worker.tick(Instant::now()).await,
            Some(request) = requests.recv() => {
                let reply = worker.handle(request.command).await;
                if request.reply.send(reply).is_err() {
                    tracing::debug!("requester went away before the reply");
                }
            }
            Some(done) = worker.next_fetch(), if worker.has_pending_fetches() => {
                worker.finish_fetch(done);
            }
        }
    }

    worker.abort_fetches();
    tracing::info!("poll loop stopped");
}
