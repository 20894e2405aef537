use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::{SinkExt, StreamExt};
use imbridge_core::protocol::parse_command;
use imbridge_core::{BridgeMessage, BridgeStatus};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Semaphore, mpsc, oneshot, watch};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::outbox::Outbox;
use crate::worker::{BridgeRequest, LinkState};

type ClientError = Box<dyn std::error::Error + Send + Sync>;

// ─── RelayServer ────────────────────────────────────────────────────

const DEFAULT_MAX_CONNECTIONS: usize = 16;

/// WebSocket endpoint for the consumer process.
///
/// The first client holds the primary role and receives the relay stream
/// from the outbox. Clients connecting while a primary exists are query
/// clients: commands and replies only.
pub struct RelayServer {
    addr: String,
    requests: mpsc::Sender<BridgeRequest>,
    outbox: Arc<Outbox>,
    link: watch::Receiver<LinkState>,
    cancel: CancellationToken,
    max_connections: usize,
    primary_taken: Arc<AtomicBool>,
}

impl RelayServer {
    pub fn new(
        addr: String,
        requests: mpsc::Sender<BridgeRequest>,
        outbox: Arc<Outbox>,
        link: watch::Receiver<LinkState>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            addr,
            requests,
            outbox,
            link,
            cancel,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            primary_taken: Arc::new(AtomicBool::new(false)),
        }
    }

    #[cfg(test)]
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Bind to the configured address and return the actual local address.
    pub async fn bind(&self) -> std::io::Result<(TcpListener, SocketAddr)> {
        let listener = TcpListener::bind(&self.addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::debug!(addr = %local_addr, max_connections = self.max_connections, "relay server bound");
        Ok((listener, local_addr))
    }

    /// Run the accept loop on a pre-bound listener until cancelled.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        let semaphore = Arc::new(Semaphore::new(self.max_connections));

        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (stream, peer) = match result {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            tracing::error!(error = %e, "relay: TCP accept failed");
                            continue;
                        }
                    };
                    let Ok(permit) = Arc::clone(&semaphore).try_acquire_owned() else {
                        tracing::warn!(peer = %peer, max = self.max_connections, "relay: connection limit reached, rejecting");
                        drop(stream);
                        continue;
                    };
                    let client = Client {
                        peer,
                        requests: self.requests.clone(),
                        outbox: Arc::clone(&self.outbox),
                        link: self.link.clone(),
                        cancel: self.cancel.clone(),
                        primary_taken: Arc::clone(&self.primary_taken),
                    };
                    tokio::spawn(async move {
                        let _permit = permit;
                        match tokio_tungstenite::accept_async(stream).await {
                            Ok(ws) => {
                                if let Err(e) = client.run(ws).await {
                                    tracing::debug!(peer = %peer, error = %e, "relay client finished with error");
                                }
                            }
                            Err(e) => tracing::debug!(peer = %peer, error = %e, "relay handshake failed"),
                        }
                    });
                }
                _ = self.cancel.cancelled() => {
                    tracing::info!("relay server: cancellation requested, shutting down");
                    break;
                }
            }
        }

        Ok(())
    }
}

// ─── Per-client handler ─────────────────────────────────────────────

/// Releases the primary role when the primary client goes away.
struct PrimaryGuard(Arc<AtomicBool>);

impl Drop for PrimaryGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

struct Client {
    peer: SocketAddr,
    requests: mpsc::Sender<BridgeRequest>,
    outbox: Arc<Outbox>,
    link: watch::Receiver<LinkState>,
    cancel: CancellationToken,
    primary_taken: Arc<AtomicBool>,
}

impl Client {
    async fn run(self, ws: WebSocketStream<TcpStream>) -> Result<(), ClientError> {
        let (mut ws_tx, mut ws_rx) = ws.split();
        let peer = self.peer;

        let guard = self
            .primary_taken
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
            .then(|| PrimaryGuard(Arc::clone(&self.primary_taken)));
        let primary = guard.is_some();
        tracing::info!(peer = %peer, role = if primary { "primary" } else { "query" }, "consumer connected");
        if primary && !self.outbox.is_empty() {
            tracing::info!(
                queued = self.outbox.len(),
                dropped_total = self.outbox.dropped(),
                "delivering frames buffered while no consumer was connected"
            );
        }

        let greeting = if self.link.borrow().ready() {
            BridgeStatus::Ready
        } else {
            BridgeStatus::CdpNotConnected
        };
        ws_tx
            .send(Message::Text(BridgeMessage::status(greeting).to_frame()?))
            .await?;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
                msg = ws_rx.next() => {
                    let text = match msg {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Ping(data))) => {
                            ws_tx.send(Message::Pong(data)).await?;
                            continue;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            tracing::info!(peer = %peer, "consumer disconnected");
                            break;
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            tracing::debug!(peer = %peer, error = %e, "relay read error, dropping client");
                            return Err(e.into());
                        }
                    };
                    let reply = self.dispatch(&text).await;
                    ws_tx.send(Message::Text(reply.to_frame()?)).await?;
                }
                frame = self.outbox.next(), if primary => {
                    let encoded = frame.to_frame()?;
                    if let Err(e) = ws_tx.send(Message::Text(encoded)).await {
                        self.outbox.requeue(frame);
                        return Err(e.into());
                    }
                }
            }
        }

        drop(guard);
        Ok(())
    }

    /// Parse one inbound frame and hand the command to the worker.
    async fn dispatch(&self, text: &str) -> BridgeMessage {
        let command = match parse_command(text) {
            Ok(command) => command,
            Err(e) => {
                tracing::debug!(peer = %self.peer, error = %e, "rejected consumer frame");
                return BridgeMessage::error(e.to_string());
            }
        };
        tracing::debug!(peer = %self.peer, command = ?command, "consumer command");

        let (reply_tx, reply_rx) = oneshot::channel();
        let request = BridgeRequest {
            command,
            reply: reply_tx,
        };
        if self.requests.send(request).await.is_err() {
            return BridgeMessage::error("bridge is shutting down");
        }
        reply_rx
            .await
            .unwrap_or_else(|_| BridgeMessage::error("bridge is shutting down"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use imbridge_core::ConsumerCommand;
    use std::time::Duration;
    use tokio_tungstenite::MaybeTlsStream;

    type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

    struct TestServer {
        addr: SocketAddr,
        outbox: Arc<Outbox>,
        cancel: CancellationToken,
    }

    impl Drop for TestServer {
        fn drop(&mut self) {
            self.cancel.cancel();
        }
    }

    impl TestServer {
        async fn connect(&self) -> Ws {
            let url = format!("ws://127.0.0.1:{}", self.addr.port());
            let (ws, _) = tokio_tungstenite::connect_async(url).await.expect("connect");
            ws
        }
    }

    /// A server whose worker side answers Ping with Pong and everything
    /// else with `sent`.
    async fn start_test_server(link: LinkState) -> TestServer {
        let (request_tx, mut request_rx) = mpsc::channel::<BridgeRequest>(8);
        tokio::spawn(async move {
            while let Some(request) = request_rx.recv().await {
                let reply = match request.command {
                    ConsumerCommand::Ping => BridgeMessage::status(BridgeStatus::Pong),
                    _ => BridgeMessage::status(BridgeStatus::Sent),
                };
                let _ = request.reply.send(reply);
            }
        });

        let outbox = Arc::new(Outbox::new(16));
        let (_link_tx, link_rx) = watch::channel(link);
        let cancel = CancellationToken::new();
        let server = RelayServer::new(
            "127.0.0.1:0".into(),
            request_tx,
            Arc::clone(&outbox),
            link_rx,
            cancel.clone(),
        );
        let (listener, addr) = server.bind().await.expect("bind");
        tokio::spawn(async move { server.serve(listener).await });
        TestServer {
            addr,
            outbox,
            cancel,
        }
    }

    async fn recv_json(ws: &mut Ws) -> serde_json::Value {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(2), ws.next())
                .await
                .expect("frame in time")
                .expect("stream open")
                .expect("frame");
            if let Message::Text(text) = msg {
                return serde_json::from_str(&text).expect("json frame");
            }
        }
    }

    async fn send_text(ws: &mut Ws, text: &str) {
        ws.send(Message::Text(text.to_string())).await.expect("send");
    }

    fn linked() -> LinkState {
        LinkState {
            attached: true,
            hooked: true,
        }
    }

    #[tokio::test]
    async fn greets_with_link_status() {
        let up = start_test_server(linked()).await;
        let mut ws = up.connect().await;
        assert_eq!(recv_json(&mut ws).await["status"], "ready");

        let down = start_test_server(LinkState::default()).await;
        let mut ws = down.connect().await;
        let frame = recv_json(&mut ws).await;
        assert_eq!(frame["type"], "status");
        assert_eq!(frame["status"], "cdp_not_connected");
    }

    #[tokio::test]
    async fn ping_command_gets_pong() {
        let server = start_test_server(linked()).await;
        let mut ws = server.connect().await;
        recv_json(&mut ws).await;

        send_text(&mut ws, r#"{"type":"ping"}"#).await;
        assert_eq!(recv_json(&mut ws).await["status"], "pong");
    }

    #[tokio::test]
    async fn malformed_frame_gets_error_and_keeps_connection() {
        let server = start_test_server(linked()).await;
        let mut ws = server.connect().await;
        recv_json(&mut ws).await;

        send_text(&mut ws, "not json").await;
        let frame = recv_json(&mut ws).await;
        assert_eq!(frame["type"], "error");

        send_text(&mut ws, r#"{"type":"launch"}"#).await;
        assert_eq!(recv_json(&mut ws).await["type"], "error");

        send_text(&mut ws, r#"{"type":"ping"}"#).await;
        assert_eq!(recv_json(&mut ws).await["status"], "pong");
    }

    #[tokio::test]
    async fn primary_receives_outbox_frames() {
        let server = start_test_server(linked()).await;
        let mut ws = server.connect().await;
        recv_json(&mut ws).await;

        server.outbox.push(BridgeMessage::status(BridgeStatus::Reconnected));
        assert_eq!(recv_json(&mut ws).await["status"], "reconnected");
    }

    #[tokio::test]
    async fn frames_queued_while_away_reach_the_next_primary() {
        let server = start_test_server(linked()).await;
        server.outbox.push(BridgeMessage::status(BridgeStatus::Disconnected));

        let mut ws = server.connect().await;
        assert_eq!(recv_json(&mut ws).await["status"], "ready");
        assert_eq!(recv_json(&mut ws).await["status"], "disconnected");
    }

    #[tokio::test]
    async fn second_client_is_query_only_until_primary_leaves() {
        let server = start_test_server(linked()).await;
        let mut primary = server.connect().await;
        recv_json(&mut primary).await;
        let mut query = server.connect().await;
        recv_json(&mut query).await;

        send_text(&mut query, r#"{"type":"ping"}"#).await;
        assert_eq!(recv_json(&mut query).await["status"], "pong");

        server.outbox.push(BridgeMessage::status(BridgeStatus::Hooked));
        assert_eq!(recv_json(&mut primary).await["status"], "hooked");

        primary.close(None).await.expect("close");
        drop(primary);
        // Give the server a moment to release the role.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut next = server.connect().await;
        recv_json(&mut next).await;
        server.outbox.push(BridgeMessage::status(BridgeStatus::Reconnected));
        assert_eq!(recv_json(&mut next).await["status"], "reconnected");
    }

    #[tokio::test]
    async fn connection_limit_rejects_extra_clients() {
        let (request_tx, _request_rx) = mpsc::channel(1);
        let (_link_tx, link_rx) = watch::channel(LinkState::default());
        let cancel = CancellationToken::new();
        let server = RelayServer::new(
            "127.0.0.1:0".into(),
            request_tx,
            Arc::new(Outbox::new(4)),
            link_rx,
            cancel.clone(),
        )
        .with_max_connections(1);
        let (listener, addr) = server.bind().await.expect("bind");
        tokio::spawn(async move { server.serve(listener).await });
        let url = format!("ws://127.0.0.1:{}", addr.port());

        let (mut first, _) = tokio_tungstenite::connect_async(&url).await.expect("first");
        recv_json(&mut first).await;
        assert!(tokio_tungstenite::connect_async(&url).await.is_err());
        cancel.cancel();
    }

    #[tokio::test]
    async fn cancel_closes_clients() {
        let server = start_test_server(linked()).await;
        let mut ws = server.connect().await;
        recv_json(&mut ws).await;

        server.cancel.cancel();
        let msg = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("closed in time");
        assert!(matches!(msg, Some(Ok(Message::Close(_))) | None | Some(Err(_))));
    }
}
