//! Protocol session over one target's debugger WebSocket.
//!
//! Requests carry a monotonically increasing id; a reader task routes each
//! reply to the oneshot registered for it. Console output from the injected
//! logic (`[imbridge]` prefix) is forwarded to tracing at debug level.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use crate::error::CdpError;
use crate::page::PageEvaluator;
use crate::target::RemoteTarget;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>>;

const CONSOLE_PREFIX: &str = "[imbridge";

pub struct CdpSession {
    target: RemoteTarget,
    writer: tokio::sync::Mutex<SplitSink<WsStream, Message>>,
    pending: Pending,
    next_id: AtomicU64,
    alive: Arc<AtomicBool>,
    reader: JoinHandle<()>,
    call_timeout: Duration,
}

impl CdpSession {
    pub async fn connect(
        target: RemoteTarget,
        connect_timeout: Duration,
        call_timeout: Duration,
    ) -> Result<Self, CdpError> {
        let ws_url = target
            .web_socket_debugger_url
            .clone()
            .ok_or_else(|| CdpError::Protocol(format!("target {} has no debugger url", target.id)))?;

        let (stream, _) = timeout(connect_timeout, connect_async(ws_url.as_str()))
            .await
            .map_err(|_| CdpError::Timeout {
                method: "connect".into(),
            })??;
        let (writer, reader) = stream.split();

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));
        let reader = tokio::spawn(read_loop(reader, Arc::clone(&pending), Arc::clone(&alive)));

        tracing::debug!("cdp session opened: {} ({})", target.id, target.url);
        Ok(Self {
            target,
            writer: tokio::sync::Mutex::new(writer),
            pending,
            next_id: AtomicU64::new(1),
            alive,
            reader,
            call_timeout,
        })
    }

    pub fn target(&self) -> &RemoteTarget {
        &self.target
    }

    /// Send a close frame. The reader task observes the close and marks the
    /// session dead.
    pub async fn close(&self) {
        let _ = self.writer.lock().await.send(Message::Close(None)).await;
    }

    fn forget(&self, id: u64) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&id);
        }
    }
}

impl PageEvaluator for CdpSession {
    fn call<'a>(&'a self, method: &'a str, params: Value) -> BoxFuture<'a, Result<Value, CdpError>> {
        Box::pin(async move {
            if !self.is_alive() {
                return Err(CdpError::TransportLost);
            }
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let (tx, rx) = oneshot::channel();
            if let Ok(mut pending) = self.pending.lock() {
                pending.insert(id, tx);
            }

            let frame = json!({"id": id, "method": method, "params": params}).to_string();
            if let Err(e) = self.writer.lock().await.send(Message::Text(frame)).await {
                self.forget(id);
                self.alive.store(false, Ordering::SeqCst);
                return Err(e.into());
            }

            let reply = match timeout(self.call_timeout, rx).await {
                Ok(Ok(reply)) => reply,
                // Sender dropped: the reader exited and cleared the table.
                Ok(Err(_)) => return Err(CdpError::TransportLost),
                Err(_) => {
                    self.forget(id);
                    return Err(CdpError::Timeout {
                        method: method.to_string(),
                    });
                }
            };

            if let Some(error) = reply.get("error") {
                let message = error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown protocol error");
                return Err(CdpError::Protocol(format!("{method}: {message}")));
            }
            Ok(reply.get("result").cloned().unwrap_or(Value::Null))
        })
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst) && !self.reader.is_finished()
    }
}

impl Drop for CdpSession {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_loop(mut reader: SplitStream<WsStream>, pending: Pending, alive: Arc<AtomicBool>) {
    while let Some(frame) = reader.next().await {
        match frame {
            Ok(Message::Text(text)) => route_frame(&text, &pending),
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!("cdp read error: {e}");
                break;
            }
        }
    }
    alive.store(false, Ordering::SeqCst);
    // Dropping the senders fails every in-flight call.
    if let Ok(mut pending) = pending.lock() {
        pending.clear();
    }
    tracing::info!("cdp transport closed");
}

fn route_frame(text: &str, pending: &Pending) {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            tracing::debug!("cdp: undecodable frame: {e}");
            return;
        }
    };

    if let Some(id) = value.get("id").and_then(Value::as_u64) {
        let sender = pending.lock().ok().and_then(|mut p| p.remove(&id));
        if let Some(tx) = sender {
            let _ = tx.send(value);
        }
        return;
    }

    if value.get("method").and_then(Value::as_str) == Some("Runtime.consoleAPICalled") {
        if let Some(line) = console_line(&value) {
            if line.starts_with(CONSOLE_PREFIX) {
                tracing::debug!(target: "imbridge::page", "{line}");
            }
        }
    }
}

/// Join the primitive arguments of a console event into one line.
fn console_line(event: &Value) -> Option<String> {
    let args = event.pointer("/params/args")?.as_array()?;
    let parts: Vec<String> = args
        .iter()
        .filter_map(|arg| match arg.get("value") {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Null) | None => None,
            Some(other) => Some(other.to_string()),
        })
        .collect();
    (!parts.is_empty()).then(|| parts.join(" "))
}
