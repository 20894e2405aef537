//! In-memory dialer and page for tests.
//!
//! `FakePage` models the page side of the injected logic: the install
//! marker, one live subscription per install, the swap-drained buffer, the
//! session store and the messaging handle. Scripts are dispatched on their
//! `imbridge:<name>` marker.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::future::BoxFuture;
use serde_json::{Value, json};

use crate::dialer::TargetDialer;
use crate::error::CdpError;
use crate::page::PageEvaluator;
use crate::target::RemoteTarget;

#[derive(Debug)]
struct FakePageState {
    framework: String,
    mechanisms: Vec<String>,
    installed: bool,
    subscriptions: usize,
    installs: usize,
    queue: Vec<Value>,
    sessions: Value,
    account: String,
    send_reply: Value,
    send_timeouts: usize,
    sent: Vec<(String, String)>,
    responses: HashMap<String, Result<Value, String>>,
    calls: Vec<String>,
    call_params: Vec<(String, Value)>,
}

impl Default for FakePageState {
    fn default() -> Self {
        Self {
            framework: "vue2".into(),
            mechanisms: vec!["store".into(), "dom".into()],
            installed: false,
            subscriptions: 0,
            installs: 0,
            queue: Vec::new(),
            sessions: json!({"ok": true, "currSession": "", "sessions": []}),
            account: String::new(),
            send_reply: json!({"ok": true, "idClient": "fake-id"}),
            send_timeouts: 0,
            sent: Vec::new(),
            responses: HashMap::new(),
            calls: Vec::new(),
            call_params: Vec::new(),
        }
    }
}

#[derive(Debug)]
pub struct FakePage {
    alive: AtomicBool,
    state: Mutex<FakePageState>,
}

impl Default for FakePage {
    fn default() -> Self {
        Self {
            alive: AtomicBool::new(true),
            state: Mutex::new(FakePageState::default()),
        }
    }
}

impl FakePage {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FakePageState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ─── Scenario setup ─────────────────────────────────────────────

    pub fn set_framework(&self, framework: &str) {
        self.state().framework = framework.into();
    }

    pub fn set_mechanisms(&self, mechanisms: &[&str]) {
        self.state().mechanisms = mechanisms.iter().map(|m| m.to_string()).collect();
    }

    pub fn set_sessions(&self, sessions: Value) {
        self.state().sessions = sessions;
    }

    pub fn set_account(&self, account: &str) {
        self.state().account = account.into();
    }

    pub fn set_send_reply(&self, reply: Value) {
        self.state().send_reply = reply;
    }

    /// The next `n` sends time out without reaching the handle.
    pub fn time_out_sends(&self, n: usize) {
        self.state().send_timeouts = n;
    }

    /// Fixed reply for scripts carrying `imbridge:<marker>`.
    pub fn respond(&self, marker: &str, value: Value) {
        self.state().responses.insert(marker.into(), Ok(value));
    }

    /// Scripts carrying `imbridge:<marker>` throw.
    pub fn throw_on(&self, marker: &str, message: &str) {
        self.state().responses.insert(marker.into(), Err(message.into()));
    }

    /// A message reaching every live subscription.
    pub fn emit(&self, record: Value) {
        let mut state = self.state();
        for _ in 0..state.subscriptions {
            state.queue.push(record.clone());
        }
    }

    /// Navigation wipes the injected logic and its buffer.
    pub fn reload(&self) {
        let mut state = self.state();
        state.installed = false;
        state.subscriptions = 0;
        state.queue.clear();
    }

    /// Transport loss.
    pub fn kill(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    // ─── Inspection ─────────────────────────────────────────────────

    pub fn install_count(&self) -> usize {
        self.state().installs
    }

    pub fn is_installed(&self) -> bool {
        self.state().installed
    }

    pub fn sent(&self) -> Vec<(String, String)> {
        self.state().sent.clone()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    /// Parameters of every protocol call to `method`, in order.
    pub fn call_params(&self, method: &str) -> Vec<Value> {
        self.state()
            .call_params
            .iter()
            .filter(|(m, _)| m == method)
            .map(|(_, p)| p.clone())
            .collect()
    }

    fn run_script(&self, expression: &str) -> Result<Value, CdpError> {
        let marker = script_marker(expression).unwrap_or("unknown").to_string();
        let mut state = self.state();
        state.calls.push(marker.clone());

        if let Some(response) = state.responses.get(&marker) {
            return response.clone().map_err(CdpError::Script);
        }

        match marker.as_str() {
            "probe" => Ok(json!(state.framework)),
            "install" => {
                let force = expression.contains(")(true, [");
                if state.installed && !force {
                    return Ok(json!({"ok": true, "reused": true, "mechanisms": state.mechanisms}));
                }
                state.installs += 1;
                state.installed = !state.mechanisms.is_empty();
                state.subscriptions = usize::from(state.installed);
                Ok(json!({"ok": state.installed, "reused": false, "mechanisms": state.mechanisms}))
            }
            "drain" => {
                if !state.installed {
                    return Ok(Value::Null);
                }
                Ok(Value::Array(std::mem::take(&mut state.queue)))
            }
            "sessions" => Ok(state.sessions.clone()),
            "account" => Ok(json!(state.account)),
            "diagnose" => Ok(json!({
                "framework": state.framework,
                "hooked": state.installed,
                "mechanisms": state.mechanisms,
                "buffered": state.queue.len(),
            })),
            "send" => {
                if state.send_timeouts > 0 {
                    state.send_timeouts -= 1;
                    return Err(CdpError::Timeout {
                        method: "Runtime.evaluate".into(),
                    });
                }
                let (chat_id, text) = send_arguments(expression)
                    .ok_or_else(|| CdpError::Script("unparseable send arguments".into()))?;
                if state.send_reply["ok"] == json!(true) {
                    state.sent.push((chat_id, text));
                }
                Ok(state.send_reply.clone())
            }
            _ => Ok(Value::Null),
        }
    }
}

impl PageEvaluator for FakePage {
    fn call<'a>(&'a self, method: &'a str, params: Value) -> BoxFuture<'a, Result<Value, CdpError>> {
        Box::pin(async move {
            if !self.is_alive() {
                return Err(CdpError::TransportLost);
            }
            let mut state = self.state();
            state.calls.push(method.to_string());
            state.call_params.push((method.to_string(), params));
            drop(state);
            Ok(json!({}))
        })
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn evaluate<'a>(
        &'a self,
        expression: &'a str,
        _await_promise: bool,
    ) -> BoxFuture<'a, Result<Value, CdpError>> {
        Box::pin(async move {
            if !self.is_alive() {
                return Err(CdpError::TransportLost);
            }
            self.run_script(expression)
        })
    }
}

fn script_marker(expression: &str) -> Option<&str> {
    let start = expression.find("/* imbridge:")? + "/* imbridge:".len();
    let rest = &expression[start..];
    let end = rest.find(" */")?;
    Some(&rest[..end])
}

/// `(...)("p2p-1", "text")` -> the two literals.
fn send_arguments(expression: &str) -> Option<(String, String)> {
    let start = expression.rfind("})(")? + 3;
    let inner = expression[start..].trim_end().strip_suffix(')')?;
    let args: Vec<String> = serde_json::from_str(&format!("[{inner}]")).ok()?;
    match args.as_slice() {
        [chat_id, text] => Some((chat_id.clone(), text.clone())),
        _ => None,
    }
}

// ─── Dialer ─────────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeDialer {
    targets: Mutex<Vec<RemoteTarget>>,
    pages: Mutex<HashMap<String, VecDeque<Arc<FakePage>>>>,
    unreachable: AtomicBool,
    opened: Mutex<Vec<String>>,
}

impl FakeDialer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a target. Each `open` hands out the next queued page; the
    /// last one is reused once the queue runs down to it.
    pub fn add_target(&self, target: RemoteTarget, page: Arc<FakePage>) {
        lock(&self.pages)
            .entry(target.id.clone())
            .or_default()
            .push_back(page);
        let mut targets = lock(&self.targets);
        if !targets.iter().any(|t| t.id == target.id) {
            targets.push(target);
        }
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn opened(&self) -> Vec<String> {
        lock(&self.opened).clone()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

pub fn page_target(id: &str, url: &str) -> RemoteTarget {
    RemoteTarget {
        id: id.into(),
        kind: "page".into(),
        title: String::new(),
        url: url.into(),
        web_socket_debugger_url: Some(format!("ws://fake/devtools/page/{id}")),
    }
}

impl TargetDialer for FakeDialer {
    fn list_targets(&self) -> BoxFuture<'_, Result<Vec<RemoteTarget>, CdpError>> {
        Box::pin(async move {
            if self.unreachable.load(Ordering::SeqCst) {
                return Err(CdpError::EndpointUnreachable("fake endpoint down".into()));
            }
            Ok(lock(&self.targets).clone())
        })
    }

    fn open<'a>(
        &'a self,
        target: &'a RemoteTarget,
    ) -> BoxFuture<'a, Result<Arc<dyn PageEvaluator>, CdpError>> {
        Box::pin(async move {
            lock(&self.opened).push(target.id.clone());
            let mut pages = lock(&self.pages);
            let queue = pages
                .get_mut(&target.id)
                .ok_or_else(|| CdpError::Protocol(format!("no page for {}", target.id)))?;
            let page = if queue.len() > 1 {
                queue.pop_front()
            } else {
                queue.front().cloned()
            }
            .ok_or_else(|| CdpError::Protocol(format!("no page for {}", target.id)))?;
            Ok(page as Arc<dyn PageEvaluator>)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_extraction() {
        assert_eq!(script_marker("x /* imbridge:drain */ (function(){})()"), Some("drain"));
        assert_eq!(script_marker("(function(){})()"), None);
    }

    #[test]
    fn send_argument_extraction() {
        let script = crate::scripts::send_script("team-3", "a, \"b\")");
        assert_eq!(
            send_arguments(&script),
            Some(("team-3".to_string(), "a, \"b\")".to_string()))
        );
    }
}
