//! JavaScript evaluated inside the host page.
//!
//! Every script carries an `imbridge:<name>` marker comment so fakes can
//! dispatch on it. Helpers shared between scripts are declared once in
//! [`PRELUDE`] and prepended by [`with_prelude`].

use serde_json::Value;

/// Store and messaging-handle lookup shared by several scripts.
pub const PRELUDE: &str = r#"
function __imbridgeFindStore() {
  var el = document.querySelector('#app');
  if (!el) return null;
  if (el.__vue__ && el.__vue__.$store) return el.__vue__.$store;
  var app = el.__vue_app__;
  if (app && app.config && app.config.globalProperties && app.config.globalProperties.$store) {
    return app.config.globalProperties.$store;
  }
  return null;
}
function __imbridgeFindMessenger(store) {
  if (window.__IMBRIDGE_MESSENGER__ && typeof window.__IMBRIDGE_MESSENGER__.sendText === 'function') {
    return window.__IMBRIDGE_MESSENGER__;
  }
  var candidates = [];
  if (window.nim) candidates.push(window.nim);
  if (store && store.state) {
    var state = store.state;
    Object.keys(state).forEach(function(k) {
      var v = state[k];
      if (v && typeof v === 'object') {
        candidates.push(v);
        Object.keys(v).forEach(function(k2) {
          if (v[k2] && typeof v[k2] === 'object') candidates.push(v[k2]);
        });
      }
    });
  }
  if (store && store._modules && store._modules.root) {
    (function walk(mod) {
      if (!mod || !mod._children) return;
      Object.keys(mod._children).forEach(function(k) {
        var child = mod._children[k];
        if (child && child.state) {
          Object.keys(child.state).forEach(function(sk) {
            var v = child.state[sk];
            if (v && typeof v === 'object') candidates.push(v);
          });
        }
        walk(child);
      });
    })(store._modules.root);
  }
  for (var i = 0; i < candidates.length; i++) {
    if (candidates[i] && typeof candidates[i].sendText === 'function') {
      window.__IMBRIDGE_MESSENGER__ = candidates[i];
      return candidates[i];
    }
  }
  return null;
}
"#;

pub fn with_prelude(body: &str) -> String {
    format!("{PRELUDE}\n{body}")
}

/// JSON-encode a value for splicing into a script as a literal.
pub fn js_literal(value: &str) -> String {
    Value::String(value.to_string()).to_string()
}

/// Returns `"vue2"`, `"vue3"` or `""`.
pub const PROBE: &str = r#"/* imbridge:probe */
(function() {
  var el = document.querySelector('#app');
  if (el && el.__vue__ && el.__vue__.$store) return 'vue2';
  if (el && el.__vue_app__) return 'vue3';
  return '';
})()"#;

/// Structural report used by the `probe` subcommand.
pub const DIAGNOSE: &str = r#"/* imbridge:diagnose */
(function() {
  var store = __imbridgeFindStore();
  var el = document.querySelector('#app');
  var report = {
    url: location.href,
    title: document.title,
    framework: el && el.__vue__ ? 'vue2' : (el && el.__vue_app__ ? 'vue3' : ''),
    hasStore: !!store,
    storeKeys: store && store.state ? Object.keys(store.state).slice(0, 50) : [],
    hasMessenger: !!__imbridgeFindMessenger(store),
    hooked: !!(window.__IMBRIDGE__ && window.__IMBRIDGE__.installed),
    mechanisms: window.__IMBRIDGE__ ? window.__IMBRIDGE__.mechanisms : [],
    buffered: window.__IMBRIDGE__ ? window.__IMBRIDGE__.queue.length : 0
  };
  return report;
})()"#;

/// Installs the capture mechanisms. Called as
/// `(BOOTSTRAP)(force, installers)`; returns `{ok, reused, mechanisms}`.
///
/// A second call without `force` is a no-op while the marker is set.
/// With `force`, existing subscriptions are torn down before reinstalling,
/// so the page never holds two live subscriptions.
pub const BOOTSTRAP: &str = r#"/* imbridge:install */
function(force, installers) {
  var root = window.__IMBRIDGE__;
  if (root && root.installed && !force) {
    return {ok: true, reused: true, mechanisms: root.mechanisms};
  }
  if (root && root.teardowns) {
    root.teardowns.forEach(function(t) { try { t(); } catch (e) {} });
  }
  var queue = (root && root.queue) || [];
  var seen = (root && root.seen) || {};
  var seenCount = (root && root.seenCount) || 0;
  root = window.__IMBRIDGE__ = {
    queue: queue,
    seen: seen,
    seenCount: seenCount,
    installed: false,
    mechanisms: [],
    teardowns: [],
    hookTime: Date.now()
  };
  var ctx = {
    hookTime: root.hookTime,
    findStore: __imbridgeFindStore,
    push: function(rec) {
      if (rec.idClient) {
        if (root.seen[rec.idClient]) return;
        if (root.seenCount > 5000) { root.seen = {}; root.seenCount = 0; }
        root.seen[rec.idClient] = true;
        root.seenCount++;
      }
      root.queue.push(rec);
      if (root.queue.length > 1000) root.queue.splice(0, root.queue.length - 1000);
    }
  };
  installers.forEach(function(entry) {
    try {
      var teardown = entry.install(ctx);
      if (teardown) {
        root.mechanisms.push(entry.name);
        root.teardowns.push(teardown);
        console.log('[imbridge] installed ' + entry.name);
      }
    } catch (e) {
      console.log('[imbridge] ' + entry.name + ' install failed: ' + e.message);
    }
  });
  root.installed = root.mechanisms.length > 0;
  return {ok: root.installed, reused: false, mechanisms: root.mechanisms};
}"#;

/// State-store subscription. Receives every message mutation with the
/// conversation id, sender and attachment metadata.
pub const STORE_INSTALLER: &str = r#"function(ctx) {
  var store = ctx.findStore();
  if (!store || typeof store.subscribe !== 'function') return null;
  var NEW_MSG = ['updateNewMsg', 'onReceiveMsg', 'putMsg', 'addMsg', 'receiveMsg', 'onMsg', 'updateMsg'];
  function looksLikeMsg(p) {
    return p && typeof p === 'object' && (p.text || p.from || p.file) && p.time;
  }
  function sessionOf(msg) {
    if (msg.sessionId) return String(msg.sessionId);
    if (!msg.to) return '';
    var to = String(msg.to);
    if (msg.scene && to.indexOf(msg.scene + '-') !== 0) return msg.scene + '-' + to;
    return to;
  }
  function toRecord(msg) {
    var sessionId = sessionOf(msg);
    if (sessionId.indexOf('p2p-') !== 0 && sessionId.indexOf('team-') !== 0) return null;
    if (msg.time && msg.time < ctx.hookTime - 5000) return null;
    var file = msg.file && msg.file.url ? msg.file : null;
    var text = typeof msg.text === 'string' ? msg.text : '';
    // Structured system payloads, not chat.
    if (text.charAt(0) === '{' || text.charAt(0) === '[') text = '';
    if (!file && !text) return null;
    return {
      source: 'store',
      sessionId: sessionId,
      from: msg.from || msg.fromAccount || '',
      fromNick: msg.fromNick || msg.nick || '',
      text: text,
      msgType: msg.type || 'text',
      attachment: file ? {url: file.url, name: file.name || '', ext: file.ext || '', size: file.size || null} : null,
      flow: msg.flow || '',
      time: msg.time || Date.now(),
      idClient: String(msg.idClient || msg.id || '')
    };
  }
  var unsubscribe = store.subscribe(function(mutation) {
    try {
      var type = mutation.type || '';
      var payload = mutation.payload;
      if (!payload) return;
      var hit = NEW_MSG.some(function(n) { return type.indexOf(n) >= 0; });
      if (!hit && /msg/i.test(type) && (looksLikeMsg(payload) || Array.isArray(payload))) hit = true;
      if (!hit) return;
      var msgs = Array.isArray(payload) ? payload : (payload.msg ? [payload.msg] : (payload.msgs || [payload]));
      msgs.forEach(function(m) {
        if (m && typeof m === 'object') {
          var rec = toRecord(m);
          if (rec) ctx.push(rec);
        }
      });
    } catch (e) {}
  });
  return typeof unsubscribe === 'function' ? unsubscribe : function() {};
}"#;

/// Rendered-conversation observer. Sees only what is on screen, so records
/// carry the `current` placeholder instead of a conversation id.
pub const DOM_INSTALLER: &str = r#"function(ctx) {
  var selectors = ['.session-chat', '.msg-list', '.chat-messages',
    '[class*="message-list"]', '[class*="msg-list"]', '[class*="chat-content"]'];
  var container = null;
  for (var i = 0; i < selectors.length && !container; i++) {
    container = document.querySelector(selectors[i]);
  }
  if (!container) return null;
  var lastCount = container.children.length;
  var observer = new MutationObserver(function() {
    try {
      var count = container.children.length;
      var start = lastCount;
      lastCount = count;
      for (var j = start; j < count; j++) {
        var el = container.children[j];
        var raw = ((el && (el.innerText || el.textContent)) || '').trim();
        if (!raw || raw.length > 4000) continue;
        var parts = raw.split('\n').map(function(s) { return s.trim(); }).filter(Boolean);
        var sender = parts.length > 1 ? parts[0] : '';
        var text = parts.length > 1 ? parts.slice(1).join('\n') : raw;
        if (/^\d{1,2}:\d{2}(:\d{2})?$/.test(text)) continue;
        ctx.push({
          source: 'dom', sessionId: 'current', from: '', fromNick: sender,
          text: text, msgType: 'text', attachment: null, flow: '',
          time: Date.now(), idClient: ''
        });
      }
    } catch (e) {}
  });
  observer.observe(container, {childList: true});
  return function() { observer.disconnect(); };
}"#;

/// Atomically swap out the buffer. `null` means the capture logic is not
/// present (page reloaded or never installed).
pub const DRAIN: &str = r#"/* imbridge:drain */
(function() {
  var root = window.__IMBRIDGE__;
  if (!root || !root.installed) return null;
  var batch = root.queue;
  root.queue = [];
  return batch;
})()"#;

/// `{ok, currSession, sessions: [{id, name, lastMsg, unread}]}`, at most 30.
pub const SESSION_LIST: &str = r#"/* imbridge:sessions */
(function() {
  var store = __imbridgeFindStore();
  if (!store || !store.state) return {ok: false, error: 'store not found'};
  var state = store.state;
  var list = state.sessionList || state.sessions || [];
  if (!Array.isArray(list)) list = Object.keys(list).map(function(k) { return list[k]; });
  var sessions = list.slice(0, 30).map(function(s) {
    var last = s.lastMsg || {};
    return {
      id: s.id || '',
      name: s.name || s.nick || (s.target && s.target.name) || s.to || '',
      lastMsg: typeof last.text === 'string' ? last.text.slice(0, 100) : '',
      unread: s.unread || 0
    };
  });
  return {ok: true, currSession: state.currSessionId || '', sessions: sessions};
})()"#;

/// Own account id; empty string when unknown.
pub const OWN_ACCOUNT: &str = r#"/* imbridge:account */
(function() {
  var store = __imbridgeFindStore();
  var nim = __imbridgeFindMessenger(store);
  if (nim && nim.account) return String(nim.account);
  if (store && store.state) {
    var s = store.state;
    var info = s.myInfo || s.userInfo || s.loginInfo || {};
    if (info.account) return String(info.account);
  }
  return '';
})()"#;

/// Called as `(SEND_TEXT)(chatId, text)`; resolves to `{ok, idClient}` or
/// `{ok: false, error}`.
pub const SEND_TEXT: &str = r#"/* imbridge:send */
function(chatId, text) {
  return new Promise(function(resolve) {
    var store = __imbridgeFindStore();
    var nim = __imbridgeFindMessenger(store);
    if (!nim) { resolve({ok: false, error: 'messaging handle not found'}); return; }
    var dash = chatId.indexOf('-');
    if (dash < 0) { resolve({ok: false, error: 'invalid chat id'}); return; }
    var scene = chatId.slice(0, dash);
    var to = chatId.slice(dash + 1);
    try {
      nim.sendText({
        scene: scene, to: to, text: text,
        done: function(err, msg) {
          if (err) resolve({ok: false, error: String(err.message || err)});
          else resolve({ok: true, idClient: (msg && msg.idClient) || ''});
        }
      });
    } catch (e) {
      resolve({ok: false, error: e.message});
    }
  });
}"#;

/// Bootstrap call expression with the given installers, as `(name, source)`.
/// Expects [`PRELUDE`] to be in scope.
pub fn install_call(force: bool, installers: &[(&str, &str)]) -> String {
    let entries: Vec<String> = installers
        .iter()
        .map(|(name, source)| format!("{{name: {}, install: {source}}}", js_literal(name)))
        .collect();
    format!("({BOOTSTRAP})({force}, [{}])", entries.join(",\n"))
}

pub fn install_script(force: bool, installers: &[(&str, &str)]) -> String {
    with_prelude(&install_call(force, installers))
}

pub fn send_script(chat_id: &str, text: &str) -> String {
    with_prelude(&format!(
        "({SEND_TEXT})({}, {})",
        js_literal(chat_id),
        js_literal(text)
    ))
}
