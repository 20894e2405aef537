//! The bridge worker: single owner of the connector, filter state and
//! session registry. Driven by `poll_loop::run_poll_loop`, which interleaves
//! poll ticks, consumer commands and attachment-fetch completions.

use std::sync::Arc;
use std::time::{Duration, Instant};

use imbridge_attach::AttachmentFetcher;
use imbridge_cdp::messaging::{own_account, send_text, session_list};
use imbridge_cdp::{CdpError, Connector, Injector, PageEvaluator, ReconnectOutcome};
use imbridge_core::{
    AttachmentRef, BridgeMessage, BridgeStatus, CapturedEvent, ConsumerCommand, EchoFilter,
    EchoFilterConfig, FocusState, RelayEvent, SessionList, SessionRegistry, SessionScope, Verdict,
};
use tokio::sync::{Semaphore, oneshot, watch};
use tokio::task::{JoinError, JoinSet};

use crate::outbox::Outbox;

pub const SEND_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Appended to the content of an attachment event whose file could not be
/// retrieved.
pub const UNAVAILABLE_NOTE: &str = "[attachment unavailable: please ask the sender to resend the file]";

/// Connector state as seen by the relay server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkState {
    pub attached: bool,
    pub hooked: bool,
}

impl LinkState {
    pub fn ready(self) -> bool {
        self.attached && self.hooked
    }
}

/// A consumer command plus the channel its reply goes back on.
pub struct BridgeRequest {
    pub command: ConsumerCommand,
    pub reply: oneshot::Sender<BridgeMessage>,
}

// ─── Reconnect backoff ──────────────────────────────────────────────

const MAX_BACKOFF_SHIFT: u32 = 6;

/// Exponential backoff counted in poll ticks: after the n-th consecutive
/// failure the next attempt waits 2^(n-1) ticks, capped at 64.
#[derive(Debug, Default)]
pub struct Backoff {
    failures: u32,
    skip: u32,
}

impl Backoff {
    /// Whether this tick may attempt a reconnect.
    pub fn ready(&mut self) -> bool {
        if self.skip > 0 {
            self.skip -= 1;
            return false;
        }
        true
    }

    pub fn failed(&mut self) -> u32 {
        self.failures = self.failures.saturating_add(1);
        let wait = 1u32 << (self.failures - 1).min(MAX_BACKOFF_SHIFT);
        self.skip = wait - 1;
        wait
    }

    pub fn reset(&mut self) {
        self.failures = 0;
        self.skip = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

// ─── Worker ─────────────────────────────────────────────────────────

pub struct Worker {
    connector: Connector,
    injector: Injector,
    filter: EchoFilter,
    registry: SessionRegistry,
    fetcher: Arc<AttachmentFetcher>,
    fetch_slots: Arc<Semaphore>,
    fetches: JoinSet<RelayEvent>,
    outbox: Arc<Outbox>,
    link: watch::Sender<LinkState>,
    hooked: bool,
    was_attached: bool,
    backoff: Backoff,
    send_retry_delay: Duration,
}

impl Worker {
    pub fn new(
        connector: Connector,
        filter: EchoFilterConfig,
        fetcher: Arc<AttachmentFetcher>,
        max_fetches: usize,
        outbox: Arc<Outbox>,
        link: watch::Sender<LinkState>,
    ) -> Self {
        Self {
            connector,
            injector: Injector::default(),
            filter: EchoFilter::new(filter),
            registry: SessionRegistry::new(),
            fetcher,
            fetch_slots: Arc::new(Semaphore::new(max_fetches.max(1))),
            fetches: JoinSet::new(),
            outbox,
            link,
            hooked: false,
            was_attached: false,
            backoff: Backoff::default(),
            send_retry_delay: SEND_RETRY_DELAY,
        }
    }

    #[cfg(test)]
    pub fn with_send_retry_delay(mut self, delay: Duration) -> Self {
        self.send_retry_delay = delay;
        self
    }

    #[cfg(test)]
    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn has_pending_fetches(&self) -> bool {
        !self.fetches.is_empty()
    }

    pub async fn next_fetch(&mut self) -> Option<Result<RelayEvent, JoinError>> {
        self.fetches.join_next().await
    }

    /// Abandon in-flight fetches. Their events are never emitted.
    pub fn abort_fetches(&mut self) {
        let pending = self.fetches.len();
        self.fetches.abort_all();
        if pending > 0 {
            tracing::info!(pending, "abandoned attachment fetches");
        }
    }

    // ─── Poll tick ──────────────────────────────────────────────────

    pub async fn tick(&mut self, now: Instant) {
        self.fetcher.sweep(now).await;

        if !self.connector.is_alive() {
            self.on_link_down();
            if !self.backoff.ready() {
                return;
            }
            match self.connector.reconnect().await {
                Ok(ReconnectOutcome::Attached(target)) => {
                    self.backoff.reset();
                    tracing::info!(target_id = %target.id, "connector attached");
                    self.on_attached().await;
                }
                Ok(ReconnectOutcome::AlreadyConnected) => {}
                Err(e) => {
                    let wait = self.backoff.failed();
                    if self.backoff.failures() == 1 {
                        tracing::warn!("attach failed: {e}; retrying in {wait} tick(s)");
                    } else {
                        tracing::debug!("attach failed: {e}; retrying in {wait} tick(s)");
                    }
                    return;
                }
            }
        }

        if !self.hooked {
            self.install(false).await;
            if !self.hooked {
                return;
            }
        }

        let Some(page) = self.connector.page() else {
            return;
        };
        let batch = match self.injector.drain(page.as_ref()).await {
            Ok(Some(batch)) => batch,
            Ok(None) => {
                tracing::info!("capture logic missing from page, reinstalling");
                self.set_hooked(false);
                self.install(false).await;
                return;
            }
            Err(e) => {
                self.on_remote_error("drain", &e);
                return;
            }
        };
        if !batch.is_empty() {
            tracing::debug!(events = batch.len(), "drained capture buffer");
            self.process_batch(batch, &page, now).await;
        }
    }

    fn on_link_down(&mut self) {
        if self.was_attached {
            self.was_attached = false;
            self.set_hooked(false);
            self.publish_link(false);
            tracing::warn!("connector lost its target");
            self.outbox.push(BridgeMessage::status(BridgeStatus::Disconnected));
        }
    }

    async fn on_attached(&mut self) {
        self.was_attached = true;
        self.set_hooked(false);
        self.publish_link(true);

        if let Some(page) = self.connector.page() {
            match own_account(page.as_ref()).await {
                Ok(Some(account)) => {
                    tracing::info!(account = %account, "own account identified");
                    self.filter.set_own_account(Some(account));
                }
                Ok(None) => {
                    tracing::warn!("own account unavailable, sender-based echo check disabled")
                }
                Err(e) => tracing::warn!("reading own account failed: {e}"),
            }
        }

        self.install(false).await;
        if self.connector.attachments() > 1 {
            self.outbox.push(BridgeMessage::status(BridgeStatus::Reconnected));
        }
    }

    async fn install(&mut self, force: bool) -> bool {
        let Some(page) = self.connector.page() else {
            return false;
        };
        match self.injector.install(page.as_ref(), force).await {
            Ok(report) => {
                let names: Vec<&str> = report.mechanisms.iter().map(|m| m.name()).collect();
                if report.reused {
                    tracing::debug!("capture logic already present ({})", names.join(", "));
                } else {
                    tracing::info!("capture logic installed ({})", names.join(", "));
                }
                self.set_hooked(true);
                true
            }
            Err(e) => {
                tracing::warn!("injection failed: {e}");
                self.set_hooked(false);
                self.on_remote_error("install", &e);
                false
            }
        }
    }

    fn set_hooked(&mut self, hooked: bool) {
        self.hooked = hooked;
        self.link.send_modify(|link| link.hooked = hooked);
    }

    fn publish_link(&mut self, attached: bool) {
        self.link.send_modify(|link| link.attached = attached);
    }

    /// Transport-level failures drop the attachment; the next tick
    /// reconnects. Anything else is logged and the bridge carries on.
    fn on_remote_error(&mut self, what: &str, err: &CdpError) {
        if err.is_transport() {
            tracing::warn!("{what}: {err}; dropping connection");
            self.connector.disconnect();
        } else {
            tracing::debug!("{what}: {err}");
        }
    }

    async fn process_batch(
        &mut self,
        batch: Vec<CapturedEvent>,
        page: &Arc<dyn PageEvaluator>,
        now: Instant,
    ) {
        if batch.iter().any(CapturedEvent::is_unattributed) {
            if let Err(e) = self.refresh_sessions(page.as_ref()).await {
                tracing::debug!("session refresh for unattributed events failed: {e}");
            }
        }

        for mut event in batch {
            if event.is_unattributed() {
                match self.registry.current_focused() {
                    Some(focused) => event.session_id = focused.to_string(),
                    None => {
                        tracing::debug!("dropping unattributed event: no focused session");
                        continue;
                    }
                }
            }
            if event.is_blank() {
                continue;
            }

            match self.filter.classify(&event, now) {
                Verdict::Accept => {}
                Verdict::DropEcho(reason) => {
                    tracing::debug!(chat_id = %event.session_id, ?reason, "echo suppressed");
                    continue;
                }
                Verdict::DropDuplicate => {
                    tracing::debug!(chat_id = %event.session_id, "duplicate suppressed");
                    continue;
                }
            }

            let is_group = event.is_group();
            let hint = if is_group { "" } else { event.sender_label() };
            self.registry.resolve(&event.session_id, hint, is_group);

            let relay = relay_event(&event);
            match event.attachment.filter(|a| !a.url.is_empty()) {
                Some(attachment) => self.spawn_fetch(relay, attachment, Some(Arc::clone(page))),
                None => self.publish(&relay),
            }
        }
    }

    fn spawn_fetch(
        &mut self,
        mut relay: RelayEvent,
        attachment: AttachmentRef,
        page: Option<Arc<dyn PageEvaluator>>,
    ) {
        let fetcher = Arc::clone(&self.fetcher);
        let slots = Arc::clone(&self.fetch_slots);
        self.fetches.spawn(async move {
            let _permit = slots.acquire_owned().await.ok();
            match fetcher
                .fetch(&attachment, &relay.session_id, &relay.id_client, page)
                .await
            {
                Ok(path) => relay.local_attachment_paths.push(path),
                Err(_) => relay.text = format!("{}\n{UNAVAILABLE_NOTE}", relay.text),
            }
            relay
        });
    }

    pub fn finish_fetch(&mut self, joined: Result<RelayEvent, JoinError>) {
        match joined {
            Ok(relay) => self.publish(&relay),
            Err(e) if e.is_cancelled() => {}
            Err(e) => tracing::warn!("attachment task failed: {e}"),
        }
    }

    fn publish(&self, relay: &RelayEvent) {
        tracing::info!(
            chat_id = %relay.session_id,
            kind = %relay.kind,
            media = relay.local_attachment_paths.len(),
            "relaying message from {}",
            relay.sender_display_name
        );
        self.outbox.push(BridgeMessage::from(relay));
    }

    async fn refresh_sessions(&mut self, page: &dyn PageEvaluator) -> Result<SessionList, CdpError> {
        let list = session_list(page).await?;
        if !list.ok {
            return Err(CdpError::Rejected(
                list.error.clone().unwrap_or_else(|| "session list unavailable".into()),
            ));
        }
        if let FocusState::Unlisted(id) = self.registry.update_from_remote_list(&list) {
            tracing::debug!(chat_id = %id, "focused session missing from session list");
        }
        Ok(list)
    }

    // ─── Consumer commands ──────────────────────────────────────────

    pub async fn handle(&mut self, command: ConsumerCommand) -> BridgeMessage {
        match command {
            ConsumerCommand::Ping => BridgeMessage::status(BridgeStatus::Pong),
            ConsumerCommand::Send { chat_id, text } => self.send(&chat_id, &text).await,
            ConsumerCommand::Sessions => match self.query_sessions().await {
                Ok(data) => BridgeMessage::Sessions { data },
                Err(e) => BridgeMessage::error(e),
            },
            ConsumerCommand::CurrentSession => match self.query_sessions().await {
                Ok(list) => {
                    let me = self.filter.own_account().unwrap_or_default().to_string();
                    BridgeMessage::current_session(list, &me)
                }
                Err(e) => BridgeMessage::error(e),
            },
            ConsumerCommand::MyId => BridgeMessage::MyId {
                account: self.filter.own_account().unwrap_or_default().to_string(),
            },
            ConsumerCommand::Rehook => {
                if !self.connector.is_alive() {
                    return BridgeMessage::error("cdp not connected");
                }
                if self.install(true).await {
                    BridgeMessage::status(BridgeStatus::Hooked)
                } else {
                    BridgeMessage::status(BridgeStatus::HookFailed)
                }
            }
        }
    }

    async fn query_sessions(&mut self) -> Result<SessionList, String> {
        let page = self
            .connector
            .page()
            .filter(|p| p.is_alive())
            .ok_or_else(|| "cdp not connected".to_string())?;
        match self.refresh_sessions(page.as_ref()).await {
            Ok(list) => Ok(list),
            Err(e) => {
                self.on_remote_error("sessions", &e);
                Err(format!("session list failed: {e}"))
            }
        }
    }

    async fn send(&mut self, chat_id: &str, text: &str) -> BridgeMessage {
        if text.trim().is_empty() {
            return BridgeMessage::error("text is empty");
        }
        if SessionScope::of(chat_id).is_none() {
            return BridgeMessage::error(format!("invalid chat_id: {chat_id:?}"));
        }
        let Some(page) = self.connector.page().filter(|p| p.is_alive()) else {
            return BridgeMessage::error("cdp not connected");
        };

        self.filter.record_sent(chat_id, text, Instant::now());

        let mut result = send_text(page.as_ref(), chat_id, text).await;
        if matches!(&result, Err(e) if e.is_timeout()) {
            tracing::warn!(chat_id, "send timed out, retrying once");
            tokio::time::sleep(self.send_retry_delay).await;
            result = send_text(page.as_ref(), chat_id, text).await;
        }

        match result {
            Ok(receipt) => {
                tracing::info!(chat_id, id_client = %receipt.id_client, "message sent");
                BridgeMessage::status(BridgeStatus::Sent)
            }
            Err(e) => {
                tracing::warn!(chat_id, "send failed: {e}");
                if !page.is_alive() {
                    self.connector.disconnect();
                }
                BridgeMessage::error(format!("send failed: {e}"))
            }
        }
    }
}

/// Outward form of an accepted event. Attachments with no text get a
/// placeholder so the consumer never sees empty content.
pub fn relay_event(event: &CapturedEvent) -> RelayEvent {
    let text = if event.text.trim().is_empty() && event.has_attachment() {
        event.kind.placeholder().to_string()
    } else {
        event.text.clone()
    };
    RelayEvent {
        session_id: event.session_id.clone(),
        sender_id: event.sender_id.clone(),
        sender_display_name: event.sender_label().to_string(),
        text,
        kind: event.kind,
        is_group: event.is_group(),
        local_attachment_paths: Vec::new(),
        timestamp: event.timestamp,
        id_client: event.id_client.clone(),
    }
}
