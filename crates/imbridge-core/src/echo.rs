//! Echo and duplicate suppression for captured events.
//!
//! The remote side's notion of "outbound" is unreliable during rapid
//! send/observe races, so three independent echo checks run before the
//! duplicate check. State lives for one process run only.
//!
//! All time is passed in explicitly (`now: Instant`) so the filter can be
//! driven with a fake clock.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::types::{CapturedEvent, Direction};

// ─── Constants ───────────────────────────────────────────────────────

/// Number of recent outbound sends remembered for echo matching.
pub const SENT_RING_CAPACITY: usize = 50;

pub const DEFAULT_ECHO_WINDOW: Duration = Duration::from_secs(5);

pub const DEFAULT_DEDUP_WINDOW: Duration = Duration::from_secs(5);

/// Map size above which expired dedup entries are pruned.
const DEDUP_PRUNE_THRESHOLD: usize = 200;

/// Normalized text is cut to this many chars before keying.
const NORMALIZED_TEXT_MAX_CHARS: usize = 100;

// ─── Verdict ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EchoReason {
    /// Remote side labelled the message as outbound.
    OutboundFlow,
    /// Sender is the bridge's own account.
    OwnAccount,
    /// Text matches something the bridge sent to this session recently.
    RecentSend,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    DropEcho(EchoReason),
    DropDuplicate,
}

impl Verdict {
    pub fn is_accept(self) -> bool {
        self == Self::Accept
    }
}

// ─── Records ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentTextRecord {
    pub session_id: String,
    pub text: String,
    pub sent_at: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub session_id: String,
    pub normalized_text: String,
}

impl DedupKey {
    /// Attachment events also key on the remote locator so two different
    /// images in one conversation are not collapsed.
    pub fn of(event: &CapturedEvent) -> Self {
        let mut normalized_text = normalize_text(&event.text);
        if let Some(att) = event.attachment.as_ref().filter(|a| !a.url.is_empty()) {
            normalized_text.push('\u{1f}');
            normalized_text.push_str(&att.url);
        }
        Self {
            session_id: event.session_id.clone(),
            normalized_text,
        }
    }
}

/// Collapse whitespace runs and cap length.
pub fn normalize_text(text: &str) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.chars().take(NORMALIZED_TEXT_MAX_CHARS).collect()
}

// ─── Filter ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EchoFilterConfig {
    pub echo_window: Duration,
    pub dedup_window: Duration,
}

impl Default for EchoFilterConfig {
    fn default() -> Self {
        Self {
            echo_window: DEFAULT_ECHO_WINDOW,
            dedup_window: DEFAULT_DEDUP_WINDOW,
        }
    }
}

/// Owned, single-writer filter state. Survives reconnects within a run.
#[derive(Debug)]
pub struct EchoFilter {
    config: EchoFilterConfig,
    own_account: Option<String>,
    sent: VecDeque<SentTextRecord>,
    seen: HashMap<DedupKey, Instant>,
}

impl EchoFilter {
    pub fn new(config: EchoFilterConfig) -> Self {
        Self {
            config,
            own_account: None,
            sent: VecDeque::with_capacity(SENT_RING_CAPACITY),
            seen: HashMap::new(),
        }
    }

    pub fn config(&self) -> EchoFilterConfig {
        self.config
    }

    /// Set the authenticated account id of the bridge. Empty ids are ignored.
    pub fn set_own_account(&mut self, account: Option<String>) {
        self.own_account = account.filter(|a| !a.is_empty());
    }

    pub fn own_account(&self) -> Option<&str> {
        self.own_account.as_deref()
    }

    /// Remember an outbound send. Must be called before the send is
    /// dispatched so its echo can never arrive first.
    pub fn record_sent(&mut self, session_id: &str, text: &str, now: Instant) {
        if self.sent.len() == SENT_RING_CAPACITY {
            self.sent.pop_front();
        }
        self.sent.push_back(SentTextRecord {
            session_id: session_id.to_string(),
            text: text.trim().to_string(),
            sent_at: now,
        });
    }

    pub fn sent_len(&self) -> usize {
        self.sent.len()
    }

    pub fn dedup_len(&self) -> usize {
        self.seen.len()
    }

    /// Classify one event. First matching rule wins.
    pub fn classify(&mut self, event: &CapturedEvent, now: Instant) -> Verdict {
        if event.direction == Direction::Outbound {
            return Verdict::DropEcho(EchoReason::OutboundFlow);
        }

        if let Some(account) = &self.own_account
            && event.sender_id == *account
        {
            return Verdict::DropEcho(EchoReason::OwnAccount);
        }

        if self.matches_recent_send(event, now) {
            return Verdict::DropEcho(EchoReason::RecentSend);
        }

        let key = DedupKey::of(event);
        if let Some(last) = self.seen.get(&key)
            && now.saturating_duration_since(*last) < self.config.dedup_window
        {
            return Verdict::DropDuplicate;
        }
        self.seen.insert(key, now);
        self.prune(now);
        Verdict::Accept
    }

    fn matches_recent_send(&self, event: &CapturedEvent, now: Instant) -> bool {
        let text = event.text.trim();
        if text.is_empty() {
            return false;
        }
        self.sent.iter().any(|record| {
            record.session_id == event.session_id
                && record.text == text
                && now.saturating_duration_since(record.sent_at) <= self.config.echo_window
        })
    }

    fn prune(&mut self, now: Instant) {
        if self.seen.len() <= DEDUP_PRUNE_THRESHOLD {
            return;
        }
        let window = self.config.dedup_window;
        self.seen
            .retain(|_, last| now.saturating_duration_since(*last) < window);
    }
}

impl Default for EchoFilter {
    fn default() -> Self {
        Self::new(EchoFilterConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AttachmentRef, MessageKind};

    fn inbound(session: &str, sender: &str, text: &str) -> CapturedEvent {
        CapturedEvent {
            session_id: session.into(),
            sender_id: sender.into(),
            sender_display_name: sender.into(),
            text: text.into(),
            direction: Direction::Inbound,
            ..Default::default()
        }
    }

    #[test]
    fn outbound_is_echo() {
        let mut filter = EchoFilter::default();
        let mut event = inbound("p2p-1", "u1", "hello");
        event.direction = Direction::Outbound;
        assert_eq!(
            filter.classify(&event, Instant::now()),
            Verdict::DropEcho(EchoReason::OutboundFlow)
        );
    }

    #[test]
    fn own_account_is_echo() {
        let mut filter = EchoFilter::default();
        filter.set_own_account(Some("me".into()));
        let event = inbound("p2p-1", "me", "anything");
        assert_eq!(
            filter.classify(&event, Instant::now()),
            Verdict::DropEcho(EchoReason::OwnAccount)
        );
    }

    #[test]
    fn empty_own_account_is_ignored() {
        let mut filter = EchoFilter::default();
        filter.set_own_account(Some(String::new()));
        assert_eq!(filter.own_account(), None);
        let event = inbound("p2p-1", "", "text from dom");
        assert!(filter.classify(&event, Instant::now()).is_accept());
    }

    #[test]
    fn sent_then_observed_is_echo() {
        let t0 = Instant::now();
        let mut filter = EchoFilter::default();
        filter.set_own_account(Some("bridge".into()));
        filter.record_sent("p2p-42", "hello", t0);

        // Remote mislabels our own send as inbound from another id.
        let event = inbound("p2p-42", "someone", "  hello ");
        assert_eq!(
            filter.classify(&event, t0 + Duration::from_secs(2)),
            Verdict::DropEcho(EchoReason::RecentSend)
        );
    }

    #[test]
    fn sent_echo_expires_after_window() {
        let t0 = Instant::now();
        let mut filter = EchoFilter::default();
        filter.record_sent("p2p-42", "hello", t0);
        let event = inbound("p2p-42", "peer", "hello");
        assert!(filter.classify(&event, t0 + Duration::from_secs(6)).is_accept());
    }

    #[test]
    fn sent_echo_is_scoped_to_session() {
        let t0 = Instant::now();
        let mut filter = EchoFilter::default();
        filter.record_sent("p2p-42", "ok", t0);
        let event = inbound("p2p-43", "peer", "ok");
        assert!(filter.classify(&event, t0).is_accept());
    }

    #[test]
    fn sent_ring_is_bounded() {
        let t0 = Instant::now();
        let mut filter = EchoFilter::default();
        for i in 0..(SENT_RING_CAPACITY + 10) {
            filter.record_sent("p2p-1", &format!("msg {i}"), t0);
        }
        assert_eq!(filter.sent_len(), SENT_RING_CAPACITY);
        // Oldest entries fell out of the ring.
        let evicted = inbound("p2p-1", "peer", "msg 0");
        assert!(filter.classify(&evicted, t0).is_accept());
        let kept = inbound("p2p-1", "peer", "msg 59");
        assert_eq!(
            filter.classify(&kept, t0),
            Verdict::DropEcho(EchoReason::RecentSend)
        );
    }

    #[test]
    fn duplicate_within_window_dropped() {
        let t0 = Instant::now();
        let mut filter = EchoFilter::default();
        let event = inbound("team-1", "peer", "same text");
        assert!(filter.classify(&event, t0).is_accept());
        assert_eq!(
            filter.classify(&event, t0 + Duration::from_secs(1)),
            Verdict::DropDuplicate
        );
    }

    #[test]
    fn duplicate_key_normalizes_whitespace() {
        let t0 = Instant::now();
        let mut filter = EchoFilter::default();
        assert!(filter.classify(&inbound("p2p-1", "a", "good  morning"), t0).is_accept());
        assert_eq!(
            filter.classify(&inbound("p2p-1", "a", " good morning\n"), t0),
            Verdict::DropDuplicate
        );
    }

    #[test]
    fn same_text_different_sessions_both_accepted() {
        let t0 = Instant::now();
        let mut filter = EchoFilter::default();
        assert!(filter.classify(&inbound("p2p-1", "a", "ok"), t0).is_accept());
        assert!(
            filter
                .classify(&inbound("p2p-2", "b", "ok"), t0 + Duration::from_millis(500))
                .is_accept()
        );
    }

    #[test]
    fn different_attachments_same_placeholder_not_collapsed() {
        let t0 = Instant::now();
        let mut filter = EchoFilter::default();
        let image = |url: &str| CapturedEvent {
            kind: MessageKind::Image,
            attachment: Some(AttachmentRef {
                url: url.into(),
                ..Default::default()
            }),
            ..inbound("p2p-1", "a", "")
        };
        assert!(filter.classify(&image("https://nos/1.png"), t0).is_accept());
        assert!(filter.classify(&image("https://nos/2.png"), t0).is_accept());
        assert_eq!(
            filter.classify(&image("https://nos/1.png"), t0),
            Verdict::DropDuplicate
        );
    }

    #[test]
    fn prune_keeps_map_bounded() {
        let t0 = Instant::now();
        let mut filter = EchoFilter::default();
        for i in 0..DEDUP_PRUNE_THRESHOLD {
            filter.classify(&inbound("p2p-1", "a", &format!("m{i}")), t0);
        }
        assert_eq!(filter.dedup_len(), DEDUP_PRUNE_THRESHOLD);
        let later = t0 + Duration::from_secs(10);
        filter.classify(&inbound("p2p-1", "a", "fresh"), later);
        assert_eq!(filter.dedup_len(), 1);
    }

    #[test]
    fn normalize_caps_length() {
        let long = "x".repeat(500);
        assert_eq!(normalize_text(&long).chars().count(), NORMALIZED_TEXT_MAX_CHARS);
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn arb_session() -> impl Strategy<Value = String> {
        prop_oneof![
            "[0-9]{1,4}".prop_map(|id| format!("p2p-{id}")),
            "[0-9]{1,4}".prop_map(|id| format!("team-{id}")),
        ]
    }

    fn arb_direction() -> impl Strategy<Value = Direction> {
        prop_oneof![
            Just(Direction::Inbound),
            Just(Direction::Outbound),
            Just(Direction::Unknown),
        ]
    }

    fn event(session: String, text: String, direction: Direction) -> CapturedEvent {
        CapturedEvent {
            session_id: session,
            sender_id: "peer".into(),
            text,
            direction,
            ..Default::default()
        }
    }

    proptest! {
        /// Outbound-labelled events are never accepted.
        #[test]
        fn outbound_never_accepted(
            session in arb_session(),
            text in ".{0,40}",
            history in proptest::collection::vec((arb_session(), ".{0,10}", arb_direction()), 0..10),
        ) {
            let t0 = Instant::now();
            let mut filter = EchoFilter::default();
            for (s, t, d) in history {
                filter.classify(&event(s, t, d), t0);
            }
            let verdict = filter.classify(&event(session, text, Direction::Outbound), t0);
            prop_assert_eq!(verdict, Verdict::DropEcho(EchoReason::OutboundFlow));
        }

        /// Identical key inside the window: exactly one of the pair is accepted.
        #[test]
        fn exactly_one_accepted_within_window(
            session in arb_session(),
            text in "[a-z ]{1,30}",
            gap_ms in 0u64..5000,
        ) {
            let t0 = Instant::now();
            let mut filter = EchoFilter::default();
            let first = filter.classify(&event(session.clone(), text.clone(), Direction::Inbound), t0);
            let second = filter.classify(
                &event(session, text, Direction::Inbound),
                t0 + Duration::from_millis(gap_ms),
            );
            let accepted = [first, second].iter().filter(|v| v.is_accept()).count();
            prop_assert_eq!(accepted, 1);
        }

        /// Identical key further apart than the window: both eligible.
        #[test]
        fn both_accepted_outside_window(
            session in arb_session(),
            text in "[a-z]{1,30}",
            gap_ms in 5001u64..60_000,
        ) {
            let t0 = Instant::now();
            let mut filter = EchoFilter::default();
            let first = filter.classify(&event(session.clone(), text.clone(), Direction::Inbound), t0);
            let second = filter.classify(
                &event(session, text, Direction::Inbound),
                t0 + Duration::from_millis(gap_ms),
            );
            prop_assert!(first.is_accept());
            prop_assert!(second.is_accept());
        }
    }
}
