use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::path::PathBuf;

// ─── Session identity ─────────────────────────────────────────────

/// Session id reported by the DOM-level observer, which cannot see the
/// conversation id and only knows "whatever is on screen".
pub const FOCUSED_PLACEHOLDER: &str = "current";

/// Namespace of a chat id. `p2p-42` and `team-42` are different sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionScope {
    P2p,
    Team,
}

impl SessionScope {
    pub fn of(chat_id: &str) -> Option<Self> {
        if chat_id.starts_with("p2p-") {
            Some(Self::P2p)
        } else if chat_id.starts_with("team-") {
            Some(Self::Team)
        } else {
            None
        }
    }

    pub fn prefix(self) -> &'static str {
        match self {
            Self::P2p => "p2p-",
            Self::Team => "team-",
        }
    }

    /// Remote-side scene name used by the host messaging handle.
    pub fn scene(self) -> &'static str {
        match self {
            Self::P2p => "p2p",
            Self::Team => "team",
        }
    }
}

/// Strip the namespace prefix: `p2p-42` -> `42`. Unprefixed ids are returned as-is.
pub fn peer_part(chat_id: &str) -> &str {
    match SessionScope::of(chat_id) {
        Some(scope) => &chat_id[scope.prefix().len()..],
        None => chat_id,
    }
}

pub fn is_group_chat(chat_id: &str) -> bool {
    SessionScope::of(chat_id) == Some(SessionScope::Team)
}

// ─── Message kind & direction ─────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    File,
    Other,
}

impl MessageKind {
    /// Map the host's message type string. Audio/video are delivered as files.
    pub fn from_remote(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "" | "text" => Self::Text,
            "image" | "picture" | "img" => Self::Image,
            "file" | "audio" | "video" => Self::File,
            _ => Self::Other,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::File => "file",
            Self::Other => "other",
        }
    }

    /// Name used in the consumer protocol, which only knows text/image/file.
    pub fn wire_name(self) -> &'static str {
        match self {
            Self::Text | Self::Other => "text",
            Self::Image => "image",
            Self::File => "file",
        }
    }

    /// Content used when an attachment arrives without any text.
    pub fn placeholder(self) -> &'static str {
        match self {
            Self::Image => "[image]",
            Self::File => "[file]",
            Self::Text | Self::Other => "[attachment]",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for MessageKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for MessageKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(Self::from_remote(raw.as_deref().unwrap_or("")))
    }
}

/// Message direction as reported by the remote side. Not fully trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Direction {
    Inbound,
    Outbound,
    #[default]
    Unknown,
}

impl Direction {
    pub fn from_flow(flow: &str) -> Self {
        match flow {
            "in" => Self::Inbound,
            "out" => Self::Outbound,
            _ => Self::Unknown,
        }
    }

    pub fn as_flow(self) -> &'static str {
        match self {
            Self::Inbound => "in",
            Self::Outbound => "out",
            Self::Unknown => "",
        }
    }
}

impl Serialize for Direction {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_flow())
    }
}

impl<'de> Deserialize<'de> for Direction {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(Self::from_flow(raw.as_deref().unwrap_or("")))
    }
}

/// Which injected capture mechanism produced a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureOrigin {
    /// Subscription on the host's internal state store.
    #[default]
    Store,
    /// Structural observer on the rendered conversation area.
    Dom,
}

// ─── Captured event ───────────────────────────────────────────────

/// Remote locator of a binary attachment.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AttachmentRef {
    pub url: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub ext: String,
    #[serde(default)]
    pub size: Option<u64>,
}

impl AttachmentRef {
    /// File extension without the dot: explicit `ext`, else the suffix of `name`.
    pub fn extension(&self) -> Option<&str> {
        let ext = self.ext.trim_start_matches('.');
        if !ext.is_empty() {
            return Some(ext);
        }
        self.name
            .rsplit_once('.')
            .map(|(_, suffix)| suffix)
            .filter(|s| !s.is_empty())
    }
}

/// Raw record drained from the injected capture buffer.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapturedEvent {
    #[serde(default)]
    pub session_id: String,
    #[serde(default, rename = "from")]
    pub sender_id: String,
    #[serde(default, rename = "fromNick")]
    pub sender_display_name: String,
    #[serde(default)]
    pub text: String,
    #[serde(default, rename = "msgType")]
    pub kind: MessageKind,
    #[serde(default)]
    pub attachment: Option<AttachmentRef>,
    #[serde(default, rename = "flow")]
    pub direction: Direction,
    /// Remote timestamp, ms since epoch.
    #[serde(default, rename = "time")]
    pub timestamp: i64,
    #[serde(default)]
    pub id_client: String,
    #[serde(default, rename = "source")]
    pub origin: CaptureOrigin,
}

impl CapturedEvent {
    pub fn is_group(&self) -> bool {
        is_group_chat(&self.session_id)
    }

    pub fn has_attachment(&self) -> bool {
        self.attachment.as_ref().is_some_and(|a| !a.url.is_empty())
    }

    /// Neither text nor attachment: nothing to relay.
    pub fn is_blank(&self) -> bool {
        self.text.trim().is_empty() && !self.has_attachment()
    }

    pub fn is_unattributed(&self) -> bool {
        self.session_id.is_empty() || self.session_id == FOCUSED_PLACEHOLDER
    }

    /// Display name with fallbacks: nick, then account id, then "unknown".
    pub fn sender_label(&self) -> &str {
        if !self.sender_display_name.is_empty() {
            &self.sender_display_name
        } else if !self.sender_id.is_empty() {
            &self.sender_id
        } else {
            "unknown"
        }
    }
}

// ─── Relay event ──────────────────────────────────────────────────

/// Clean, outward-facing event. Built once by the poller and never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayEvent {
    pub session_id: String,
    pub sender_id: String,
    pub sender_display_name: String,
    pub text: String,
    pub kind: MessageKind,
    pub is_group: bool,
    pub local_attachment_paths: Vec<PathBuf>,
    pub timestamp: i64,
    pub id_client: String,
}

// ─── Session record ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub last_known_peer_label: String,
    pub is_group: bool,
    pub is_currently_focused: bool,
}

impl SessionRecord {
    pub fn new(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            last_known_peer_label: String::new(),
            is_group: is_group_chat(session_id),
            is_currently_focused: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_from_prefix() {
        assert_eq!(SessionScope::of("p2p-42"), Some(SessionScope::P2p));
        assert_eq!(SessionScope::of("team-42"), Some(SessionScope::Team));
        assert_eq!(SessionScope::of("current"), None);
        assert_eq!(peer_part("team-9001"), "9001");
        assert_eq!(peer_part("p2p-alice"), "alice");
        assert_eq!(peer_part("alice"), "alice");
    }

    #[test]
    fn group_detection_uses_prefix_only() {
        assert!(is_group_chat("team-1"));
        assert!(!is_group_chat("p2p-team-lead"));
    }

    #[test]
    fn kind_mapping() {
        assert_eq!(MessageKind::from_remote("TEXT"), MessageKind::Text);
        assert_eq!(MessageKind::from_remote("image"), MessageKind::Image);
        assert_eq!(MessageKind::from_remote("audio"), MessageKind::File);
        assert_eq!(MessageKind::from_remote("tip"), MessageKind::Other);
        assert_eq!(MessageKind::Other.wire_name(), "text");
    }

    #[test]
    fn captured_event_from_store_record() {
        let raw = r#"{
            "sessionId": "team-7", "from": "u1", "fromNick": "Alice",
            "text": "", "msgType": "image", "flow": "in", "time": 1700000000000,
            "idClient": "abc", "source": "store",
            "attachment": {"url": "https://nos/x.png", "name": "x.png", "size": 10}
        }"#;
        let event: CapturedEvent = serde_json::from_str(raw).expect("parse");
        assert_eq!(event.session_id, "team-7");
        assert_eq!(event.kind, MessageKind::Image);
        assert_eq!(event.direction, Direction::Inbound);
        assert!(event.is_group());
        assert!(event.has_attachment());
        assert!(!event.is_blank());
        assert_eq!(event.attachment.as_ref().and_then(|a| a.extension()), Some("png"));
    }

    #[test]
    fn captured_event_from_dom_record_defaults() {
        let raw = r#"{"sessionId": "current", "fromNick": "Bob", "text": "hi", "source": "dom", "flow": null}"#;
        let event: CapturedEvent = serde_json::from_str(raw).expect("parse");
        assert_eq!(event.origin, CaptureOrigin::Dom);
        assert_eq!(event.direction, Direction::Unknown);
        assert_eq!(event.kind, MessageKind::Text);
        assert!(event.is_unattributed());
        assert_eq!(event.sender_label(), "Bob");
    }

    #[test]
    fn blank_event_detection() {
        let event = CapturedEvent {
            text: "   ".into(),
            ..Default::default()
        };
        assert!(event.is_blank());
        assert_eq!(event.sender_label(), "unknown");
    }

    #[test]
    fn explicit_ext_wins_over_name() {
        let att = AttachmentRef {
            url: "u".into(),
            name: "report.docx".into(),
            ext: ".pdf".into(),
            size: None,
        };
        assert_eq!(att.extension(), Some("pdf"));
    }
}
