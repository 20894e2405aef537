//! Consumer socket protocol: one JSON object per text frame.
//!
//! ```json
//! {"type":"message","sender":"Alice","chat_id":"p2p-42","content":"hi","msg_type":"text","is_group":false,"media":[]}
//! {"type":"status","status":"ready"}
//! {"type":"send","chat_id":"p2p-42","text":"hello"}
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{RelayEvent, peer_part};

// ─── Session list payload ────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub last_msg: String,
    #[serde(default)]
    pub unread: u32,
}

/// Session list as read from the host store; also the `data` of a
/// `sessions` reply.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionList {
    #[serde(default)]
    pub ok: bool,
    #[serde(default)]
    pub curr_session: String,
    #[serde(default)]
    pub sessions: Vec<SessionSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SessionList {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

// ─── Consumer → bridge ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConsumerCommand {
    Send {
        #[serde(default)]
        chat_id: String,
        #[serde(default)]
        text: String,
    },
    Sessions,
    Ping,
    Rehook,
    MyId,
    CurrentSession,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Invalid message: {0}")]
    InvalidJson(String),

    #[error("unknown command type: {0}")]
    UnknownType(String),

    #[error("missing command type")]
    MissingType,
}

/// Parse one inbound frame.
pub fn parse_command(raw: &str) -> Result<ConsumerCommand, ProtocolError> {
    let value: serde_json::Value =
        serde_json::from_str(raw).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;
    let kind = value
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or(ProtocolError::MissingType)?
        .to_string();
    serde_json::from_value(value).map_err(|e| {
        if e.to_string().contains("unknown variant") {
            ProtocolError::UnknownType(kind)
        } else {
            ProtocolError::InvalidJson(e.to_string())
        }
    })
}

// ─── Bridge → consumer ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeStatus {
    Ready,
    CdpNotConnected,
    Sent,
    Pong,
    Hooked,
    HookFailed,
    Disconnected,
    Reconnected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeMessage {
    Message {
        sender: String,
        sender_id: String,
        chat_id: String,
        content: String,
        msg_type: String,
        is_group: bool,
        media: Vec<String>,
        timestamp: i64,
        id_client: String,
    },
    Status {
        status: BridgeStatus,
    },
    Error {
        error: String,
    },
    Sessions {
        data: SessionList,
    },
    MyId {
        account: String,
    },
    CurrentSession {
        #[serde(rename = "currSession")]
        curr_session: String,
        #[serde(rename = "otherPartyId")]
        other_party_id: String,
        #[serde(rename = "myAccount")]
        my_account: String,
        sessions: Vec<SessionSummary>,
    },
}

impl BridgeMessage {
    pub fn status(status: BridgeStatus) -> Self {
        Self::Status { status }
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self::Error {
            error: error.into(),
        }
    }

    pub fn current_session(list: SessionList, my_account: &str) -> Self {
        let other_party_id = peer_part(&list.curr_session).to_string();
        Self::CurrentSession {
            other_party_id,
            curr_session: list.curr_session,
            my_account: my_account.to_string(),
            sessions: list.sessions,
        }
    }

    /// Serialize to a single text frame.
    pub fn to_frame(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl From<&RelayEvent> for BridgeMessage {
    fn from(event: &RelayEvent) -> Self {
        Self::Message {
            sender: event.sender_display_name.clone(),
            sender_id: event.sender_id.clone(),
            chat_id: event.session_id.clone(),
            content: event.text.clone(),
            msg_type: event.kind.wire_name().to_string(),
            is_group: event.is_group,
            media: event
                .local_attachment_paths
                .iter()
                .map(|p| p.display().to_string())
                .collect(),
            timestamp: event.timestamp,
            id_client: event.id_client.clone(),
        }
    }
}
