//! Session registry: known conversation identities and the focused one.
//!
//! Records are created on first sight and updated in place; nothing is
//! deleted during a run. Keys are full chat ids, so `p2p-7` and `team-7`
//! never collide.

use std::collections::HashMap;

use crate::protocol::SessionList;
use crate::types::SessionRecord;

/// Focus after a bulk refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FocusState {
    Focused(String),
    /// Remote reported no focused session.
    Unknown,
    /// Remote named a focused session that its own list omits. Treated as
    /// unknown focus; the id is kept for logging.
    Unlisted(String),
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    records: HashMap<String, SessionRecord>,
    focused: Option<String>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a session, creating it on first sight. A non-empty
    /// `hint_label` replaces the stored peer label.
    pub fn resolve(&mut self, session_id: &str, hint_label: &str, is_group: bool) -> &SessionRecord {
        let focused = self.focused.as_deref() == Some(session_id);
        let record = self
            .records
            .entry(session_id.to_string())
            .or_insert_with(|| SessionRecord::new(session_id));
        if !hint_label.is_empty() {
            record.last_known_peer_label = hint_label.to_string();
        }
        record.is_group = is_group;
        record.is_currently_focused = focused;
        record
    }

    /// Bulk refresh from the remote session list.
    pub fn update_from_remote_list(&mut self, list: &SessionList) -> FocusState {
        for summary in list.sessions.iter().filter(|s| !s.id.is_empty()) {
            let record = self
                .records
                .entry(summary.id.clone())
                .or_insert_with(|| SessionRecord::new(&summary.id));
            if !summary.name.is_empty() {
                record.last_known_peer_label = summary.name.clone();
            }
        }

        let reported = list.curr_session.trim();
        let state = if reported.is_empty() {
            FocusState::Unknown
        } else if list.sessions.iter().any(|s| s.id == reported) {
            FocusState::Focused(reported.to_string())
        } else {
            FocusState::Unlisted(reported.to_string())
        };

        self.focused = match &state {
            FocusState::Focused(id) => Some(id.clone()),
            FocusState::Unknown | FocusState::Unlisted(_) => None,
        };
        for record in self.records.values_mut() {
            record.is_currently_focused = self.focused.as_deref() == Some(&record.session_id);
        }
        state
    }

    pub fn current_focused(&self) -> Option<&str> {
        self.focused.as_deref()
    }

    pub fn get(&self, session_id: &str) -> Option<&SessionRecord> {
        self.records.get(session_id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// All records, ordered by session id.
    pub fn records(&self) -> Vec<&SessionRecord> {
        let mut out: Vec<&SessionRecord> = self.records.values().collect();
        out.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        out
    }
}
