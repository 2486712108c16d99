//! Core types shared across the protocol

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identity of one accepted socket. Doubles as the session id: one
/// connection carries exactly one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A session as observers see it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionItem {
    pub id: ConnectionId,
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_path: Option<String>,
    pub connected_at: String,
    pub is_active: bool,
    /// True until a `session_info` envelope has described this session.
    #[serde(default)]
    pub is_placeholder: bool,
    pub message_count: usize,
}

/// One message appended to a session, in arrival order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMessage {
    pub id: String,
    pub session_id: ConnectionId,
    /// Sequence number as reported by the sender (only `output` carries one).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    pub category: String,
    /// The full JSON text of the envelope, untouched.
    pub raw: String,
    pub timestamp: String,
}

/// The session list plus the observer's current selection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionList {
    pub sessions: Vec<SessionItem>,
    pub selected: Option<ConnectionId>,
}
