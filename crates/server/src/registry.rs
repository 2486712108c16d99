//! Session registry state machine
//!
//! Turns per-connection protocol events into the observable session list.
//! Every mutation is a synchronous method returning the `ObserverEvent`s it
//! produced. No IO, no async, no locking: the registry actor owns the only
//! instance and serializes all access.
//!
//! Per session: `absent → active → closed → absent (dismiss)`.

use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

use agentscope_protocol::{
    new_id, AgentEnvelope, ConnectionId, ObserverEvent, SessionItem, SessionList, SessionMessage,
};
use tracing::{debug, info, warn};

/// Upper bound on remembered session-less disconnects. A connection's
/// messages always reach the registry before its disconnect, so this only
/// guards against stray input and can forget old ids.
const RETIRED_CAPACITY: usize = 1024;

/// Result of a dismiss request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DismissOutcome {
    Dismissed,
    /// Active sessions cannot be dismissed; nothing changed.
    StillActive,
    NotFound,
}

struct SessionEntry {
    item: SessionItem,
    messages: Vec<SessionMessage>,
}

#[derive(Default)]
pub struct SessionRegistry {
    /// In creation order.
    sessions: Vec<SessionEntry>,
    /// Connections that disconnected before announcing a session, oldest
    /// first. Sessions track this through `is_active` instead.
    retired: VecDeque<ConnectionId>,
    selected: Option<ConnectionId>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn position(&self, id: ConnectionId) -> Option<usize> {
        self.sessions.iter().position(|entry| entry.item.id == id)
    }

    /// Current session list with the selection.
    pub fn list(&self) -> SessionList {
        SessionList {
            sessions: self.sessions.iter().map(|e| e.item.clone()).collect(),
            selected: self.selected,
        }
    }

    pub fn messages(&self, id: ConnectionId) -> Option<Vec<SessionMessage>> {
        self.position(id).map(|i| self.sessions[i].messages.clone())
    }

    /// Handle one decoded text message from a connection.
    pub fn handle_message(&mut self, id: ConnectionId, text: &str) -> Vec<ObserverEvent> {
        let retired = match self.position(id) {
            Some(index) => !self.sessions[index].item.is_active,
            None => self.retired.contains(&id),
        };
        if retired {
            warn!(
                component = "registry",
                event = "registry.message.after_disconnect",
                connection_id = %id,
                "Dropping message for a disconnected connection"
            );
            return Vec::new();
        }

        let envelope = match AgentEnvelope::parse(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(
                    component = "registry",
                    event = "registry.message.decode_failed",
                    connection_id = %id,
                    error = %e,
                    payload_bytes = text.len(),
                    payload_preview = %truncate_for_log(text, 240),
                    "Dropping malformed envelope"
                );
                return Vec::new();
            }
        };

        match envelope {
            AgentEnvelope::SessionInfo(info) => {
                if let Some(index) = self.position(id) {
                    let item = &mut self.sessions[index].item;
                    item.command = info.command;
                    item.plan_id = info.plan_id;
                    item.plan_title = info.plan_title;
                    item.workspace_path = info.workspace_path;
                    item.is_placeholder = false;
                    debug!(
                        component = "registry",
                        event = "registry.session.updated",
                        connection_id = %id,
                        "Session metadata updated"
                    );
                    return vec![ObserverEvent::SessionUpdated {
                        session: item.clone(),
                    }];
                }
                let item = SessionItem {
                    id,
                    command: info.command,
                    plan_id: info.plan_id,
                    plan_title: info.plan_title,
                    workspace_path: info.workspace_path,
                    connected_at: now_timestamp(),
                    is_active: true,
                    is_placeholder: false,
                    message_count: 0,
                };
                self.insert(item)
            }
            other => {
                let mut events = Vec::new();
                let index = match self.position(id) {
                    Some(index) => index,
                    None => {
                        debug!(
                            component = "registry",
                            event = "registry.session.placeholder",
                            connection_id = %id,
                            kind = %other.kind(),
                            "Message before session_info, creating placeholder"
                        );
                        events.extend(self.insert(placeholder(id)));
                        self.sessions.len() - 1
                    }
                };

                let timestamp = match &other {
                    AgentEnvelope::Output {
                        timestamp: Some(ts),
                        ..
                    } => ts.clone(),
                    _ => now_timestamp(),
                };
                let message = SessionMessage {
                    id: new_id(),
                    session_id: id,
                    seq: other.seq(),
                    category: other.category(),
                    raw: text.to_string(),
                    timestamp,
                };
                let entry = &mut self.sessions[index];
                entry.messages.push(message.clone());
                entry.item.message_count = entry.messages.len();
                events.push(ObserverEvent::MessageAppended {
                    session_id: id,
                    message,
                });
                events
            }
        }
    }

    fn insert(&mut self, item: SessionItem) -> Vec<ObserverEvent> {
        let id = item.id;
        info!(
            component = "registry",
            event = "registry.session.started",
            connection_id = %id,
            command = %item.command,
            placeholder = item.is_placeholder,
            "Session started"
        );
        self.sessions.push(SessionEntry {
            item: item.clone(),
            messages: Vec::new(),
        });
        let mut events = vec![ObserverEvent::SessionStarted { session: item }];
        if self.selected.is_none() {
            self.selected = Some(id);
            events.push(ObserverEvent::SelectionChanged {
                session_id: Some(id),
            });
        }
        events
    }

    /// The connection is gone: its session becomes inactive for good.
    pub fn handle_disconnect(&mut self, id: ConnectionId) -> Vec<ObserverEvent> {
        let Some(index) = self.position(id) else {
            if !self.retired.contains(&id) {
                if self.retired.len() == RETIRED_CAPACITY {
                    self.retired.pop_front();
                }
                self.retired.push_back(id);
            }
            debug!(
                component = "registry",
                event = "registry.disconnect.no_session",
                connection_id = %id,
                "Connection closed before announcing a session"
            );
            return Vec::new();
        };
        let item = &mut self.sessions[index].item;
        if !item.is_active {
            return Vec::new();
        }
        item.is_active = false;
        info!(
            component = "registry",
            event = "registry.session.closed",
            connection_id = %id,
            messages = item.message_count,
            "Session closed"
        );
        vec![ObserverEvent::SessionClosed { session_id: id }]
    }

    /// Remove a closed session. Active sessions are left untouched.
    pub fn dismiss(&mut self, id: ConnectionId) -> (DismissOutcome, Vec<ObserverEvent>) {
        let Some(index) = self.position(id) else {
            return (DismissOutcome::NotFound, Vec::new());
        };
        if self.sessions[index].item.is_active {
            debug!(
                component = "registry",
                event = "registry.dismiss.active",
                connection_id = %id,
                "Refusing to dismiss an active session"
            );
            return (DismissOutcome::StillActive, Vec::new());
        }

        self.sessions.remove(index);
        let mut events = vec![ObserverEvent::SessionDismissed { session_id: id }];
        if self.selected == Some(id) {
            self.selected = None;
            events.push(ObserverEvent::SelectionChanged { session_id: None });
        }
        (DismissOutcome::Dismissed, events)
    }

    /// Select a session (or clear the selection). Returns `None` when the
    /// id is unknown.
    pub fn select(&mut self, id: Option<ConnectionId>) -> Option<Vec<ObserverEvent>> {
        if let Some(id) = id {
            self.position(id)?;
        }
        if self.selected == id {
            return Some(Vec::new());
        }
        self.selected = id;
        Some(vec![ObserverEvent::SelectionChanged { session_id: id }])
    }
}

fn placeholder(id: ConnectionId) -> SessionItem {
    SessionItem {
        id,
        command: String::new(),
        plan_id: None,
        plan_title: None,
        workspace_path: None,
        connected_at: now_timestamp(),
        is_active: true,
        is_placeholder: true,
        message_count: 0,
    }
}

fn truncate_for_log(value: &str, max_chars: usize) -> String {
    value.chars().take(max_chars).collect()
}

/// Current time as `<unix seconds>Z`
pub(crate) fn now_timestamp() -> String {
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    format!("{}Z", duration.as_secs())
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: ConnectionId = ConnectionId(1);
    const B: ConnectionId = ConnectionId(2);

    fn session_info(command: &str) -> String {
        format!(r#"{{"type":"session_info","command":"{command}","planTitle":"Plan"}}"#)
    }

    fn output(seq: u64) -> String {
        format!(r#"{{"type":"output","seq":{seq},"message":{{"type":"log","text":"line {seq}"}}}}"#)
    }

    #[test]
    fn session_info_starts_an_active_selected_session() {
        let mut registry = SessionRegistry::new();
        let events = registry.handle_message(A, &session_info("agent"));

        assert!(matches!(&events[0], ObserverEvent::SessionStarted { session } if session.command == "agent"));
        assert_eq!(
            events[1],
            ObserverEvent::SelectionChanged {
                session_id: Some(A)
            }
        );
        let list = registry.list();
        assert_eq!(list.sessions.len(), 1);
        assert!(list.sessions[0].is_active);
        assert_eq!(list.sessions[0].plan_title.as_deref(), Some("Plan"));
        assert_eq!(list.selected, Some(A));
    }

    #[test]
    fn second_session_does_not_steal_selection() {
        let mut registry = SessionRegistry::new();
        registry.handle_message(A, &session_info("first"));
        let events = registry.handle_message(B, &session_info("second"));
        assert_eq!(events.len(), 1);
        assert_eq!(registry.list().selected, Some(A));
    }

    #[test]
    fn messages_append_in_arrival_order() {
        let mut registry = SessionRegistry::new();
        registry.handle_message(A, &session_info("agent"));
        registry.handle_message(A, &output(1));
        registry.handle_message(A, r#"{"type":"replay_start"}"#);
        registry.handle_message(A, &output(2));

        let messages = registry.messages(A).unwrap();
        let seqs: Vec<Option<u64>> = messages.iter().map(|m| m.seq).collect();
        assert_eq!(seqs, vec![Some(1), None, Some(2)]);
        assert_eq!(messages[0].category, "log");
        assert_eq!(messages[1].category, "replay_start");
        assert_eq!(messages[0].raw, output(1));
        assert_eq!(registry.list().sessions[0].message_count, 3);
    }

    #[test]
    fn message_before_session_info_creates_one_placeholder() {
        let mut registry = SessionRegistry::new();
        let events = registry.handle_message(A, &output(1));
        assert!(matches!(&events[0], ObserverEvent::SessionStarted { session } if session.is_placeholder));
        assert!(matches!(
            events.last(),
            Some(ObserverEvent::MessageAppended { .. })
        ));

        let events = registry.handle_message(A, &session_info("late"));
        assert!(matches!(&events[0], ObserverEvent::SessionUpdated { session } if session.command == "late"));

        let list = registry.list();
        assert_eq!(list.sessions.len(), 1);
        assert!(!list.sessions[0].is_placeholder);
        assert_eq!(registry.messages(A).unwrap().len(), 1);
    }

    #[test]
    fn malformed_json_is_dropped_without_touching_other_sessions() {
        let mut registry = SessionRegistry::new();
        registry.handle_message(A, &session_info("a"));
        registry.handle_message(B, &session_info("b"));

        assert!(registry.handle_message(A, "{not json").is_empty());
        assert!(registry.handle_message(A, r#"{"seq":1}"#).is_empty());
        registry.handle_message(B, &output(1));

        assert_eq!(registry.messages(A).unwrap().len(), 0);
        assert_eq!(registry.messages(B).unwrap().len(), 1);
    }

    #[test]
    fn disconnect_closes_session_once_and_keeps_messages() {
        let mut registry = SessionRegistry::new();
        registry.handle_message(A, &session_info("agent"));
        registry.handle_message(A, &output(1));

        assert_eq!(
            registry.handle_disconnect(A),
            vec![ObserverEvent::SessionClosed { session_id: A }]
        );
        assert!(registry.handle_disconnect(A).is_empty());
        assert!(!registry.list().sessions[0].is_active);
        assert_eq!(registry.messages(A).unwrap().len(), 1);
    }

    #[test]
    fn closed_sessions_never_become_active_again() {
        let mut registry = SessionRegistry::new();
        registry.handle_message(A, &session_info("agent"));
        registry.handle_disconnect(A);

        assert!(registry.handle_message(A, &session_info("again")).is_empty());
        assert!(registry.handle_message(A, &output(9)).is_empty());
        let list = registry.list();
        assert!(!list.sessions[0].is_active);
        assert_eq!(list.sessions[0].command, "agent");
    }

    #[test]
    fn dismissing_an_active_session_is_a_no_op() {
        let mut registry = SessionRegistry::new();
        registry.handle_message(A, &session_info("agent"));

        let (outcome, events) = registry.dismiss(A);
        assert_eq!(outcome, DismissOutcome::StillActive);
        assert!(events.is_empty());
        assert_eq!(registry.list().sessions.len(), 1);
        assert!(registry.list().sessions[0].is_active);
    }

    #[test]
    fn dismissing_a_closed_session_removes_it_and_clears_selection() {
        let mut registry = SessionRegistry::new();
        registry.handle_message(A, &session_info("agent"));
        registry.handle_disconnect(A);

        let (outcome, events) = registry.dismiss(A);
        assert_eq!(outcome, DismissOutcome::Dismissed);
        assert_eq!(
            events,
            vec![
                ObserverEvent::SessionDismissed { session_id: A },
                ObserverEvent::SelectionChanged { session_id: None },
            ]
        );
        assert!(registry.list().sessions.is_empty());
        assert_eq!(registry.dismiss(A).0, DismissOutcome::NotFound);
        assert!(registry.messages(A).is_none());
    }

    #[test]
    fn dismiss_matches_the_exact_connection_only() {
        let mut registry = SessionRegistry::new();
        registry.handle_message(A, &session_info("a"));
        registry.handle_message(B, &session_info("b"));
        registry.handle_disconnect(B);

        assert_eq!(registry.dismiss(ConnectionId(12)).0, DismissOutcome::NotFound);
        assert_eq!(registry.dismiss(B).0, DismissOutcome::Dismissed);
        let list = registry.list();
        assert_eq!(list.sessions.len(), 1);
        assert_eq!(list.sessions[0].id, A);
    }

    #[test]
    fn disconnect_without_session_leaves_no_trace() {
        let mut registry = SessionRegistry::new();
        assert!(registry.handle_disconnect(A).is_empty());
        assert!(registry.list().sessions.is_empty());
        assert!(registry.handle_message(A, &output(1)).is_empty());
    }

    #[test]
    fn retired_ids_do_not_accumulate() {
        let mut registry = SessionRegistry::new();
        registry.handle_message(A, &session_info("agent"));
        registry.handle_disconnect(A);
        registry.dismiss(A);
        assert!(registry.retired.is_empty());

        for n in 0..(RETIRED_CAPACITY as u64 + 10) {
            registry.handle_disconnect(ConnectionId(1000 + n));
        }
        assert_eq!(registry.retired.len(), RETIRED_CAPACITY);
        assert_eq!(registry.retired.front(), Some(&ConnectionId(1010)));
    }

    #[test]
    fn select_requires_a_known_session() {
        let mut registry = SessionRegistry::new();
        registry.handle_message(A, &session_info("a"));
        registry.handle_message(B, &session_info("b"));

        assert!(registry.select(Some(ConnectionId(99))).is_none());
        assert_eq!(
            registry.select(Some(B)).unwrap(),
            vec![ObserverEvent::SelectionChanged {
                session_id: Some(B)
            }]
        );
        assert!(registry.select(Some(B)).unwrap().is_empty());
        assert_eq!(registry.list().selected, Some(B));
    }
}
