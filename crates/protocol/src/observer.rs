//! Server → Observer events

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::*;

/// Events published by the session registry, in the order its state changed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ObserverEvent {
    // Lifecycle
    SessionStarted {
        session: SessionItem,
    },
    SessionUpdated {
        session: SessionItem,
    },
    SessionClosed {
        session_id: ConnectionId,
    },
    SessionDismissed {
        session_id: ConnectionId,
    },
    SelectionChanged {
        session_id: Option<ConnectionId>,
    },

    // Content
    MessageAppended {
        session_id: ConnectionId,
        message: SessionMessage,
    },

    /// Legacy one-shot notification received over HTTP POST
    Notification {
        payload: Value,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_are_tagged_snake_case() {
        let json = serde_json::to_value(ObserverEvent::SessionClosed {
            session_id: ConnectionId(3),
        })
        .unwrap();
        assert_eq!(json["type"], "session_closed");
        assert_eq!(json["session_id"], 3);
    }
}
