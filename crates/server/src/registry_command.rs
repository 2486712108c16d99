//! Commands sent to the registry actor from connections and HTTP handlers.

use agentscope_protocol::{ConnectionId, SessionMessage};
use serde_json::Value;
use tokio::sync::oneshot;

use crate::registry::DismissOutcome;

/// A command that can be sent to the registry actor.
pub enum RegistryCommand {
    // -- Connection events (fire-and-forget, per-connection order preserved) --
    /// A complete text message decoded off a connection
    Message { id: ConnectionId, text: String },

    /// The connection finished its close sequence
    Disconnected { id: ConnectionId },

    /// Legacy HTTP POST notification, forwarded opaquely
    Notification { payload: Value },

    // -- Observer actions (use oneshot reply channels) --
    Dismiss {
        id: ConnectionId,
        reply: oneshot::Sender<DismissOutcome>,
    },

    /// Replies `false` when the id is unknown.
    Select {
        id: Option<ConnectionId>,
        reply: oneshot::Sender<bool>,
    },

    GetMessages {
        id: ConnectionId,
        reply: oneshot::Sender<Option<Vec<SessionMessage>>>,
    },
}
