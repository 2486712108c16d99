//! agentscope Protocol
//!
//! Shared types for communication between agent processes, the agentscope
//! server, and observers. These types are serialized as JSON over WebSocket
//! text frames and the plain HTTP endpoints.

use uuid::Uuid;

pub mod envelope;
pub mod observer;
pub mod types;

pub use envelope::{AgentEnvelope, EnvelopeError};
pub use observer::ObserverEvent;
pub use types::*;

/// Generate a new unique ID
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}
