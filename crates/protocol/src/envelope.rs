//! Agent → Server envelopes
//!
//! Every text frame an agent sends carries one JSON object with a `type`
//! discriminator. Decoding peeks the tag first and only then decodes the
//! matching variant, so tags this build does not know about still decode
//! (as `Unknown`) instead of failing the whole message.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Errors produced while decoding an envelope
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("envelope is not a JSON object")]
    NotAnObject,

    #[error("envelope has no string `type` field")]
    MissingType,

    #[error("invalid `{kind}` envelope: {source}")]
    InvalidFields {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Metadata announced by an agent when its run starts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub command: String,
    #[serde(default)]
    pub plan_id: Option<String>,
    #[serde(default)]
    pub plan_title: Option<String>,
    #[serde(default)]
    pub workspace_path: Option<String>,
}

#[derive(Deserialize)]
struct OutputFields {
    seq: u64,
    #[serde(default)]
    message: Value,
    #[serde(default)]
    timestamp: Option<String>,
}

/// A decoded agent envelope
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEnvelope {
    SessionInfo(SessionInfo),
    Output {
        seq: u64,
        /// Nested structured payload; interpreted by observers, not here.
        message: Value,
        timestamp: Option<String>,
    },
    ReplayStart,
    ReplayEnd,
    Unknown {
        kind: String,
    },
}

impl AgentEnvelope {
    /// Decode one text frame.
    pub fn parse(text: &str) -> Result<Self, EnvelopeError> {
        let value: Value = serde_json::from_str(text)?;
        let Value::Object(ref fields) = value else {
            return Err(EnvelopeError::NotAnObject);
        };
        let kind = fields
            .get("type")
            .and_then(Value::as_str)
            .ok_or(EnvelopeError::MissingType)?
            .to_string();

        let invalid = |source| EnvelopeError::InvalidFields {
            kind: kind.clone(),
            source,
        };

        let envelope = match kind.as_str() {
            "session_info" => {
                AgentEnvelope::SessionInfo(serde_json::from_value(value).map_err(invalid)?)
            }
            "output" => {
                let fields: OutputFields = serde_json::from_value(value).map_err(invalid)?;
                AgentEnvelope::Output {
                    seq: fields.seq,
                    message: fields.message,
                    timestamp: fields.timestamp,
                }
            }
            "replay_start" => AgentEnvelope::ReplayStart,
            "replay_end" => AgentEnvelope::ReplayEnd,
            _ => AgentEnvelope::Unknown { kind: kind.clone() },
        };
        Ok(envelope)
    }

    /// The wire tag of this envelope
    pub fn kind(&self) -> &str {
        match self {
            AgentEnvelope::SessionInfo(_) => "session_info",
            AgentEnvelope::Output { .. } => "output",
            AgentEnvelope::ReplayStart => "replay_start",
            AgentEnvelope::ReplayEnd => "replay_end",
            AgentEnvelope::Unknown { kind } => kind,
        }
    }

    /// Category used by observers to pick a formatter. `output` envelopes
    /// report the tag of their nested message when it has one.
    pub fn category(&self) -> String {
        match self {
            AgentEnvelope::Output { message, .. } => message
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or("output")
                .to_string(),
            other => other.kind().to_string(),
        }
    }

    pub fn seq(&self) -> Option<u64> {
        match self {
            AgentEnvelope::Output { seq, .. } => Some(*seq),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_session_info_with_optional_fields() {
        let env = AgentEnvelope::parse(
            r#"{"type":"session_info","command":"agent","planId":"p-1","workspacePath":"/w"}"#,
        )
        .unwrap();
        assert_eq!(
            env,
            AgentEnvelope::SessionInfo(SessionInfo {
                command: "agent".into(),
                plan_id: Some("p-1".into()),
                plan_title: None,
                workspace_path: Some("/w".into()),
            })
        );
    }

    #[test]
    fn output_category_comes_from_nested_message() {
        let env = AgentEnvelope::parse(
            r#"{"type":"output","seq":7,"message":{"type":"llm_response","text":"hi"}}"#,
        )
        .unwrap();
        assert_eq!(env.seq(), Some(7));
        assert_eq!(env.category(), "llm_response");

        let bare = AgentEnvelope::parse(r#"{"type":"output","seq":8}"#).unwrap();
        assert_eq!(bare.category(), "output");
    }

    #[test]
    fn unknown_tags_decode_to_catch_all() {
        let env = AgentEnvelope::parse(r#"{"type":"brand_new","x":1}"#).unwrap();
        assert_eq!(
            env,
            AgentEnvelope::Unknown {
                kind: "brand_new".into()
            }
        );
        assert_eq!(env.category(), "brand_new");
    }

    #[test]
    fn replay_markers_decode() {
        assert_eq!(
            AgentEnvelope::parse(r#"{"type":"replay_start"}"#).unwrap(),
            AgentEnvelope::ReplayStart
        );
        assert_eq!(
            AgentEnvelope::parse(r#"{"type":"replay_end"}"#).unwrap(),
            AgentEnvelope::ReplayEnd
        );
    }

    #[test]
    fn rejects_malformed_input() {
        assert!(matches!(
            AgentEnvelope::parse("{not json"),
            Err(EnvelopeError::Json(_))
        ));
        assert!(matches!(
            AgentEnvelope::parse("[1,2]"),
            Err(EnvelopeError::NotAnObject)
        ));
        assert!(matches!(
            AgentEnvelope::parse(r#"{"command":"agent"}"#),
            Err(EnvelopeError::MissingType)
        ));
        assert!(matches!(
            AgentEnvelope::parse(r#"{"type":"output","seq":"one"}"#),
            Err(EnvelopeError::InvalidFields { .. })
        ));
    }
}
