//! Messages exchanged with websocket clients.
//!
//! The transport provides message boundaries, so each frame is one JSON
//! document with no framing of its own.

use serde::{Deserialize, Serialize};

use crate::error::{CoreResult, RelayError};
use crate::model::ConversationTurn;

/// Largest client message accepted, in bytes.
pub const MAX_CLIENT_MESSAGE: usize = 1024 * 1024;

/// Client → relay: start one exchange with this history.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ChatRequest {
    pub messages: Vec<ConversationTurn>,
}

impl ChatRequest {
    /// Parse one raw client message, mapping every failure to `MessageFormat`.
    pub fn parse(raw: &str) -> CoreResult<Self> {
        if raw.len() > MAX_CLIENT_MESSAGE {
            return Err(RelayError::MessageFormat(format!(
                "message of {} bytes exceeds {MAX_CLIENT_MESSAGE}",
                raw.len()
            )));
        }
        serde_json::from_str(raw).map_err(|e| RelayError::MessageFormat(e.to_string()))
    }
}

/// Relay → client.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum ServerFrame {
    /// One increment of assistant output. Order matters.
    Content { content: String },
    /// Terminal success.
    Done { done: bool },
    /// Terminal failure; the connection stays usable.
    Error { error: String },
}

impl ServerFrame {
    pub fn content(text: impl Into<String>) -> Self {
        Self::Content {
            content: text.into(),
        }
    }

    pub fn done() -> Self {
        Self::Done { done: true }
    }

    pub fn error(reason: impl Into<String>) -> Self {
        Self::Error {
            error: reason.into(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }

    pub fn to_json(&self) -> String {
        // Every variant is a flat object of strings/bools; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_else(|_| r#"{"error":"encode failure"}"#.to_string())
    }
}
