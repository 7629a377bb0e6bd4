use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ErrorCode;

/// Which side of the relay a `hello` frame identifies itself as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Agent,
    Client,
}

/// Discriminated-union wire frame. `ts` is preserved as whatever JSON value the
/// sender used (number or string) rather than coerced to a fixed type — see the
/// framing note on exact `ts` preservation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Hello {
        role: Role,
        #[serde(skip_serializing_if = "Option::is_none")]
        agent_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        device_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tenant_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        ts: Option<Value>,
    },
    Presence {
        agent_id: String,
        online: bool,
        ts: Value,
    },
    #[serde(rename = "presence.request")]
    PresenceRequest {},
    #[serde(rename = "chat.request")]
    ChatRequest {
        request_id: String,
        agent_id: String,
        session_id: String,
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        ts: Option<Value>,
    },
    /// Accepts `reply`, `text`, or `message` on the wire (design note 9c);
    /// always serializes back out under `reply`.
    #[serde(rename = "chat.response")]
    ChatResponse {
        request_id: String,
        agent_id: String,
        session_id: String,
        #[serde(alias = "text", alias = "message")]
        reply: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        ts: Option<Value>,
    },
    MessageSent {
        request_id: String,
    },
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        code: ErrorCode,
        message: String,
    },
    Ping {
        #[serde(skip_serializing_if = "Option::is_none")]
        ts: Option<Value>,
    },
    Pong {
        #[serde(skip_serializing_if = "Option::is_none")]
        ts: Option<Value>,
    },
}

impl Frame {
    pub fn error(request_id: Option<String>, code: ErrorCode, message: impl Into<String>) -> Self {
        Frame::Error {
            request_id,
            code,
            message: message.into(),
        }
    }

    /// Byte length of this frame once serialized, for the 32 KiB size cap.
    pub fn encoded_len(&self) -> usize {
        serde_json::to_vec(self).map(|v| v.len()).unwrap_or(usize::MAX)
    }
}
