//! WebSocket frames exchanged between the bridge and browser clients
//!
//! Every frame is a JSON object tagged by `"t"`.

use crate::types::SessionId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PROTOCOL_VERSION: &str = "1.0";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "t", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe {
        address: String,
    },
    Unsubscribe {
        address: String,
    },
    /// Point-to-point message to a bus address. With a `reply_id` the
    /// handler's answer comes back as a `reply` frame.
    Send {
        address: String,
        #[serde(default)]
        body: Value,
        #[serde(default)]
        reply_id: Option<String>,
    },
    Ping,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "t", rename_all = "snake_case")]
pub enum ServerMessage {
    Welcome {
        protocol: String,
        session_id: SessionId,
        /// Nickname used for chat messages sent without an author
        nickname: String,
        server_now: String,
    },
    Event {
        address: String,
        body: Value,
    },
    Reply {
        reply_id: String,
        body: Value,
    },
    Subscribed {
        address: String,
    },
    Unsubscribed {
        address: String,
    },
    Error {
        code: String,
        msg: String,
    },
    Pong,
}

impl ServerMessage {
    pub fn error(code: &str, msg: impl Into<String>) -> Self {
        ServerMessage::Error {
            code: code.to_string(),
            msg: msg.into(),
        }
    }
}
