//! Bridge frame dispatch
//!
//! Permissions are checked here before anything reaches the bus or the
//! session registry.

use super::BridgeSession;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::services::ServiceContext;
use crate::types::address;
use serde_json::{json, Value};

/// Return early if the address is not open to attendees in this direction
macro_rules! check_permitted {
    ($allowed:expr, $address:expr) => {
        if !$allowed {
            tracing::warn!("Attendee tried to reach {}", $address);
            return Some(ServerMessage::error(
                "FORBIDDEN_ADDRESS",
                format!("{} is not open to attendees", $address),
            ));
        }
    };
}

/// Handle one client frame and return an optional response frame
pub async fn handle_message(
    msg: ClientMessage,
    session: &BridgeSession,
    ctx: &ServiceContext,
) -> Option<ServerMessage> {
    match msg {
        ClientMessage::Ping => Some(ServerMessage::Pong),

        ClientMessage::Subscribe { address } => {
            check_permitted!(ctx.config.bridge.permits_outbound(&address), address);
            if ctx.sessions.subscribe(&session.id, &address).await {
                tracing::debug!("Session {} subscribed to {}", session.id, address);
                Some(ServerMessage::Subscribed { address })
            } else {
                Some(ServerMessage::error("UNKNOWN_SESSION", "Session is closed"))
            }
        }

        ClientMessage::Unsubscribe { address } => {
            ctx.sessions.unsubscribe(&session.id, &address).await;
            Some(ServerMessage::Unsubscribed { address })
        }

        ClientMessage::Send {
            address,
            body,
            reply_id,
        } => {
            check_permitted!(ctx.config.bridge.permits_inbound(&address), address);
            let body = match stamp_sender(&address, body, session) {
                Ok(body) => body,
                Err(msg) => return Some(ServerMessage::error("MALFORMED", msg)),
            };

            match reply_id {
                Some(reply_id) => match ctx.bus.request(&address, body).await {
                    Ok(body) => Some(ServerMessage::Reply { reply_id, body }),
                    Err(e) => {
                        tracing::warn!("Request to {} failed: {}", address, e);
                        Some(ServerMessage::error(e.code(), e.to_string()))
                    }
                },
                None => match ctx.bus.send(&address, body) {
                    Ok(()) => None,
                    Err(e) => {
                        tracing::warn!("Send to {} failed: {}", address, e);
                        Some(ServerMessage::error(e.code(), e.to_string()))
                    }
                },
            }
        }
    }
}

/// Attendees act only as themselves: the session id is written into
/// submissions and chat messages, overriding whatever the client sent.
fn stamp_sender(address: &str, body: Value, session: &BridgeSession) -> Result<Value, String> {
    let stamps_session = address == address::QUIZ_SUBMIT || address == address::CHAT_TO_PRESENTER;
    if !stamps_session {
        return Ok(body);
    }

    let mut body = match body {
        Value::Object(map) => map,
        other => return Err(format!("Expected an object for {}, got {}", address, other)),
    };

    if address == address::QUIZ_SUBMIT {
        body.insert("session_id".to_string(), json!(session.id));
    } else {
        body.insert("origin".to_string(), json!(session.id));
        let has_author = body
            .get("author")
            .and_then(Value::as_str)
            .is_some_and(|a| !a.trim().is_empty());
        if !has_author {
            body.insert("author".to_string(), json!(session.nickname));
        }
    }
    Ok(Value::Object(body))
}
