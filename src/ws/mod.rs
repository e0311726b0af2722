//! WebSocket bridge between browser clients and the event bus
//!
//! Each connection becomes an attendee session. Frames from the client are
//! dispatched by [`handlers::handle_message`]; channel deliveries queued by
//! the session registry are forwarded as `event` frames.

pub mod handlers;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::{sink::SinkExt, stream::StreamExt};
use rand::Rng;

use crate::protocol::{ClientMessage, ServerMessage, PROTOCOL_VERSION};
use crate::services::ServiceContext;
use crate::sessions::SessionHandle;
use crate::types::SessionId;

/// Safe character set for nicknames (excludes 0/O, 1/I/L to avoid confusion)
const NICKNAME_CHARS: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";
const NICKNAME_CODE_LENGTH: usize = 5;

/// Generate a short nickname such as `Guest-K7QX2`
pub fn generate_nickname() -> String {
    let mut rng = rand::rng();
    let code: String = (0..NICKNAME_CODE_LENGTH)
        .map(|_| NICKNAME_CHARS[rng.random_range(0..NICKNAME_CHARS.len())] as char)
        .collect();
    format!("Guest-{}", code)
}

/// Who is on the other end of a connection
#[derive(Debug, Clone)]
pub struct BridgeSession {
    pub id: SessionId,
    pub nickname: String,
}

pub fn router(ctx: ServiceContext) -> Router {
    Router::new().route("/ws", get(ws_handler)).with_state(ctx)
}

/// WebSocket upgrade handler
pub async fn ws_handler(ws: WebSocketUpgrade, State(ctx): State<ServiceContext>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, ctx))
}

async fn send_frame<S>(sender: &mut S, frame: &ServerMessage) -> bool
where
    S: SinkExt<Message> + Unpin,
{
    match serde_json::to_string(frame) {
        Ok(json) => sender.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            tracing::error!("Failed to encode frame: {}", e);
            true
        }
    }
}

/// Handle individual WebSocket connection
async fn handle_socket(socket: WebSocket, ctx: ServiceContext) {
    let (mut sender, mut receiver) = socket.split();

    let session = BridgeSession {
        id: ulid::Ulid::new().to_string(),
        nickname: generate_nickname(),
    };
    let (handle, mut outbound) = SessionHandle::channel(ctx.config.session_queue);
    ctx.sessions.register(&session.id, handle).await;
    tracing::info!("Attendee {} connected as {}", session.id, session.nickname);

    let welcome = ServerMessage::Welcome {
        protocol: PROTOCOL_VERSION.to_string(),
        session_id: session.id.clone(),
        nickname: session.nickname.clone(),
        server_now: chrono::Utc::now().to_rfc3339(),
    };
    if !send_frame(&mut sender, &welcome).await {
        tracing::error!("Failed to send welcome message");
        ctx.sessions.unregister(&session.id).await;
        return;
    }

    loop {
        tokio::select! {
            // Channel deliveries for this session; the queue closes when
            // the session is dropped from the registry (server stop)
            delivery = outbound.recv() => {
                match delivery {
                    Some(delivery) => {
                        let event = ServerMessage::Event {
                            address: delivery.channel,
                            body: delivery.payload,
                        };
                        if !send_frame(&mut sender, &event).await {
                            break;
                        }
                    }
                    None => {
                        tracing::debug!("Session {} closed by server", session.id);
                        let _ = sender.send(Message::Close(None)).await;
                        break;
                    }
                }
            }

            ws_msg = receiver.next() => {
                match ws_msg {
                    Some(Ok(Message::Text(text))) => {
                        tracing::debug!("Received frame from {}: {}", session.id, text);

                        let response = match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(client_msg) => handlers::handle_message(client_msg, &session, &ctx).await,
                            Err(e) => {
                                tracing::warn!("Failed to parse client frame: {}", e);
                                Some(ServerMessage::error(
                                    "PARSE_ERROR",
                                    format!("Invalid message format: {}", e),
                                ))
                            }
                        };
                        if let Some(response) = response {
                            if !send_frame(&mut sender, &response).await {
                                tracing::error!("Failed to send response");
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) => break,
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!("WebSocket error: {}", e);
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    ctx.sessions.unregister(&session.id).await;
    tracing::info!("Attendee {} disconnected", session.id);
}
