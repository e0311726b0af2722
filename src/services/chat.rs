//! Chat between attendees and the presenter
//!
//! Attendee questions land in the presenter's inbox (and an in-memory
//! history that lives as long as the service). Presenter messages go out to
//! every attendee subscribed to `chat.attendee-inbox`.

use super::{error_reply, parse_body, Deployment, Service, ServiceContext};
use crate::bus::{handler_fn, Envelope};
use crate::error::{ProtocolError, ServerError};
use crate::types::{address, ChatDirection, ChatMessage, ChatUpdate, SessionId};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Author used when a message arrives without one
const ANONYMOUS: &str = "Anonymous";

/// What a sender provides; the server fills in the rest
#[derive(Debug, Deserialize)]
struct OutgoingChat {
    #[serde(default)]
    author: Option<String>,
    body: String,
    #[serde(default)]
    origin: Option<SessionId>,
}

impl OutgoingChat {
    fn into_message(self, direction: ChatDirection) -> Result<ChatMessage, ProtocolError> {
        if self.body.trim().is_empty() {
            return Err(ProtocolError::Validation(
                "Chat message can not be empty".to_string(),
            ));
        }
        let author = self
            .author
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty())
            .unwrap_or_else(|| ANONYMOUS.to_string());

        let mut message = ChatMessage::new(direction, author, self.body);
        message.origin = self.origin;
        message.stamp();
        Ok(message)
    }
}

fn finish(envelope: &mut Envelope, result: Result<Value, ProtocolError>) {
    let reply = match result {
        Ok(value) => value,
        Err(err) => {
            tracing::warn!("Rejected {} message: {}", envelope.address, err);
            error_reply(&err)
        }
    };
    if envelope.expects_reply() {
        envelope.reply(reply);
    }
}

#[derive(Clone, Default)]
pub struct AttendeeChatService {
    history: Arc<RwLock<Vec<ChatMessage>>>,
}

impl AttendeeChatService {
    pub fn new() -> Self {
        Self::default()
    }

    async fn add_message(&self, ctx: &ServiceContext, body: &Value) -> Result<Value, ProtocolError> {
        let incoming: OutgoingChat = parse_body(body)?;
        let message = incoming.into_message(ChatDirection::AttendeeToPresenter)?;

        self.history.write().await.push(message.clone());
        let consumers = ctx.bus.publish(address::CHAT_PRESENTER_INBOX, json!(message));
        if consumers == 0 {
            tracing::debug!("No presenter listening on {}", address::CHAT_PRESENTER_INBOX);
        }

        tracing::info!(
            "Chat message {} from {}",
            message.id.as_deref().unwrap_or_default(),
            message.author
        );
        Ok(json!(message))
    }

    /// Presenter changed the status of a message (e.g. answered it)
    async fn update_message(
        &self,
        ctx: &ServiceContext,
        body: &Value,
    ) -> Result<Value, ProtocolError> {
        let update: ChatUpdate = parse_body(body)?;

        let updated = {
            let mut history = self.history.write().await;
            let message = history
                .iter_mut()
                .find(|m| m.id.as_deref() == Some(update.id.as_str()))
                .ok_or_else(|| {
                    ProtocolError::Validation(format!("Unknown chat message {}", update.id))
                })?;
            message.status = update.status;
            message.clone()
        };

        ctx.sessions
            .broadcast(address::CHAT_ATTENDEE_INBOX, json!(updated))
            .await;
        Ok(json!(updated))
    }

    async fn history(&self) -> Value {
        json!(*self.history.read().await)
    }
}

impl Service for AttendeeChatService {
    fn name(&self) -> &str {
        "attendee-chat"
    }

    fn deploy(&self, ctx: &ServiceContext, deployment: &mut Deployment) -> Result<(), ServerError> {
        let (svc, c) = (self.clone(), ctx.clone());
        deployment.register(
            address::CHAT_TO_PRESENTER,
            handler_fn(move |mut envelope: Envelope| {
                let (svc, c) = (svc.clone(), c.clone());
                async move {
                    let result = svc.add_message(&c, &envelope.body).await;
                    finish(&mut envelope, result);
                }
            }),
        )?;

        let (svc, c) = (self.clone(), ctx.clone());
        deployment.register(
            address::CHAT_UPDATE,
            handler_fn(move |mut envelope: Envelope| {
                let (svc, c) = (svc.clone(), c.clone());
                async move {
                    let result = svc.update_message(&c, &envelope.body).await;
                    finish(&mut envelope, result);
                }
            }),
        )?;

        let svc = self.clone();
        deployment.register(
            address::CHAT_HISTORY,
            handler_fn(move |mut envelope: Envelope| {
                let svc = svc.clone();
                async move {
                    let history = svc.history().await;
                    envelope.reply(history);
                }
            }),
        )?;

        Ok(())
    }

    fn undeploy(&self) {
        if let Ok(mut history) = self.history.try_write() {
            history.clear();
        }
    }
}

#[derive(Clone, Default)]
pub struct PresenterChatService;

impl PresenterChatService {
    pub fn new() -> Self {
        Self
    }

    async fn send_to_attendees(
        ctx: &ServiceContext,
        body: &Value,
    ) -> Result<Value, ProtocolError> {
        let outgoing: OutgoingChat = parse_body(body)?;
        let message = outgoing.into_message(ChatDirection::PresenterToAttendees)?;

        let delivered = ctx
            .sessions
            .broadcast(address::CHAT_ATTENDEE_INBOX, json!(message))
            .await;
        Ok(json!({ "message": message, "delivered": delivered }))
    }
}

impl Service for PresenterChatService {
    fn name(&self) -> &str {
        "presenter-chat"
    }

    fn deploy(&self, ctx: &ServiceContext, deployment: &mut Deployment) -> Result<(), ServerError> {
        let c = ctx.clone();
        deployment.register(
            address::CHAT_TO_ATTENDEES,
            handler_fn(move |mut envelope: Envelope| {
                let c = c.clone();
                async move {
                    let result = Self::send_to_attendees(&c, &envelope.body).await;
                    finish(&mut envelope, result);
                }
            }),
        )?;
        Ok(())
    }
}
