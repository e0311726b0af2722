use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Opaque ID types
pub type SessionId = String;
pub type MessageId = String;
pub type Address = String;

/// Bus addresses forming the protocol surface
pub mod address {
    pub const CHAT_TO_PRESENTER: &str = "chat.to-presenter";
    pub const CHAT_PRESENTER_INBOX: &str = "chat.presenter-inbox";
    pub const CHAT_TO_ATTENDEES: &str = "chat.to-attendees";
    pub const CHAT_ATTENDEE_INBOX: &str = "chat.attendee-inbox";
    pub const CHAT_HISTORY: &str = "chat.history";
    pub const CHAT_UPDATE: &str = "chat.update";

    pub const QUIZ_PUBLISH: &str = "quiz.publish";
    pub const QUIZ_SUBMIT: &str = "quiz.submit";
    pub const QUIZ_CLOSE: &str = "quiz.close";
    pub const QUIZ_RESULTS: &str = "quiz.results";
    pub const QUIZ_CURRENT: &str = "quiz.current";
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChatDirection {
    AttendeeToPresenter,
    PresenterToAttendees,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChatStatus {
    #[default]
    New,
    Answered,
    Discarded,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    /// Assigned by the server (`msg-` prefixed)
    #[serde(default)]
    pub id: Option<MessageId>,
    pub direction: ChatDirection,
    #[serde(default)]
    pub author: String,
    pub body: String,
    /// RFC 3339, stamped by the server on receipt
    #[serde(default)]
    pub sent_at: Option<String>,
    #[serde(default)]
    pub status: ChatStatus,
    /// Session that sent the message (attendee messages only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<SessionId>,
}

impl ChatMessage {
    pub fn new(direction: ChatDirection, author: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            id: None,
            direction,
            author: author.into(),
            body: body.into(),
            sent_at: None,
            status: ChatStatus::New,
            origin: None,
        }
    }

    /// Assign a server-side id and timestamp
    pub fn stamp(&mut self) {
        self.id = Some(format!("msg-{}", ulid::Ulid::new()));
        self.sent_at = Some(chrono::Utc::now().to_rfc3339());
    }
}

/// Status change of a chat message, sent by the presenter on `chat.update`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatUpdate {
    pub id: MessageId,
    pub status: ChatStatus,
}

/// Snapshot of an attendee session as tracked by the registry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AttendeeSession {
    pub session_id: SessionId,
    pub connected_at: String,
    pub subscribed_channels: BTreeSet<String>,
}
