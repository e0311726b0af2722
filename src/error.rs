//! Error types shared across the server
//!
//! Lifecycle errors surface through the result of `start`/`stop`; per-message
//! errors are logged and handled inside the service that saw them.

use crate::quiz::QuizId;
use crate::server::LifecycleState;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to bind to {host}:{port}: {source}")]
    Bind {
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("A server is already created for {host}:{port}")]
    AlreadyCreated { host: String, port: u16 },

    #[error("Server is {0:?}, operation not allowed")]
    InvalidState(LifecycleState),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Service {service} failed to deploy: {reason}")]
    Deploy { service: String, reason: String },

    #[error(transparent)]
    Bus(#[from] BusError),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BusError {
    #[error("Address can not be empty")]
    InvalidAddress,

    #[error("No handlers registered at {0}")]
    NoHandlers(String),

    #[error("Handler at {0} did not reply")]
    NoReply(String),
}

impl BusError {
    pub fn code(&self) -> &'static str {
        match self {
            BusError::InvalidAddress => "INVALID_ADDRESS",
            BusError::NoHandlers(_) => "NO_HANDLER",
            BusError::NoReply(_) => "NO_REPLY",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    #[error("Task name can not be empty")]
    EmptyName,

    #[error("Task {name} can not be started from state {state:?}")]
    NotReady {
        name: String,
        state: crate::tasks::TaskState,
    },
}

/// Rejections raised by the quiz service; never surfaced to attendees
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Quiz {0} is not active")]
    NotActive(QuizId),

    #[error("No quiz is active")]
    NoActiveQuiz,

    #[error("Malformed payload: {0}")]
    Malformed(String),

    #[error("Validation failed: {0}")]
    Validation(String),
}

impl ProtocolError {
    /// Machine-readable code sent in error replies
    pub fn code(&self) -> &'static str {
        match self {
            ProtocolError::NotActive(_) | ProtocolError::NoActiveQuiz => "NOT_ACTIVE",
            ProtocolError::Malformed(_) => "MALFORMED",
            ProtocolError::Validation(_) => "VALIDATION_FAILED",
        }
    }
}
