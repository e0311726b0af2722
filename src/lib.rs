// Public API for the desktop host and integration tests

pub mod bus;
pub mod config;
pub mod error;
pub mod net;
pub mod protocol;
pub mod quiz;
pub mod registry;
pub mod server;
pub mod services;
pub mod sessions;
pub mod tasks;
pub mod types;
pub mod ws;

pub use error::{BusError, ProtocolError, ServerError, TaskError};
pub use server::{InteractionServer, LifecycleState, ServerHandle};
