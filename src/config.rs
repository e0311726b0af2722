//! Server configuration
//!
//! Values come from the environment (a `.env` file is loaded by `main`);
//! everything has a default so an empty environment still starts a server.

use crate::sessions::DEFAULT_QUEUE_CAPACITY;
use crate::types::address;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 8080;
const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 2_000;

/// Which bus addresses WebSocket clients may reach
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeOptions {
    /// Addresses attendees may `send` to
    pub inbound: BTreeSet<String>,
    /// Channels attendees may subscribe to
    pub outbound: BTreeSet<String>,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            inbound: [
                address::CHAT_TO_PRESENTER,
                address::CHAT_HISTORY,
                address::QUIZ_SUBMIT,
                address::QUIZ_CURRENT,
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            outbound: [
                address::CHAT_ATTENDEE_INBOX,
                address::QUIZ_PUBLISH,
                address::QUIZ_CLOSE,
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }
}

impl BridgeOptions {
    pub fn permits_inbound(&self, address: &str) -> bool {
        self.inbound.contains(address)
    }

    pub fn permits_outbound(&self, channel: &str) -> bool {
        self.outbound.contains(channel)
    }

    /// Let attendees reach an extra address, e.g. one served by a custom
    /// service
    pub fn allow_inbound(mut self, address: impl Into<String>) -> Self {
        self.inbound.insert(address.into());
        self
    }

    pub fn allow_outbound(mut self, channel: impl Into<String>) -> Self {
        self.outbound.insert(channel.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /// Directory holding the browser client; the embedded client is used
    /// when unset
    pub static_dir: Option<PathBuf>,
    /// Outbound queue length per attendee session
    pub session_queue: usize,
    /// How long `stop` waits for open connections before dropping them
    pub shutdown_grace: Duration,
    pub bridge: BridgeOptions,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            static_dir: None,
            session_queue: DEFAULT_QUEUE_CAPACITY,
            shutdown_grace: Duration::from_millis(DEFAULT_SHUTDOWN_GRACE_MS),
            bridge: BridgeOptions::default(),
        }
    }
}

impl ServerConfig {
    /// Load config from environment variables
    pub fn from_env() -> Self {
        let static_dir = std::env::var("PODIUM_STATIC_DIR")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);

        let session_queue = std::env::var("PODIUM_SESSION_QUEUE")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|v: &usize| *v > 0)
            .unwrap_or(DEFAULT_QUEUE_CAPACITY);

        let shutdown_grace_ms = std::env::var("PODIUM_SHUTDOWN_GRACE_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_SHUTDOWN_GRACE_MS);

        Self {
            static_dir,
            session_queue,
            shutdown_grace: Duration::from_millis(shutdown_grace_ms),
            bridge: BridgeOptions::default(),
        }
    }
}

/// Where to listen, from `PODIUM_HOST` / `PODIUM_PORT`. The host falls back
/// to the machine's outward-facing address.
pub fn listen_address_from_env() -> (String, u16) {
    let host = std::env::var("PODIUM_HOST")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| crate::net::local_ip().to_string());

    let port = std::env::var("PODIUM_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_PORT);

    (host, port)
}
