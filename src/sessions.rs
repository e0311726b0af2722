//! Registry of connected attendee sessions
//!
//! The single source of truth for who is currently listening on which
//! channel. Broadcasts copy the subscriber list under the lock and deliver
//! after releasing it, so a slow client never holds up registrations.

use crate::types::{AttendeeSession, SessionId};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

/// Default per-session outbound queue length
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// A message on its way to one session
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub channel: String,
    pub payload: Value,
}

/// Sending half of a session's outbound queue
#[derive(Debug, Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<Outbound>,
}

impl SessionHandle {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Non-blocking offer. A full queue or a closed connection means the
    /// message is simply not delivered.
    pub fn offer(&self, outbound: Outbound) -> bool {
        self.tx.try_send(outbound).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[derive(Debug)]
struct SessionEntry {
    handle: SessionHandle,
    connected_at: String,
    channels: BTreeSet<String>,
}

impl SessionEntry {
    fn snapshot(&self, session_id: &SessionId) -> AttendeeSession {
        AttendeeSession {
            session_id: session_id.clone(),
            connected_at: self.connected_at.clone(),
            subscribed_channels: self.channels.clone(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<SessionId, SessionEntry>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session. Re-registering an existing id swaps the handle
    /// and keeps its subscriptions.
    pub async fn register(&self, session_id: &SessionId, handle: SessionHandle) {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(session_id) {
            Some(entry) => {
                tracing::debug!("Session {} re-registered", session_id);
                entry.handle = handle;
            }
            None => {
                tracing::info!("Session {} registered", session_id);
                sessions.insert(
                    session_id.clone(),
                    SessionEntry {
                        handle,
                        connected_at: chrono::Utc::now().to_rfc3339(),
                        channels: BTreeSet::new(),
                    },
                );
            }
        }
    }

    /// Returns false for unknown sessions
    pub async fn subscribe(&self, session_id: &SessionId, channel: &str) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(session_id) {
            Some(entry) => {
                entry.channels.insert(channel.to_string());
                true
            }
            None => false,
        }
    }

    pub async fn unsubscribe(&self, session_id: &SessionId, channel: &str) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(session_id) {
            Some(entry) => entry.channels.remove(channel),
            None => false,
        }
    }

    /// Remove a session; unknown ids are ignored since disconnects race
    pub async fn unregister(&self, session_id: &SessionId) -> bool {
        let removed = self.sessions.write().await.remove(session_id).is_some();
        if removed {
            tracing::info!("Session {} unregistered", session_id);
        }
        removed
    }

    /// Offer `payload` once to every session subscribed to `channel`.
    /// Returns the number of sessions that accepted it.
    pub async fn broadcast(&self, channel: &str, payload: Value) -> usize {
        let targets: Vec<SessionHandle> = {
            let sessions = self.sessions.read().await;
            sessions
                .values()
                .filter(|entry| entry.channels.contains(channel))
                .map(|entry| entry.handle.clone())
                .collect()
        };

        let subscribers = targets.len();
        let delivered = targets
            .into_iter()
            .filter(|handle| {
                handle.offer(Outbound {
                    channel: channel.to_string(),
                    payload: payload.clone(),
                })
            })
            .count();

        tracing::debug!(
            "Broadcast on {} delivered to {}/{} sessions",
            channel,
            delivered,
            subscribers
        );
        delivered
    }

    /// Deliver to a single session regardless of its subscriptions
    pub async fn send_to(&self, session_id: &SessionId, channel: &str, payload: Value) -> bool {
        let handle = self
            .sessions
            .read()
            .await
            .get(session_id)
            .map(|entry| entry.handle.clone());

        match handle {
            Some(handle) => handle.offer(Outbound {
                channel: channel.to_string(),
                payload,
            }),
            None => false,
        }
    }

    pub async fn session(&self, session_id: &SessionId) -> Option<AttendeeSession> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|entry| entry.snapshot(session_id))
    }

    pub async fn sessions(&self) -> Vec<AttendeeSession> {
        let sessions = self.sessions.read().await;
        let mut list: Vec<AttendeeSession> = sessions
            .iter()
            .map(|(id, entry)| entry.snapshot(id))
            .collect();
        list.sort_by(|a, b| a.connected_at.cmp(&b.connected_at));
        list
    }

    pub async fn subscriber_count(&self, channel: &str) -> usize {
        self.sessions
            .read()
            .await
            .values()
            .filter(|entry| entry.channels.contains(channel))
            .count()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Drop every session. Their outbound queues close, which ends the
    /// connection tasks reading from them.
    pub async fn clear(&self) -> usize {
        let mut sessions = self.sessions.write().await;
        let count = sessions.len();
        sessions.clear();
        if count > 0 {
            tracing::info!("Closed {} attendee sessions", count);
        }
        count
    }
}
