//! In-process event bus with named addresses
//!
//! Every handler registration gets its own queue and its own tokio task, so
//! `send` and `publish` never wait for handler completion and a single
//! registration always sees its messages in order.
//!
//! - `send` delivers to exactly one handler, round-robin across the
//!   registrations at an address.
//! - `publish` delivers to every handler at an address.
//! - `request` is `send` with a reply.

use crate::error::BusError;
use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::{mpsc, oneshot};

pub type HandlerId = u64;

/// A message in flight on the bus
#[derive(Debug)]
pub struct Envelope {
    pub address: String,
    pub body: Value,
    reply: Option<oneshot::Sender<Value>>,
}

impl Envelope {
    pub fn new(address: impl Into<String>, body: Value) -> Self {
        Self {
            address: address.into(),
            body,
            reply: None,
        }
    }

    fn with_reply(address: impl Into<String>, body: Value, reply: oneshot::Sender<Value>) -> Self {
        Self {
            address: address.into(),
            body,
            reply: Some(reply),
        }
    }

    pub fn expects_reply(&self) -> bool {
        self.reply.is_some()
    }

    /// Answer a `request`. Returns false if nobody is waiting.
    pub fn reply(&mut self, body: Value) -> bool {
        match self.reply.take() {
            Some(tx) => tx.send(body).is_ok(),
            None => false,
        }
    }
}

#[async_trait]
pub trait BusHandler: Send + Sync + 'static {
    async fn handle(&self, envelope: Envelope);
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> BusHandler for FnHandler<F>
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, envelope: Envelope) {
        (self.0)(envelope).await
    }
}

/// Wrap an async closure as a handler
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn BusHandler>
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

struct Registration {
    id: HandlerId,
    tx: mpsc::UnboundedSender<Envelope>,
}

#[derive(Default)]
struct AddressEntry {
    registrations: Vec<Registration>,
    cursor: usize,
}

#[derive(Default)]
struct EventBusInner {
    addresses: RwLock<HashMap<String, AddressEntry>>,
    next_id: AtomicU64,
}

#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<EventBusInner>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("handlers", &self.handler_count_total())
            .finish()
    }
}

fn check_address(address: &str) -> Result<&str, BusError> {
    let trimmed = address.trim();
    if trimmed.is_empty() {
        Err(BusError::InvalidAddress)
    } else {
        Ok(trimmed)
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler at `address`. Must be called from within a tokio
    /// runtime: the handler's worker task is spawned here.
    pub fn register_handler(
        &self,
        address: &str,
        handler: Arc<dyn BusHandler>,
    ) -> Result<HandlerId, BusError> {
        let address = check_address(address)?.to_string();
        let id = self.inner.next_id.fetch_add(1, Ordering::AcqRel) + 1;
        let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();

        let worker_address = address.clone();
        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                let outcome = AssertUnwindSafe(handler.handle(envelope))
                    .catch_unwind()
                    .await;
                if outcome.is_err() {
                    tracing::error!("Handler {} at {} panicked", id, worker_address);
                }
            }
            tracing::trace!("Handler {} at {} drained", id, worker_address);
        });

        let mut guard = self
            .inner
            .addresses
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        guard
            .entry(address.clone())
            .or_default()
            .registrations
            .push(Registration { id, tx });

        tracing::debug!("Registered handler {} at {}", id, address);
        Ok(id)
    }

    /// Remove a registration. Messages already queued for it are still
    /// processed. Returns false if it was not registered.
    pub fn unregister_handler(&self, address: &str, id: HandlerId) -> bool {
        let address = address.trim();
        let mut guard = self
            .inner
            .addresses
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(entry) = guard.get_mut(address) else {
            return false;
        };

        let before = entry.registrations.len();
        entry.registrations.retain(|r| r.id != id);
        let removed = entry.registrations.len() != before;
        if entry.registrations.is_empty() {
            guard.remove(address);
        }
        if removed {
            tracing::debug!("Unregistered handler {} at {}", id, address);
        }
        removed
    }

    /// Point-to-point delivery to one handler
    pub fn send(&self, address: &str, body: Value) -> Result<(), BusError> {
        self.dispatch_one(Envelope::new(address.trim(), body))
    }

    /// Point-to-point delivery expecting a reply
    pub async fn request(&self, address: &str, body: Value) -> Result<Value, BusError> {
        let (tx, rx) = oneshot::channel();
        self.dispatch_one(Envelope::with_reply(address.trim(), body, tx))?;
        rx.await
            .map_err(|_| BusError::NoReply(address.trim().to_string()))
    }

    /// Delivery to every handler at `address`. Returns how many handlers
    /// were offered the message.
    pub fn publish(&self, address: &str, body: Value) -> usize {
        let address = address.trim();
        let targets: Vec<mpsc::UnboundedSender<Envelope>> = {
            let guard = self
                .inner
                .addresses
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            match guard.get(address) {
                Some(entry) => entry.registrations.iter().map(|r| r.tx.clone()).collect(),
                None => return 0,
            }
        };

        targets
            .into_iter()
            .filter(|tx| tx.send(Envelope::new(address, body.clone())).is_ok())
            .count()
    }

    /// Channel-backed subscription for code that wants to pull messages
    /// rather than implement a handler
    pub fn consumer(&self, address: &str) -> Result<BusConsumer, BusError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.register_handler(
            address,
            handler_fn(move |envelope: Envelope| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(envelope.body);
                }
            }),
        )?;
        Ok(BusConsumer {
            id,
            address: address.trim().to_string(),
            rx,
            bus: self.clone(),
        })
    }

    pub fn handler_count(&self, address: &str) -> usize {
        let guard = self
            .inner
            .addresses
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        guard
            .get(address.trim())
            .map(|e| e.registrations.len())
            .unwrap_or(0)
    }

    fn handler_count_total(&self) -> usize {
        let guard = self
            .inner
            .addresses
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        guard.values().map(|e| e.registrations.len()).sum()
    }

    fn dispatch_one(&self, mut envelope: Envelope) -> Result<(), BusError> {
        let address = check_address(&envelope.address)?.to_string();
        let mut guard = self
            .inner
            .addresses
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let entry = guard
            .get_mut(&address)
            .filter(|e| !e.registrations.is_empty())
            .ok_or_else(|| BusError::NoHandlers(address.clone()))?;

        // A registration whose worker has gone away is skipped
        let len = entry.registrations.len();
        for _ in 0..len {
            let idx = entry.cursor % len;
            entry.cursor = entry.cursor.wrapping_add(1);
            match entry.registrations[idx].tx.send(envelope) {
                Ok(()) => return Ok(()),
                Err(mpsc::error::SendError(returned)) => envelope = returned,
            }
        }
        Err(BusError::NoHandlers(address))
    }
}

/// Pull-style subscription created by [`EventBus::consumer`]; unregisters
/// itself when dropped
pub struct BusConsumer {
    id: HandlerId,
    address: String,
    rx: mpsc::UnboundedReceiver<Value>,
    bus: EventBus,
}

impl BusConsumer {
    pub fn address(&self) -> &str {
        &self.address
    }

    pub async fn recv(&mut self) -> Option<Value> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Value> {
        self.rx.try_recv().ok()
    }
}

impl Drop for BusConsumer {
    fn drop(&mut self) {
        self.bus.unregister_handler(&self.address, self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    async fn next(consumer: &mut BusConsumer) -> Value {
        tokio::time::timeout(Duration::from_secs(1), consumer.recv())
            .await
            .expect("timed out")
            .expect("consumer closed")
    }

    #[tokio::test]
    async fn test_publish_reaches_every_handler() {
        let bus = EventBus::new();
        let mut a = bus.consumer("endpoint.1").unwrap();
        let mut b = bus.consumer("endpoint.1").unwrap();
        let mut other = bus.consumer("endpoint.2").unwrap();

        assert_eq!(bus.publish("endpoint.1", json!({"n": 1})), 2);
        assert_eq!(next(&mut a).await, json!({"n": 1}));
        assert_eq!(next(&mut b).await, json!({"n": 1}));
        assert!(other.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_publish_unknown_address() {
        let bus = EventBus::new();
        assert_eq!(bus.publish("endpoint.unknown", json!(null)), 0);
    }

    #[tokio::test]
    async fn test_send_round_robin() {
        let bus = EventBus::new();
        let mut a = bus.consumer("work").unwrap();
        let mut b = bus.consumer("work").unwrap();

        for n in 0..4 {
            bus.send("work", json!(n)).unwrap();
        }

        assert_eq!(next(&mut a).await, json!(0));
        assert_eq!(next(&mut b).await, json!(1));
        assert_eq!(next(&mut a).await, json!(2));
        assert_eq!(next(&mut b).await, json!(3));
    }

    #[tokio::test]
    async fn test_send_without_handlers() {
        let bus = EventBus::new();
        assert_eq!(
            bus.send("nobody", json!(1)),
            Err(BusError::NoHandlers("nobody".to_string()))
        );
    }

    #[tokio::test]
    async fn test_blank_address_rejected() {
        let bus = EventBus::new();
        assert!(matches!(bus.consumer("  "), Err(BusError::InvalidAddress)));
        assert_eq!(bus.send("", json!(1)), Err(BusError::InvalidAddress));
    }

    #[tokio::test]
    async fn test_request_reply() {
        let bus = EventBus::new();
        bus.register_handler(
            "echo",
            handler_fn(|mut envelope: Envelope| async move {
                let body = envelope.body.clone();
                envelope.reply(json!({ "echo": body }));
            }),
        )
        .unwrap();

        let reply = bus.request("echo", json!("hello")).await.unwrap();
        assert_eq!(reply, json!({"echo": "hello"}));
    }

    #[tokio::test]
    async fn test_request_without_reply() {
        let bus = EventBus::new();
        bus.register_handler("mute", handler_fn(|_envelope: Envelope| async {}))
            .unwrap();

        let result = bus.request("mute", json!(1)).await;
        assert_eq!(result, Err(BusError::NoReply("mute".to_string())));
    }

    #[tokio::test]
    async fn test_unregister_handler() {
        let bus = EventBus::new();
        let id = bus
            .register_handler("gone", handler_fn(|_envelope: Envelope| async {}))
            .unwrap();
        assert_eq!(bus.handler_count("gone"), 1);

        assert!(bus.unregister_handler("gone", id));
        assert!(!bus.unregister_handler("gone", id));
        assert_eq!(bus.handler_count("gone"), 0);
        assert_eq!(bus.publish("gone", json!(1)), 0);
    }

    #[tokio::test]
    async fn test_consumer_drop_unregisters() {
        let bus = EventBus::new();
        {
            let _consumer = bus.consumer("temp").unwrap();
            assert_eq!(bus.handler_count("temp"), 1);
        }
        assert_eq!(bus.handler_count("temp"), 0);
    }

    #[tokio::test]
    async fn test_send_does_not_wait_for_handler() {
        let bus = EventBus::new();
        let (release_tx, release_rx) = tokio::sync::watch::channel(false);
        let handled = Arc::new(AtomicUsize::new(0));
        let counter = handled.clone();

        bus.register_handler(
            "slow",
            handler_fn(move |_envelope: Envelope| {
                let mut release = release_rx.clone();
                let counter = counter.clone();
                async move {
                    let _ = release.wait_for(|r| *r).await;
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            }),
        )
        .unwrap();

        for _ in 0..3 {
            bus.send("slow", json!(null)).unwrap();
        }
        assert_eq!(handled.load(Ordering::SeqCst), 0);

        release_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), async {
            while handled.load(Ordering::SeqCst) < 3 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_panicking_handler_keeps_running() {
        let bus = EventBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.register_handler(
            "fragile",
            handler_fn(move |envelope: Envelope| {
                let tx = tx.clone();
                async move {
                    if envelope.body == json!("boom") {
                        panic!("boom");
                    }
                    let _ = tx.send(envelope.body);
                }
            }),
        )
        .unwrap();

        bus.send("fragile", json!("boom")).unwrap();
        bus.send("fragile", json!("ok")).unwrap();

        let got = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap();
        assert_eq!(got, Some(json!("ok")));
    }
}
