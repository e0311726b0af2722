//! Process-wide interaction server
//!
//! There is at most one server per process. [`InteractionServer::create`]
//! claims it and hands out a [`ServerHandle`]; the handle drives the
//! lifecycle `Created -> Starting -> Running -> Stopping -> Stopped` and can
//! be started again after a stop.

use crate::bus::EventBus;
use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::net;
use crate::services::{Deployment, ServedAddress, Service, ServiceContext, ServiceDescriptor};
use crate::sessions::SessionRegistry;
use crate::ws;
use axum::Router;
use serde::Serialize;
use std::net::{IpAddr, SocketAddr};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
}

static INSTANCE: Mutex<Option<ServerHandle>> = Mutex::new(None);

/// Entry point for the process-wide server
pub struct InteractionServer;

impl InteractionServer {
    /// Claim the server for `host:port`. Asking again with the same
    /// arguments returns the same handle.
    pub fn create(
        host: impl Into<String>,
        port: u16,
        config: ServerConfig,
    ) -> Result<ServerHandle, ServerError> {
        let host = host.into().trim().to_string();
        if host.is_empty() {
            return Err(ServerError::Validation("Host can not be empty".to_string()));
        }

        let mut instance = INSTANCE.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = instance.as_ref() {
            let inner = &existing.inner;
            if inner.host == host && inner.port == port && *inner.config == config {
                return Ok(existing.clone());
            }
            return Err(ServerError::AlreadyCreated {
                host: inner.host.clone(),
                port: inner.port,
            });
        }

        let handle = ServerHandle::new(host, port, config);
        tracing::info!("Created server for {}:{}", handle.host(), port);
        *instance = Some(handle.clone());
        Ok(handle)
    }

    /// The server claimed by `create`, if any
    pub fn current() -> Option<ServerHandle> {
        INSTANCE
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

struct Runtime {
    shutdown: watch::Sender<bool>,
    server: JoinHandle<std::io::Result<()>>,
    deployments: Vec<(Box<dyn Service>, Deployment)>,
}

struct Inner {
    host: String,
    port: u16,
    config: Arc<ServerConfig>,
    bus: EventBus,
    sessions: SessionRegistry,
    state: watch::Sender<LifecycleState>,
    local_addr: RwLock<Option<SocketAddr>>,
    /// Held for the whole of `start`/`stop` so transitions never overlap
    runtime: tokio::sync::Mutex<Option<Runtime>>,
}

#[derive(Clone)]
pub struct ServerHandle {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerHandle")
            .field("host", &self.inner.host)
            .field("port", &self.inner.port)
            .field("state", &self.state())
            .finish()
    }
}

impl ServerHandle {
    fn new(host: String, port: u16, config: ServerConfig) -> Self {
        let (state, _) = watch::channel(LifecycleState::Created);
        Self {
            inner: Arc::new(Inner {
                host,
                port,
                config: Arc::new(config),
                bus: EventBus::new(),
                sessions: SessionRegistry::new(),
                state,
                local_addr: RwLock::new(None),
                runtime: tokio::sync::Mutex::new(None),
            }),
        }
    }

    pub fn host(&self) -> &str {
        &self.inner.host
    }

    /// The bound port while running, the requested one otherwise
    pub fn port(&self) -> u16 {
        self.local_addr()
            .map(|addr| addr.port())
            .unwrap_or(self.inner.port)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self
            .inner
            .local_addr
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> LifecycleState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<LifecycleState> {
        self.inner.state.subscribe()
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.inner.sessions
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    fn set_state(&self, state: LifecycleState) {
        tracing::debug!("Server {}:{} is {:?}", self.inner.host, self.inner.port, state);
        self.inner.state.send_replace(state);
    }

    /// The components services see, for hosts that drive the bus directly
    pub fn context(&self) -> ServiceContext {
        ServiceContext {
            bus: self.inner.bus.clone(),
            sessions: self.inner.sessions.clone(),
            config: self.inner.config.clone(),
        }
    }

    /// Host name rendered into served pages; wildcard bind addresses are
    /// replaced with the outward-facing address
    fn served_host(&self) -> String {
        match self.inner.host.parse::<IpAddr>() {
            Ok(ip) if ip.is_unspecified() => net::local_ip().to_string(),
            _ => self.inner.host.clone(),
        }
    }

    /// Deploy `services` in order, bind and serve.
    pub async fn start(&self, services: &[ServiceDescriptor]) -> Result<(), ServerError> {
        let mut runtime = self.inner.runtime.lock().await;
        match self.state() {
            LifecycleState::Running => {
                tracing::info!("Server is already running on port {}", self.port());
                return Ok(());
            }
            state @ (LifecycleState::Starting | LifecycleState::Stopping) => {
                return Err(ServerError::InvalidState(state));
            }
            LifecycleState::Created | LifecycleState::Stopped => {}
        }

        self.set_state(LifecycleState::Starting);

        let ctx = self.context();
        let mut deployments: Vec<(Box<dyn Service>, Deployment)> = Vec::new();
        for descriptor in services {
            let service = descriptor.instantiate(&self.inner.config);
            let mut deployment = Deployment::new(service.name(), self.inner.bus.clone());
            if let Err(e) = service.deploy(&ctx, &mut deployment) {
                tracing::error!("Failed to deploy {}: {}", descriptor.name(), e);
                deployment.undeploy();
                service.undeploy();
                undeploy_all(deployments);
                self.set_state(LifecycleState::Stopped);
                return Err(e);
            }
            tracing::info!(
                "Deployed {} on [{}]",
                service.name(),
                deployment.addresses().join(", ")
            );
            deployments.push((service, deployment));
        }

        let bound = match TcpListener::bind((self.inner.host.as_str(), self.inner.port)).await {
            Ok(listener) => listener.local_addr().map(|addr| (listener, addr)),
            Err(e) => Err(e),
        };
        let (listener, local_addr) = match bound {
            Ok(bound) => bound,
            Err(source) => {
                tracing::error!(
                    "Failed to bind {}:{}: {}",
                    self.inner.host,
                    self.inner.port,
                    source
                );
                undeploy_all(deployments);
                self.set_state(LifecycleState::Stopped);
                return Err(ServerError::Bind {
                    host: self.inner.host.clone(),
                    port: self.inner.port,
                    source,
                });
            }
        };

        let served = ServedAddress {
            host: self.served_host(),
            port: local_addr.port(),
        };
        let app = match build_router(ctx, &deployments, &served) {
            Ok(app) => app,
            Err(e) => {
                tracing::error!("{}", e);
                drop(listener);
                undeploy_all(deployments);
                self.set_state(LifecycleState::Stopped);
                return Err(e);
            }
        };

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let server = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.changed().await;
                })
                .await
        });

        *self
            .inner
            .local_addr
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(local_addr);
        *runtime = Some(Runtime {
            shutdown,
            server,
            deployments,
        });
        self.set_state(LifecycleState::Running);
        tracing::info!("Listening on http://{}", local_addr);
        Ok(())
    }

    /// Undeploy services, close every session and the listener. Does
    /// nothing unless running.
    pub async fn stop(&self) {
        let mut runtime = self.inner.runtime.lock().await;
        let Some(Runtime {
            shutdown,
            mut server,
            deployments,
        }) = runtime.take()
        else {
            tracing::debug!("Server is {:?}, nothing to stop", self.state());
            return;
        };

        self.set_state(LifecycleState::Stopping);
        undeploy_all(deployments);

        let _ = shutdown.send(true);
        let closed = self.inner.sessions.clear().await;
        tracing::info!("Closed {} attendee sessions", closed);

        match tokio::time::timeout(self.inner.config.shutdown_grace, &mut server).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => tracing::warn!("Server exited with error: {}", e),
            Ok(Err(e)) => tracing::warn!("Server task failed: {}", e),
            Err(_) => {
                tracing::warn!(
                    "Connections still open after {:?}, dropping them",
                    self.inner.config.shutdown_grace
                );
                server.abort();
            }
        }

        *self
            .inner
            .local_addr
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
        self.set_state(LifecycleState::Stopped);
        tracing::info!("Server stopped");
    }

    /// Give up the process-wide claim so `create` can be called with other
    /// arguments
    pub fn release(&self) -> Result<(), ServerError> {
        match self.state() {
            LifecycleState::Created | LifecycleState::Stopped => {}
            state => return Err(ServerError::InvalidState(state)),
        }
        let mut instance = INSTANCE.lock().unwrap_or_else(PoisonError::into_inner);
        if instance
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(&current.inner, &self.inner))
        {
            *instance = None;
            tracing::info!("Released server for {}:{}", self.inner.host, self.inner.port);
        }
        Ok(())
    }
}

/// Merge the bridge and every service's routes. Axum rejects overlapping
/// routes or a second fallback by panicking; that is reported as a deploy
/// failure of the service that brought them.
fn build_router(
    ctx: ServiceContext,
    deployments: &[(Box<dyn Service>, Deployment)],
    served: &ServedAddress,
) -> Result<Router, ServerError> {
    let mut app = ws::router(ctx);
    for (service, _) in deployments {
        let merged = panic::catch_unwind(AssertUnwindSafe(|| {
            service.routes(served).map(|routes| app.clone().merge(routes))
        }));
        match merged {
            Ok(Some(merged)) => app = merged,
            Ok(None) => {}
            Err(cause) => {
                let reason = cause
                    .downcast_ref::<String>()
                    .map(String::as_str)
                    .or_else(|| cause.downcast_ref::<&str>().copied())
                    .unwrap_or("conflicting routes");
                return Err(ServerError::Deploy {
                    service: service.name().to_string(),
                    reason: format!("routes rejected: {}", reason),
                });
            }
        }
    }
    Ok(app
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http()))
}

fn undeploy_all(deployments: Vec<(Box<dyn Service>, Deployment)>) {
    for (service, deployment) in deployments.into_iter().rev() {
        deployment.undeploy();
        service.undeploy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn fresh(port: u16) -> ServerHandle {
        if let Some(previous) = InteractionServer::current() {
            previous.release().unwrap();
        }
        InteractionServer::create("127.0.0.1", port, ServerConfig::default()).unwrap()
    }

    async fn http_get(addr: SocketAddr, path: &str) -> String {
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
            path
        );
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    #[serial]
    async fn test_create_returns_same_handle() {
        let first = fresh(0);
        let again = InteractionServer::create("127.0.0.1", 0, ServerConfig::default()).unwrap();
        assert!(Arc::ptr_eq(&first.inner, &again.inner));

        let other = InteractionServer::create("127.0.0.1", 9999, ServerConfig::default());
        assert!(matches!(other, Err(ServerError::AlreadyCreated { .. })));

        first.release().unwrap();
        assert!(InteractionServer::current().is_none());
    }

    #[tokio::test]
    #[serial]
    async fn test_blank_host_rejected() {
        let result = InteractionServer::create("  ", 0, ServerConfig::default());
        assert!(matches!(result, Err(ServerError::Validation(_))));
    }

    #[tokio::test]
    #[serial]
    async fn test_start_stop_cycle() {
        let server = fresh(0);
        let mut states = server.watch_state();
        assert_eq!(server.state(), LifecycleState::Created);

        server.start(&ServiceDescriptor::defaults()).await.unwrap();
        assert_eq!(server.state(), LifecycleState::Running);
        assert_eq!(*states.borrow_and_update(), LifecycleState::Running);
        let addr = server.local_addr().unwrap();
        assert_eq!(server.port(), addr.port());
        assert!(server.release().is_err());

        let response = http_get(addr, "/").await;
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains(&format!("127.0.0.1:{}", addr.port())));

        // starting again is a no-op
        server.start(&ServiceDescriptor::defaults()).await.unwrap();
        assert_eq!(server.local_addr(), Some(addr));

        server.stop().await;
        assert_eq!(server.state(), LifecycleState::Stopped);
        assert!(server.local_addr().is_none());
        assert_eq!(server.bus().handler_count("quiz.submit"), 0);

        // and can come back
        server.start(&ServiceDescriptor::defaults()).await.unwrap();
        assert_eq!(server.state(), LifecycleState::Running);
        server.stop().await;
        server.release().unwrap();
    }

    #[tokio::test]
    #[serial]
    async fn test_stop_when_not_running() {
        let server = fresh(0);
        server.stop().await;
        assert_eq!(server.state(), LifecycleState::Created);
        server.stop().await;
        server.release().unwrap();
    }

    #[tokio::test]
    #[serial]
    async fn test_bind_failure_leaves_stopped() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();

        let server = fresh(port);
        let result = server.start(&ServiceDescriptor::defaults()).await;
        match result {
            Err(ServerError::Bind { host, port: p, .. }) => {
                assert_eq!(host, "127.0.0.1");
                assert_eq!(p, port);
            }
            other => panic!("Expected bind error, got {:?}", other),
        }
        assert_eq!(server.state(), LifecycleState::Stopped);
        assert_eq!(server.bus().handler_count("quiz.publish"), 0);
        server.release().unwrap();
    }

    /// Claims routes the defaults already serve
    struct ClashingRoutes {
        fallback: bool,
    }

    impl Service for ClashingRoutes {
        fn name(&self) -> &str {
            "clashing"
        }

        fn deploy(&self, _ctx: &ServiceContext, _deployment: &mut Deployment) -> Result<(), ServerError> {
            Ok(())
        }

        fn routes(&self, _served: &ServedAddress) -> Option<Router> {
            let router = if self.fallback {
                Router::new().fallback(|| async { "mine" })
            } else {
                Router::new().route("/ws", axum::routing::get(|| async { "mine" }))
            };
            Some(router)
        }
    }

    #[tokio::test]
    #[serial]
    async fn test_conflicting_routes_roll_back() {
        let server = fresh(0);

        for fallback in [true, false] {
            let mut services = ServiceDescriptor::defaults();
            services.push(ServiceDescriptor::custom("clashing", move |_config: &ServerConfig| {
                ClashingRoutes { fallback }
            }));

            let result = server.start(&services).await;
            match result {
                Err(ServerError::Deploy { service, .. }) => assert_eq!(service, "clashing"),
                other => panic!("Expected deploy error, got {:?}", other),
            }
            assert_eq!(server.state(), LifecycleState::Stopped);
            assert!(server.local_addr().is_none());
            assert_eq!(server.bus().handler_count("quiz.submit"), 0);
        }

        // nothing is left half-started
        server.start(&ServiceDescriptor::defaults()).await.unwrap();
        assert_eq!(server.state(), LifecycleState::Running);
        server.stop().await;
        assert_eq!(server.state(), LifecycleState::Stopped);
        server.release().unwrap();
    }

    #[tokio::test]
    #[serial]
    async fn test_failed_deploy_rolls_back() {
        let server = fresh(0);
        let services = vec![
            ServiceDescriptor::quiz(),
            ServiceDescriptor::web_content_from(crate::services::AssetSource::Directory(
                "/definitely/not/here".into(),
            )),
        ];
        let result = server.start(&services).await;
        assert!(matches!(result, Err(ServerError::Deploy { .. })));
        assert_eq!(server.state(), LifecycleState::Stopped);
        assert_eq!(server.bus().handler_count("quiz.publish"), 0);
        server.release().unwrap();
    }
}
