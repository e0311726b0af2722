//! Protocol services deployed onto the event bus
//!
//! A [`ServiceDescriptor`] names a service and knows how to build a fresh
//! instance of it; the server instantiates every requested descriptor on
//! `start` and tears the instances down again on `stop`.

mod chat;
mod content;
mod quiz;

pub use chat::{AttendeeChatService, PresenterChatService};
pub use content::{content_type_for, Asset, AssetSource, WebContentService};
pub use quiz::{CloseQuiz, QuizService, SubmitAnswers};

use crate::bus::{BusHandler, EventBus, HandlerId};
use crate::config::ServerConfig;
use crate::error::{ProtocolError, ServerError};
use crate::sessions::SessionRegistry;
use axum::Router;
use serde_json::{json, Value};
use std::sync::Arc;

/// Shared components a service can reach while deployed
#[derive(Debug, Clone)]
pub struct ServiceContext {
    pub bus: EventBus,
    pub sessions: SessionRegistry,
    pub config: Arc<ServerConfig>,
}

/// Where the server ended up listening, for services that render it into
/// the pages they serve
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServedAddress {
    pub host: String,
    pub port: u16,
}

pub trait Service: Send + Sync {
    fn name(&self) -> &str;

    /// Register bus handlers. Everything registered through `deployment`
    /// is removed again on undeploy.
    fn deploy(&self, ctx: &ServiceContext, deployment: &mut Deployment)
        -> Result<(), ServerError>;

    /// HTTP routes merged into the server's router once the listener is
    /// bound. At most one deployed service may install a fallback.
    fn routes(&self, _served: &ServedAddress) -> Option<Router> {
        None
    }

    /// Release service state after its handlers are gone
    fn undeploy(&self) {}
}

/// Bus registrations made by one service
#[derive(Debug)]
pub struct Deployment {
    service: String,
    bus: EventBus,
    handlers: Vec<(String, HandlerId)>,
}

impl Deployment {
    pub(crate) fn new(service: impl Into<String>, bus: EventBus) -> Self {
        Self {
            service: service.into(),
            bus,
            handlers: Vec::new(),
        }
    }

    pub fn register(
        &mut self,
        address: &str,
        handler: Arc<dyn BusHandler>,
    ) -> Result<&mut Self, ServerError> {
        let id = self.bus.register_handler(address, handler)?;
        self.handlers.push((address.to_string(), id));
        Ok(self)
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn addresses(&self) -> Vec<&str> {
        self.handlers.iter().map(|(a, _)| a.as_str()).collect()
    }

    /// Unregister in reverse registration order
    pub(crate) fn undeploy(mut self) {
        while let Some((address, id)) = self.handlers.pop() {
            self.bus.unregister_handler(&address, id);
        }
        tracing::info!("Service {} undeployed", self.service);
    }
}

type ServiceFactory = dyn Fn(&ServerConfig) -> Box<dyn Service> + Send + Sync;

/// A named recipe for a service
#[derive(Clone)]
pub struct ServiceDescriptor {
    name: String,
    factory: Arc<ServiceFactory>,
}

impl std::fmt::Debug for ServiceDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceDescriptor")
            .field("name", &self.name)
            .finish()
    }
}

impl ServiceDescriptor {
    /// Any service, e.g. a third-party broadcast such as a social feed
    pub fn custom<F, S>(name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&ServerConfig) -> S + Send + Sync + 'static,
        S: Service + 'static,
    {
        Self {
            name: name.into(),
            factory: Arc::new(move |config: &ServerConfig| {
                Box::new(factory(config)) as Box<dyn Service>
            }),
        }
    }

    /// Static browser client, from the configured directory or the
    /// embedded bundle
    pub fn web_content() -> Self {
        Self::custom("web-content", |config: &ServerConfig| {
            WebContentService::new(AssetSource::from_config(config))
        })
    }

    pub fn web_content_from(source: AssetSource) -> Self {
        Self::custom("web-content", move |_config: &ServerConfig| {
            WebContentService::new(source.clone())
        })
    }

    pub fn attendee_chat() -> Self {
        Self::custom("attendee-chat", |_config: &ServerConfig| {
            AttendeeChatService::new()
        })
    }

    pub fn presenter_chat() -> Self {
        Self::custom("presenter-chat", |_config: &ServerConfig| {
            PresenterChatService::new()
        })
    }

    pub fn quiz() -> Self {
        Self::custom("quiz", |_config: &ServerConfig| QuizService::new())
    }

    /// The fixed set the desktop host starts with
    pub fn defaults() -> Vec<Self> {
        vec![
            Self::web_content(),
            Self::attendee_chat(),
            Self::presenter_chat(),
            Self::quiz(),
        ]
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn instantiate(&self, config: &ServerConfig) -> Box<dyn Service> {
        (self.factory)(config)
    }
}

/// Parse a bus message body into a typed request
pub(crate) fn parse_body<T: serde::de::DeserializeOwned>(body: &Value) -> Result<T, ProtocolError> {
    serde_json::from_value(body.clone()).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

/// Reply payload for a rejected request
pub(crate) fn error_reply(err: &ProtocolError) -> Value {
    json!({
        "error": {
            "code": err.code(),
            "msg": err.to_string(),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{handler_fn, Envelope};

    #[tokio::test]
    async fn test_deployment_undeploys_everything() {
        let bus = EventBus::new();
        let mut deployment = Deployment::new("test", bus.clone());
        deployment
            .register("a.one", handler_fn(|_envelope: Envelope| async {}))
            .unwrap()
            .register("a.two", handler_fn(|_envelope: Envelope| async {}))
            .unwrap();

        assert_eq!(deployment.addresses(), vec!["a.one", "a.two"]);
        assert_eq!(bus.handler_count("a.one"), 1);

        deployment.undeploy();
        assert_eq!(bus.handler_count("a.one"), 0);
        assert_eq!(bus.handler_count("a.two"), 0);
    }

    #[test]
    fn test_default_descriptors() {
        let names: Vec<String> = ServiceDescriptor::defaults()
            .iter()
            .map(|d| d.name().to_string())
            .collect();
        assert_eq!(
            names,
            vec!["web-content", "attendee-chat", "presenter-chat", "quiz"]
        );
    }

    #[test]
    fn test_error_reply_shape() {
        let reply = error_reply(&ProtocolError::NotActive(7));
        assert_eq!(reply["error"]["code"], "NOT_ACTIVE");
    }
}
