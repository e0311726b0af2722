//! Static browser client
//!
//! Serves the attendee web app, either from a directory on disk or from an
//! embedded bundle. Embedded text assets may contain `{{server_host}}` and
//! `{{server_port}}` placeholders which are filled in with the address the
//! server is actually listening on.

use super::{Deployment, ServedAddress, Service, ServiceContext};
use crate::config::ServerConfig;
use crate::error::ServerError;
use axum::{
    extract::State,
    http::{header, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use std::borrow::Cow;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::services::ServeDir;

const EMBEDDED_INDEX: &str = include_str!("../../static/index.html");

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Asset {
    pub content_type: &'static str,
    pub bytes: Cow<'static, [u8]>,
}

impl Asset {
    pub fn new(path: &str, bytes: impl Into<Cow<'static, [u8]>>) -> Self {
        Self {
            content_type: content_type_for(path),
            bytes: bytes.into(),
        }
    }

    fn is_text(&self) -> bool {
        self.content_type.starts_with("text/") || self.content_type == "application/javascript"
    }
}

/// Where the browser client comes from
#[derive(Debug, Clone)]
pub enum AssetSource {
    Directory(PathBuf),
    Embedded(Arc<HashMap<String, Asset>>),
}

impl AssetSource {
    /// The client bundled into the binary
    pub fn embedded_client() -> Self {
        let mut assets = HashMap::new();
        assets.insert(
            "index.html".to_string(),
            Asset::new("index.html", EMBEDDED_INDEX.as_bytes()),
        );
        AssetSource::Embedded(Arc::new(assets))
    }

    pub fn embedded<I, S>(assets: I) -> Self
    where
        I: IntoIterator<Item = (S, Asset)>,
        S: Into<String>,
    {
        AssetSource::Embedded(Arc::new(
            assets.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        ))
    }

    pub fn from_config(config: &ServerConfig) -> Self {
        match &config.static_dir {
            Some(dir) => AssetSource::Directory(dir.clone()),
            None => Self::embedded_client(),
        }
    }
}

/// Content type for an embedded asset, guessed the same way `ServeDir`
/// guesses it for files on disk
pub fn content_type_for(path: &str) -> &'static str {
    mime_guess::from_path(path)
        .first_raw()
        .unwrap_or("application/octet-stream")
}

struct EmbeddedState {
    assets: Arc<HashMap<String, Asset>>,
    served: ServedAddress,
}

async fn serve_embedded(State(state): State<Arc<EmbeddedState>>, uri: Uri) -> Response {
    let path = uri.path().trim_start_matches('/');
    let path = if path.is_empty() { "index.html" } else { path };

    let Some(asset) = state.assets.get(path) else {
        tracing::debug!("No asset at /{}", path);
        return StatusCode::NOT_FOUND.into_response();
    };

    let body: Vec<u8> = if asset.is_text() {
        String::from_utf8_lossy(&asset.bytes)
            .replace("{{server_host}}", &state.served.host)
            .replace("{{server_port}}", &state.served.port.to_string())
            .into_bytes()
    } else {
        asset.bytes.to_vec()
    };

    ([(header::CONTENT_TYPE, asset.content_type)], body).into_response()
}

pub struct WebContentService {
    source: AssetSource,
}

impl WebContentService {
    pub fn new(source: AssetSource) -> Self {
        Self { source }
    }
}

impl Service for WebContentService {
    fn name(&self) -> &str {
        "web-content"
    }

    fn deploy(&self, _ctx: &ServiceContext, _deployment: &mut Deployment) -> Result<(), ServerError> {
        if let AssetSource::Directory(dir) = &self.source {
            if !dir.is_dir() {
                return Err(ServerError::Deploy {
                    service: self.name().to_string(),
                    reason: format!("{} is not a directory", dir.display()),
                });
            }
        }
        Ok(())
    }

    fn routes(&self, served: &ServedAddress) -> Option<Router> {
        let router = match &self.source {
            AssetSource::Directory(dir) => {
                tracing::info!("Serving web client from {}", dir.display());
                Router::new().fallback_service(ServeDir::new(dir))
            }
            AssetSource::Embedded(assets) => {
                let state = Arc::new(EmbeddedState {
                    assets: assets.clone(),
                    served: served.clone(),
                });
                Router::new()
                    .route("/", get(serve_embedded))
                    .fallback(serve_embedded)
                    .with_state(state)
            }
        };
        Some(router)
    }
}
