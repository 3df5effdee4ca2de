//! prforge web server and REST API.
//!
//! Provides an Axum-based HTTP server with:
//! - Health and status endpoints
//! - Repository, collaborator and branch protection management
//! - Pull request lifecycle, divergence and head-branch update
//! - File contents read/write
//! - Audit log API
//! - Bearer token authentication

pub mod api;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::DefaultBodyLimit;
use axum::http::{header, Method};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use prforge_core::Forge;

/// Shared application state accessible from all handlers.
pub struct AppState {
    pub forge: Forge,
    pub started_at: Instant,
}

/// The web server.
pub struct WebServer {
    state: Arc<AppState>,
}

impl WebServer {
    pub fn new(forge: Forge) -> Self {
        let state = Arc::new(AppState {
            forge,
            started_at: Instant::now(),
        });
        Self { state }
    }

    /// The fully layered router; exposed for in-process tests.
    pub fn router(&self) -> Router {
        build_router(self.state.clone())
    }

    /// Serve on `listen_addr` until `shutdown` resolves, then drain
    /// in-flight requests.
    pub async fn start<F>(self, listen_addr: &str, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr: SocketAddr = listen_addr.parse()?;
        let app = self.router();

        info!(addr = %addr, "starting web server");

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await?;

        info!("web server stopped");
        Ok(())
    }
}

fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
        ])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);
    let max_body = state.forge.config.web.max_body_bytes;

    Router::new()
        .merge(api::status::routes())
        .merge(api::auth::routes())
        .merge(api::repos::routes())
        .merge(api::pulls::routes())
        .merge(api::contents::routes())
        .merge(api::audit::routes())
        // Middleware
        .layer(DefaultBodyLimit::max(max_body))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
