//! Relay server: websocket sessions plus the auxiliary HTTP endpoints, all
//! on one listener.

mod error;
mod handlers;
mod state;
mod ws;

pub use error::ErrorBody;
pub use state::AppState;

use std::future::Future;
use std::net::SocketAddr;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::http::{HeaderValue, Method, header};
use axum::routing::{get, post};
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::{Config, Credentials};
use crate::error::{CoreResult, RelayError};

pub(crate) const TRACING_TARGET: &str = "chatrelay_core::server";

/// Largest HTTP request body accepted (inline OCR images).
pub const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

pub struct RelayServer {
    addr: SocketAddr,
    app: Router,
}

impl RelayServer {
    /// Build the server from configuration; nothing is bound yet.
    pub fn new(cfg: &Config, creds: Credentials) -> CoreResult<Self> {
        let state = AppState::from_config(cfg, creds)?;
        let app = router(state, cfg.server.allowed_origin.as_deref())?;
        Ok(Self {
            addr: SocketAddr::from(([0, 0, 0, 0], cfg.server.port)),
            app,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn router(&self) -> Router {
        self.app.clone()
    }

    /// Bind the configured address and serve until `shutdown` resolves.
    pub async fn run<F>(self, shutdown: F) -> CoreResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener until `shutdown` resolves.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> CoreResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let local = listener.local_addr()?;
        tracing::info!(target: TRACING_TARGET, addr = %local, "relay listening");
        axum::serve(listener, self.app)
            .with_graceful_shutdown(shutdown)
            .await?;
        tracing::info!(target: TRACING_TARGET, "relay stopped");
        Ok(())
    }
}

/// Create the router with all routes and middleware.
pub fn router(state: AppState, allowed_origin: Option<&str>) -> CoreResult<Router> {
    Ok(Router::new()
        .route("/", get(ws::upgrade))
        .route("/ws", get(ws::upgrade))
        .route("/health", get(handlers::health))
        .route("/api/generate/submit", post(handlers::submit))
        .route("/api/generate/result/{task_id}", get(handlers::result))
        .route("/api/ocr", post(handlers::ocr))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(cors_layer(allowed_origin)?)
        .layer(TraceLayer::new_for_http())
        .with_state(state))
}

fn cors_layer(allowed_origin: Option<&str>) -> CoreResult<CorsLayer> {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT]);
    Ok(match allowed_origin {
        Some(origin) => {
            let value = HeaderValue::from_str(origin)
                .map_err(|e| RelayError::Config(format!("ALLOWED_ORIGIN '{origin}': {e}")))?;
            cors.allow_origin(AllowOrigin::list([value]))
        }
        None => cors.allow_origin(Any),
    })
}
