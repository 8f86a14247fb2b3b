//! # HTTP Surface
//!
//! Axum router exposing the health registry, and a server handle that shuts down
//! gracefully when stopped.

pub mod handlers;
pub mod state;

use axum::routing::get;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::HttpConfig;
use crate::error::{Result, ServerError};
use crate::health::HealthRegistry;

pub use state::AppState;

pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/_health", get(handlers::health::health))
        .route("/_ready", get(handlers::health::ready))
        .with_state(state)
}

/// Running HTTP server
pub struct HttpServer {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    shutdown_timeout: Duration,
    handle: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl HttpServer {
    /// Bind and start serving in the background
    pub async fn bind(config: &HttpConfig, health: Arc<HealthRegistry>) -> Result<Self> {
        let bind_address = config.bind_address();
        let listener = tokio::net::TcpListener::bind(&bind_address)
            .await
            .map_err(|e| ServerError::Startup(format!("Failed to bind to {bind_address}: {e}")))?;
        let local_addr = listener.local_addr()?;

        let cancel = CancellationToken::new();
        let shutdown = cancel.clone();
        let app = create_app(AppState::new(health));

        let handle = tokio::spawn(async move {
            let server = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await });
            if let Err(e) = server.await {
                error!(error = %e, "❌ HTTP: Server error");
            }
        });

        info!(address = %local_addr, "🚀 HTTP: Serving /_health and /_ready");
        Ok(Self {
            local_addr,
            cancel,
            shutdown_timeout: Duration::from_millis(config.shutdown_timeout_ms),
            handle: tokio::sync::Mutex::new(Some(handle)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting connections and wait for in-flight requests
    pub async fn stop(&self) {
        self.cancel.cancel();
        let Some(handle) = self.handle.lock().await.take() else {
            return;
        };
        match tokio::time::timeout(self.shutdown_timeout, handle).await {
            Ok(_) => info!("✅ HTTP: Server stopped"),
            Err(_) => warn!(
                timeout_ms = self.shutdown_timeout.as_millis() as u64,
                "⚠️ HTTP: Graceful shutdown timed out"
            ),
        }
    }
}
