//! Status server using Axum
//!
//! - `GET /_status`: health document, HTTP 500 once unhealthy
//! - `GET /metrics`: Prometheus text from the in-memory registry
//!
//! Plain HTTP only. Requests are traced through `tower-http`.

pub mod handlers;

pub use handlers::ApiState;

use std::net::SocketAddr;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Failed to bind status server to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Status server error: {0}")]
    Serve(#[source] std::io::Error),
}

/// Build the router.
pub fn create_app(state: ApiState) -> Router {
    Router::new()
        .route("/_status", get(handlers::get_status))
        .route("/metrics", get(handlers::get_metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// A running status server.
pub struct StatusServer {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    task: Option<JoinHandle<Result<(), ServerError>>>,
}

impl StatusServer {
    /// Bind `addr` and start serving `app` in the background.
    pub async fn start(addr: &str, app: Router) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr).await.map_err(|source| ServerError::Bind {
            addr: addr.to_string(),
            source,
        })?;
        let local_addr = listener.local_addr().map_err(|source| ServerError::Bind {
            addr: addr.to_string(),
            source,
        })?;

        let cancel = CancellationToken::new();
        let shutdown = cancel.clone();
        let task = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    shutdown.cancelled().await;
                    info!("[StatusServer] Received shutdown signal");
                })
                .await
                .map_err(ServerError::Serve)
        });

        info!(address = %local_addr, "[StatusServer] Listening");
        Ok(Self {
            local_addr,
            cancel,
            task: Some(task),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Resolves when the server stops on its own, describing why.
    /// Never resolves while the server is healthy.
    pub async fn exited(&mut self) -> String {
        let Some(task) = self.task.as_mut() else {
            return std::future::pending().await;
        };
        let reason = match task.await {
            Ok(Ok(())) => "Status server exited unexpectedly".to_string(),
            Ok(Err(e)) => e.to_string(),
            Err(e) => format!("Status server task failed: {e}"),
        };
        self.task = None;
        reason
    }

    /// Graceful stop bounded by `grace`, then the task is aborted.
    pub async fn stop(mut self, grace: Duration) {
        self.cancel.cancel();
        let Some(mut task) = self.task.take() else {
            return;
        };
        match tokio::time::timeout(grace, &mut task).await {
            Ok(Ok(Ok(()))) => info!("[StatusServer] Graceful shutdown complete"),
            Ok(Ok(Err(e))) => error!(error = %e, "[StatusServer] Server error during shutdown"),
            Ok(Err(e)) => error!(error = %e, "[StatusServer] Task failed during shutdown"),
            Err(_) => {
                warn!(
                    grace_secs = grace.as_secs(),
                    "[StatusServer] Shutdown grace exceeded, aborting"
                );
                task.abort();
            }
        }
    }
}
