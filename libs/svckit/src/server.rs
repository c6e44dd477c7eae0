//! The foreground server seam and its axum implementation.

use std::net::SocketAddr;

use anyhow::Context;
use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::lifecycle::LifecycleState;

/// Network-serving loop run in the foreground of [`crate::ServiceLifecycle::start`].
#[async_trait]
pub trait ForegroundServer: Send {
    /// Reserve the listening socket. Returns the bound address, which may
    /// differ from the requested one when `port` is 0.
    async fn bind(&mut self, host: &str, port: u16) -> anyhow::Result<SocketAddr>;

    /// Serve until `shutdown` is cancelled, then release every resource
    /// before returning.
    async fn serve(self: Box<Self>, shutdown: CancellationToken) -> anyhow::Result<()>;
}

/// [`ForegroundServer`] serving an axum [`Router`].
pub struct AxumServer {
    router: Router,
    listener: Option<TcpListener>,
}

impl AxumServer {
    #[must_use]
    pub fn new(router: Router) -> Self {
        Self {
            router,
            listener: None,
        }
    }
}

#[async_trait]
impl ForegroundServer for AxumServer {
    async fn bind(&mut self, host: &str, port: u16) -> anyhow::Result<SocketAddr> {
        let listener = TcpListener::bind((host, port))
            .await
            .with_context(|| format!("failed to bind {host}:{port}"))?;
        let addr = listener.local_addr()?;
        tracing::info!(%addr, "HTTP server bound");
        self.listener = Some(listener);
        Ok(addr)
    }

    async fn serve(self: Box<Self>, shutdown: CancellationToken) -> anyhow::Result<()> {
        let Self { router, listener } = *self;
        let listener = listener.context("serve called before bind")?;

        let shutdown = async move {
            shutdown.cancelled().await;
            tracing::info!("HTTP server shutting down gracefully");
        };
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await
            .context("HTTP server failed")
    }
}

/// `GET {path}`: 200 while the lifecycle is running, 503 otherwise.
#[must_use]
pub fn health_router(path: &str, state: watch::Receiver<LifecycleState>) -> Router {
    Router::new()
        .route(path, get(health))
        .with_state(state)
}

async fn health(
    State(state): State<watch::Receiver<LifecycleState>>,
) -> (StatusCode, Json<serde_json::Value>) {
    let current = *state.borrow();
    let code = if current == LifecycleState::Running {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(serde_json::json!({ "status": current })))
}
