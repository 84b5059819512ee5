//! The command server a running engine listens on.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{routing::get, Extension, Router};
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio::task::{JoinError, JoinHandle};
use tower::ServiceBuilder;
use tracing::info;

use crate::routes::{self, control::ControlHandle, control::ShutdownSignal};

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind command server on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("command server failed: {0}")]
    Serve(#[from] io::Error),

    #[error("command server task aborted: {0}")]
    Join(#[from] JoinError),
}

/// Build the command router around `engine`. `shutdown` is notified by
/// `GET /stop-command-server`.
pub fn build_app(engine: ControlHandle, shutdown: ShutdownSignal) -> Router {
    Router::new()
        .route("/health", get(routes::system::health))
        .merge(routes::router())
        .layer(
            ServiceBuilder::new()
                .layer(Extension(engine))
                .layer(Extension(shutdown)),
        )
}

/// A running command server.
pub struct CommandServer {
    local_addr: SocketAddr,
    shutdown: Arc<Notify>,
    handle: JoinHandle<io::Result<()>>,
}

impl CommandServer {
    /// Bind `addr` and serve in the background.
    pub async fn bind(addr: SocketAddr, engine: ControlHandle) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;
        let shutdown = Arc::new(Notify::new());
        let app = build_app(engine, ShutdownSignal(shutdown.clone()));

        let signal = shutdown.clone();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { signal.notified().await })
                .await
        });
        info!(addr = %local_addr, "command server listening");

        Ok(Self {
            local_addr,
            shutdown,
            handle,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Ask the server to shut down and wait until it has.
    pub async fn stop(self) -> Result<(), ServerError> {
        self.shutdown.notify_one();
        let result = self.handle.await?;
        info!(addr = %self.local_addr, "command server stopped");
        Ok(result?)
    }
}
