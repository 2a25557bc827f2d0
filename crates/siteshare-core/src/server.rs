//! Local static file server.
//!
//! Thin wrapper over axum + `ServeDir`: bind first, serve on a background
//! task, shut down through a oneshot signal. Binding happens synchronously
//! inside [`ServerHandle::spawn`], so when it returns the listener is
//! already accepting connections and the tunnel can forward to it without
//! any sleep-and-hope delay.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use axum::Router;
use tokio::net::TcpSocket;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::services::ServeDir;
use tracing::{error, info, warn};

use crate::error::{Error, Result};

/// Bounded wait for the serve task to finish after the shutdown signal.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(3);

/// Handle owning one running static file server.
///
/// Dropping the handle signals shutdown as well, though without the bounded
/// wait; call [`ServerHandle::shutdown`] for deterministic teardown.
#[derive(Debug)]
pub struct ServerHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
    port: u16,
    root_dir: PathBuf,
}

impl ServerHandle {
    /// Bind `port` and serve `root_dir` read-only on a background task.
    ///
    /// The listener is created with `SO_REUSEADDR` so a rapid
    /// shutdown-then-spawn cycle on the same port does not fail with
    /// "address in use". Port 0 asks the OS for an ephemeral port; the
    /// actually bound port is available via [`ServerHandle::port`].
    ///
    /// Fails immediately if `root_dir` is not a directory or the port is
    /// held by another process. Callers are expected to reconcile first;
    /// there is no retry and no automatic port reassignment.
    pub async fn spawn(root_dir: impl Into<PathBuf>, port: u16) -> Result<Self> {
        let root_dir = root_dir.into();
        if !root_dir.is_dir() {
            return Err(Error::RootMissing(root_dir));
        }

        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let socket = TcpSocket::new_v4()?;
        socket.set_reuseaddr(true)?;
        socket
            .bind(addr)
            .map_err(|source| Error::Bind { port, source })?;
        let listener = socket
            .listen(1024)
            .map_err(|source| Error::Bind { port, source })?;
        let port = listener.local_addr()?.port();

        let app = Router::new().fallback_service(ServeDir::new(&root_dir));
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async {
                // Err means the handle was dropped without an explicit
                // shutdown; treat that as the signal too.
                let _ = shutdown_rx.await;
            });
            if let Err(e) = serve.await {
                error!(error = %e, "static server terminated with error");
            }
        });

        info!(
            root = %root_dir.display(),
            port,
            "static server listening"
        );

        Ok(Self {
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
            port,
            root_dir,
        })
    }

    /// The port the listener is bound to.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The directory being served.
    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    /// Local URL of the server.
    pub fn local_url(&self) -> String {
        format!("http://localhost:{}", self.port)
    }

    /// Stop accepting connections and wait (bounded) for the serve task to
    /// release the port. Safe to call on an already-stopped handle.
    pub async fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, task).await {
                Ok(_) => info!(port = self.port, "static server stopped"),
                Err(_) => warn!(
                    port = self.port,
                    "static server did not stop within {SHUTDOWN_TIMEOUT:?}; detaching"
                ),
            }
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}
