//! Exposure session: one local server plus one tunnel, managed as a unit.
//!
//! The session is an owned value, not process-wide state: tests and
//! embedders create as many as they want, and `&mut self` on every
//! operation makes concurrent invocation a compile error rather than a
//! documented race.

use tracing::{info, warn};

use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::reconcile::{self, ReconcileReport};
use crate::server::ServerHandle;
use crate::tunnel::Tunnel;

/// Lifecycle state of an [`ExposureSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No server, no tunnel.
    Idle,
    /// Server spawn / tunnel connect in progress.
    Starting,
    /// Server and tunnel both active.
    Live,
    /// Teardown in progress.
    Stopping,
}

/// One local static server exposed through one tunnel.
///
/// Invariants: at most one `{server, tunnel}` pair alive at a time; if a
/// server handle is present it is bound to the session's port, and the
/// tunnel (if present) forwards to that same port. Nothing here survives a
/// process restart, which is why [`ExposureSession::reset`] works through
/// OS introspection rather than the in-memory handles.
#[derive(Debug)]
pub struct ExposureSession {
    config: SessionConfig,
    state: SessionState,
    server: Option<ServerHandle>,
    tunnel: Option<Tunnel>,
}

impl ExposureSession {
    /// Create an idle session around the given config.
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            state: SessionState::Idle,
            server: None,
            tunnel: None,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Local URL of the server while the session is live.
    pub fn local_url(&self) -> Option<String> {
        self.server.as_ref().map(ServerHandle::local_url)
    }

    /// Public URL of the tunnel while the session is live.
    pub fn public_url(&self) -> Option<&str> {
        self.tunnel.as_ref().map(Tunnel::public_url)
    }

    /// Spawn the server, connect the tunnel, and return the public URL.
    ///
    /// Only valid from `Idle`; a second `start` without an intervening
    /// `stop`/`reset` is rejected before any bind attempt. If the tunnel
    /// step fails, the freshly spawned server is shut down again so a
    /// failed start never leaks a bound listener.
    pub async fn start(&mut self) -> Result<String> {
        if self.state != SessionState::Idle {
            return Err(Error::AlreadyRunning);
        }
        if self.config.port == 0 {
            return Err(Error::InvalidPort(0));
        }
        self.state = SessionState::Starting;

        let mut server = match ServerHandle::spawn(&self.config.root_dir, self.config.port).await {
            Ok(server) => server,
            Err(e) => {
                self.state = SessionState::Idle;
                return Err(e);
            }
        };

        // The listener is already accepting by the time spawn returns, so
        // the tunnel can forward immediately.
        let token = self.config.resolve_auth_token();
        match Tunnel::connect(server.port(), token.as_deref(), &self.config.tunnel).await {
            Ok(tunnel) => {
                let public_url = tunnel.public_url().to_string();
                info!(
                    public_url = %public_url,
                    local_url = %server.local_url(),
                    root = %self.config.root_dir.display(),
                    "session live"
                );
                self.server = Some(server);
                self.tunnel = Some(tunnel);
                self.state = SessionState::Live;
                Ok(public_url)
            }
            Err(e) => {
                warn!(error = %e, "tunnel connect failed; rolling back server");
                server.shutdown().await;
                self.state = SessionState::Idle;
                Err(e.into())
            }
        }
    }

    /// Disconnect the tunnel and shut down the server. Idempotent: partial
    /// or absent state is torn down as far as it exists, teardown failures
    /// are logged and never raised.
    pub async fn stop(&mut self) {
        if self.server.is_none() && self.tunnel.is_none() {
            self.state = SessionState::Idle;
            return;
        }
        self.state = SessionState::Stopping;

        if let Some(mut tunnel) = self.tunnel.take() {
            tunnel.disconnect().await;
        }
        if let Some(mut server) = self.server.take() {
            server.shutdown().await;
        }

        self.state = SessionState::Idle;
        info!(port = self.config.port, "session stopped");
    }

    /// Force the environment back to a clean slate, regardless of what this
    /// process believes it owns. Callable from any state.
    ///
    /// Graceful teardown of our own handles first, then OS-level work:
    /// close every tunnel the agent runtime knows about, free the target
    /// port, and sweep stray agent processes. The returned report carries
    /// the per-step outcomes; reconciliation itself never fails.
    pub async fn reset(&mut self) -> ReconcileReport {
        info!(port = self.config.port, "resetting environment");
        self.stop().await;

        Tunnel::disconnect_all(&self.config.tunnel).await;
        let report = reconcile::reconcile(self.config.port, std::process::id());

        self.state = SessionState::Idle;
        info!(
            port = self.config.port,
            clean = report.is_clean(),
            "reset complete"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::TunnelConfig;
    use std::time::Duration;

    fn test_config(root: &std::path::Path, port: u16) -> SessionConfig {
        let mut config = SessionConfig::new(root, port);
        // An agent binary that cannot exist: tunnel connects fail fast.
        config.tunnel = TunnelConfig {
            agent_bin: "/definitely/not/a/real/siteshare-test-agent".into(),
            ready_timeout: Duration::from_millis(200),
            ..TunnelConfig::default()
        };
        config
    }

    #[tokio::test]
    async fn stop_when_idle_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = ExposureSession::new(test_config(dir.path(), 0));
        assert_eq!(session.state(), SessionState::Idle);
        session.stop().await;
        session.stop().await;
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn start_rejected_unless_idle() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = ExposureSession {
            config: test_config(dir.path(), 0),
            state: SessionState::Live,
            server: None,
            tunnel: None,
        };
        let err = session.start().await.unwrap_err();
        assert!(matches!(err, Error::AlreadyRunning));
    }

    #[tokio::test]
    async fn start_with_missing_root_leaves_idle() {
        let mut session = ExposureSession::new(test_config(
            std::path::Path::new("/definitely/not/a/real/dir"),
            0,
        ));
        // Port 0 is rejected for real sessions; give it a plausible port
        // so the root check is what fires.
        session.config.port = 18371;
        let err = session.start().await.unwrap_err();
        assert!(matches!(err, Error::RootMissing(_)));
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn start_with_port_zero_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = ExposureSession::new(test_config(dir.path(), 0));
        let err = session.start().await.unwrap_err();
        assert!(matches!(err, Error::InvalidPort(0)));
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn tunnel_failure_rolls_back_the_server() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "x").unwrap();

        // Grab an ephemeral port the OS considers free right now.
        let port = {
            let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            probe.local_addr().unwrap().port()
        };

        let mut session = ExposureSession::new(test_config(dir.path(), port));
        let err = session.start().await.unwrap_err();
        assert!(matches!(err, Error::Tunnel(_)));
        assert_eq!(session.state(), SessionState::Idle);
        assert!(session.local_url().is_none());

        // The rollback released the port: a second start gets through the
        // bind again (and fails at the same tunnel step, not with
        // AlreadyRunning or a bind error).
        let err = session.start().await.unwrap_err();
        assert!(matches!(err, Error::Tunnel(_)));
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn reset_is_idempotent_with_nothing_started() {
        let dir = tempfile::tempdir().unwrap();
        let port = {
            let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            probe.local_addr().unwrap().port()
        };
        let mut session = ExposureSession::new(test_config(dir.path(), port));

        let first = session.reset().await;
        let second = session.reset().await;
        assert!(first.killed.is_empty());
        assert!(second.killed.is_empty());
        assert_eq!(session.state(), SessionState::Idle);

        // Port is demonstrably free afterwards.
        let listener = std::net::TcpListener::bind(("127.0.0.1", port));
        assert!(listener.is_ok());
    }
}
