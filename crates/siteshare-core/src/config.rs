//! Session configuration.

use std::path::PathBuf;

use crate::tunnel::TunnelConfig;

/// Default port for the local static server.
pub const DEFAULT_PORT: u16 = 8000;

/// Default directory served when none is given.
pub const DEFAULT_ROOT: &str = "./public";

/// Environment variable consulted for the tunnel auth token when it is not
/// passed explicitly.
pub const AUTH_TOKEN_ENV: &str = "NGROK_AUTHTOKEN";

/// Configuration for one exposure session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Directory served read-only by the local server. Relative paths are
    /// resolved by the caller's working directory.
    pub root_dir: PathBuf,

    /// Local TCP port the server binds and the tunnel forwards to.
    pub port: u16,

    /// Tunnel auth token. When `None`, [`AUTH_TOKEN_ENV`] is consulted at
    /// connect time.
    pub auth_token: Option<String>,

    /// Tunnel agent settings.
    pub tunnel: TunnelConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new(DEFAULT_ROOT, DEFAULT_PORT)
    }
}

impl SessionConfig {
    /// Create a config for the given serve root and port.
    pub fn new(root_dir: impl Into<PathBuf>, port: u16) -> Self {
        Self {
            root_dir: root_dir.into(),
            port,
            auth_token: None,
            tunnel: TunnelConfig::default(),
        }
    }

    /// Set an explicit tunnel auth token.
    #[must_use]
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    /// Resolve the auth token: explicit value wins, otherwise fall back to
    /// the [`AUTH_TOKEN_ENV`] environment variable.
    pub fn resolve_auth_token(&self) -> Option<String> {
        resolve_token(self.auth_token.as_deref(), std::env::var(AUTH_TOKEN_ENV).ok())
    }
}

/// Pure resolution step, split out so the precedence is testable without
/// touching process-wide environment state.
fn resolve_token(explicit: Option<&str>, from_env: Option<String>) -> Option<String> {
    match explicit {
        Some(token) => Some(token.to_string()),
        None => from_env,
    }
}
