//! Error types for the siteshare core library.

use std::path::PathBuf;

use thiserror::Error;

use crate::tunnel::TunnelError;

/// Result type alias using the siteshare core [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for siteshare operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A session is already live; `start` is only valid from the idle state.
    #[error("a session is already running; call stop() or reset() first")]
    AlreadyRunning,

    /// The serve root does not exist or is not a directory.
    #[error("serve root {0} does not exist or is not a directory")]
    RootMissing(PathBuf),

    /// Port 0 is not a valid target port for a session.
    #[error("invalid port {0} (expected 1-65535)")]
    InvalidPort(u16),

    /// The local listener could not be bound. The port is most likely held
    /// by a stray process from a previous run; `reset` clears those.
    #[error("failed to bind port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    /// Tunnel agent error
    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
