//! siteshare Core Library
//!
//! Shared functionality for siteshare components:
//! - Exposure session lifecycle (start / stop / reset)
//! - Local static file server handle
//! - Tunnel agent driver (ngrok local web API)
//! - OS-level port and process reconciliation
//! - Common error types

pub mod config;
pub mod error;
pub mod reconcile;
pub mod server;
pub mod session;
pub mod tracing_init;
pub mod tunnel;

pub use config::SessionConfig;
pub use error::{Error, Result};
pub use reconcile::ReconcileReport;
pub use server::ServerHandle;
pub use session::{ExposureSession, SessionState};
pub use tunnel::{Tunnel, TunnelConfig};
