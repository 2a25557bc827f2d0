//! siteshare CLI
//!
//! `siteshare up` serves a directory locally and exposes it through the
//! tunnel agent; `siteshare reset`/`stop` clean up stray servers and agents
//! left behind by abandoned runs.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use siteshare_core::config::{AUTH_TOKEN_ENV, DEFAULT_PORT, DEFAULT_ROOT};
use siteshare_core::reconcile::{self, ReconcileReport};
use siteshare_core::tracing_init::init_tracing;
use siteshare_core::{ExposureSession, SessionConfig, Tunnel, TunnelConfig};

#[derive(Parser, Debug)]
#[command(name = "siteshare")]
#[command(version, about = "Serve a local directory and expose it through a tunnel")]
struct Cli {
    /// Emit structured JSON log lines instead of human-readable output
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Reset the environment, start the server and tunnel, and block until
    /// Ctrl-C.
    Up {
        /// Directory to serve
        #[arg(long, default_value = DEFAULT_ROOT, env = "SITESHARE_ROOT")]
        root: PathBuf,

        /// Local port to bind
        #[arg(long, default_value_t = DEFAULT_PORT, env = "SITESHARE_PORT")]
        port: u16,

        /// Tunnel auth token (falls back to the agent's env var)
        #[arg(long, env = AUTH_TOKEN_ENV, hide_env_values = true)]
        token: Option<String>,

        /// Skip the reconciliation pass before starting
        #[arg(long)]
        no_reset: bool,
    },

    /// Terminate stray servers on the port and stray tunnel agents.
    Reset {
        /// Local port to clear
        #[arg(long, default_value_t = DEFAULT_PORT, env = "SITESHARE_PORT")]
        port: u16,
    },

    /// Alias for `reset`: stop whatever a previous run left behind.
    Stop {
        /// Local port to clear
        #[arg(long, default_value_t = DEFAULT_PORT, env = "SITESHARE_PORT")]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing("siteshare=info", cli.log_json);

    match cli.command {
        Command::Up {
            root,
            port,
            token,
            no_reset,
        } => run_up(root, port, token, no_reset).await,
        Command::Reset { port } | Command::Stop { port } => run_reset(port).await,
    }
}

async fn run_up(root: PathBuf, port: u16, token: Option<String>, no_reset: bool) -> Result<()> {
    let mut config = SessionConfig::new(root, port);
    if let Some(token) = token {
        config = config.with_auth_token(token);
    }

    let mut session = ExposureSession::new(config);

    if no_reset {
        info!("skipping reconciliation (--no-reset)");
    } else {
        let report = session.reset().await;
        print_report(&report);
    }

    let public_url = session
        .start()
        .await
        .context("failed to start exposure session")?;

    print_live(&session, &public_url);

    tokio::signal::ctrl_c()
        .await
        .context("failed to wait for Ctrl-C")?;
    info!("interrupt received; shutting down");
    session.stop().await;
    Ok(())
}

async fn run_reset(port: u16) -> Result<()> {
    Tunnel::disconnect_all(&TunnelConfig::default()).await;
    let report = reconcile::reconcile(port, std::process::id());
    print_report(&report);
    Ok(())
}

#[allow(clippy::print_stdout)]
fn print_live(session: &ExposureSession, public_url: &str) {
    println!(
        "Serving {} at {}",
        session.config().root_dir.display(),
        session.local_url().unwrap_or_default()
    );
    println!("Public URL: {public_url}");
    println!("Press Ctrl-C to stop.");
}

#[allow(clippy::print_stdout)]
fn print_report(report: &ReconcileReport) {
    if report.found_strays() {
        println!(
            "Reset: terminated {} stray process(es) (port {}, {} agent match(es))",
            report.killed.len(),
            report.port,
            report.agent_pids.len()
        );
    } else {
        println!("Reset: port {} already clear", report.port);
    }
    for err in &report.errors {
        println!("  note: {err}");
    }
}
