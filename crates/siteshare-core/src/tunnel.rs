//! Tunnel agent driver.
//!
//! Drives the ngrok agent as a child process: spawn `ngrok http <port>`,
//! then poll the agent's local web API until a tunnel with a public URL
//! shows up. Teardown goes through the same API (close every tunnel the
//! agent knows about, not just ours) before stopping the agent process
//! itself.

use std::process::Stdio;
use std::time::Duration;

use serde::Deserialize;
use tokio::process::{Child, Command};
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use crate::config::AUTH_TOKEN_ENV;
use crate::reconcile;

/// Errors from the tunnel agent driver.
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("failed to spawn tunnel agent `{agent}`: {reason}")]
    Spawn { agent: String, reason: String },

    #[error("tunnel agent exited before a tunnel came up ({0})")]
    AgentExited(String),

    #[error("agent API error: {0}")]
    Api(String),

    #[error("no tunnel appeared within {0:?}")]
    ReadyTimeout(Duration),
}

/// Settings for driving the tunnel agent.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Agent binary name or path.
    pub agent_bin: String,

    /// Base URL of the agent's local web API.
    pub api_url: String,

    /// How often to poll the web API while waiting for the tunnel.
    pub ready_poll_interval: Duration,

    /// How long to wait for a tunnel before giving up.
    pub ready_timeout: Duration,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            agent_bin: reconcile::AGENT_PROCESS_NAME.to_string(),
            api_url: "http://127.0.0.1:4040".to_string(),
            ready_poll_interval: Duration::from_millis(250),
            ready_timeout: Duration::from_secs(15),
        }
    }
}

/// One tunnel record as reported by the agent's `/api/tunnels` endpoint.
#[derive(Debug, Clone, Deserialize)]
struct TunnelInfo {
    #[serde(default)]
    uri: String,
    public_url: String,
    #[serde(default)]
    proto: String,
    #[serde(default)]
    config: ForwardConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ForwardConfig {
    #[serde(default)]
    addr: String,
}

#[derive(Debug, Deserialize)]
struct TunnelList {
    tunnels: Vec<TunnelInfo>,
}

/// Handle owning one active tunnel and the agent child process behind it.
#[derive(Debug)]
pub struct Tunnel {
    child: Option<Child>,
    public_url: String,
    local_port: u16,
}

impl Tunnel {
    /// Spawn the agent forwarding to `local_port` and wait for the public
    /// URL. The auth token, when present, is handed to the agent through
    /// its environment before the connection attempt. Failure is explicit;
    /// there is no retry.
    pub async fn connect(
        local_port: u16,
        auth_token: Option<&str>,
        config: &TunnelConfig,
    ) -> Result<Self, TunnelError> {
        let mut cmd = Command::new(&config.agent_bin);
        cmd.arg("http")
            .arg(local_port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if let Some(token) = auth_token {
            cmd.env(AUTH_TOKEN_ENV, token);
        }

        info!(agent = %config.agent_bin, local_port, "spawning tunnel agent");
        let mut child = cmd.spawn().map_err(|e| TunnelError::Spawn {
            agent: config.agent_bin.clone(),
            reason: e.to_string(),
        })?;

        let client = reqwest::Client::new();
        let deadline = Instant::now() + config.ready_timeout;

        loop {
            // A quick death usually means a bad token or quota problem;
            // surface it instead of polling into the timeout.
            match child.try_wait() {
                Ok(Some(status)) => return Err(TunnelError::AgentExited(status.to_string())),
                Ok(None) => {}
                Err(e) => return Err(TunnelError::AgentExited(e.to_string())),
            }

            match list_tunnels(&client, &config.api_url).await {
                Ok(tunnels) => {
                    if let Some(url) = pick_public_url(&tunnels, local_port) {
                        info!(public_url = %url, local_port, "tunnel connected");
                        return Ok(Self {
                            child: Some(child),
                            public_url: url,
                            local_port,
                        });
                    }
                }
                // API not up yet; keep polling until the deadline.
                Err(e) => debug!(error = %e, "agent API not ready"),
            }

            if Instant::now() >= deadline {
                if let Err(e) = child.start_kill() {
                    warn!(error = %e, "failed to kill timed-out agent");
                }
                return Err(TunnelError::ReadyTimeout(config.ready_timeout));
            }
            sleep(config.ready_poll_interval).await;
        }
    }

    /// The externally reachable URL.
    pub fn public_url(&self) -> &str {
        &self.public_url
    }

    /// The local port this tunnel forwards to.
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Stop the agent process owning this tunnel. Idempotent.
    pub async fn disconnect(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.start_kill() {
                debug!(error = %e, "agent already gone");
            }
            if let Err(e) = child.wait().await {
                debug!(error = %e, "failed to reap agent");
            }
            info!(local_port = self.local_port, "tunnel disconnected");
        }
    }

    /// Close every tunnel known to the agent runtime, whoever created it,
    /// then sweep the agent process itself. A no-op when no agent is
    /// running; failures are logged, never raised.
    pub async fn disconnect_all(config: &TunnelConfig) {
        let client = reqwest::Client::new();
        match list_tunnels(&client, &config.api_url).await {
            Ok(tunnels) => {
                for tunnel in &tunnels {
                    if tunnel.uri.is_empty() {
                        continue;
                    }
                    let url = format!("{}{}", config.api_url, tunnel.uri);
                    match client.delete(&url).send().await {
                        Ok(resp) if resp.status().is_success() => {
                            info!(public_url = %tunnel.public_url, "closed tunnel");
                        }
                        Ok(resp) => {
                            warn!(status = %resp.status(), public_url = %tunnel.public_url, "tunnel close rejected");
                        }
                        Err(e) => warn!(error = %e, "tunnel close failed"),
                    }
                }
            }
            Err(e) => debug!(error = %e, "no agent API reachable; nothing to close"),
        }

        // Stop the agent runtime itself, not only the tunnels it carries.
        // Name matching works on the executable basename.
        let agent_name = std::path::Path::new(&config.agent_bin)
            .file_name()
            .map_or_else(|| config.agent_bin.clone(), |f| f.to_string_lossy().into_owned());
        let mut report = reconcile::ReconcileReport::default();
        reconcile::kill_by_name(&agent_name, std::process::id(), &mut report);
        if report.found_strays() {
            info!(killed = report.killed.len(), "stopped tunnel agent runtime");
        }
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        // kill_on_drop on the child covers the process; nothing else owned.
        if let Some(child) = &mut self.child {
            if let Err(e) = child.start_kill() {
                debug!(error = %e, "agent already gone on drop");
            }
        }
    }
}

/// Fetch the agent's tunnel list from its local web API.
async fn list_tunnels(
    client: &reqwest::Client,
    api_url: &str,
) -> Result<Vec<TunnelInfo>, TunnelError> {
    let resp = client
        .get(format!("{api_url}/api/tunnels"))
        .send()
        .await
        .map_err(|e| TunnelError::Api(e.to_string()))?;
    let list: TunnelList = resp
        .json()
        .await
        .map_err(|e| TunnelError::Api(e.to_string()))?;
    Ok(list.tunnels)
}

/// Pick the public URL for the tunnel forwarding to `local_port`.
///
/// The agent usually registers both an https and an http edge for one
/// `ngrok http` invocation; prefer https. A tunnel whose forward address
/// does not name our port is someone else's.
fn pick_public_url(tunnels: &[TunnelInfo], local_port: u16) -> Option<String> {
    let port_suffix = format!(":{local_port}");
    let ours: Vec<&TunnelInfo> = tunnels
        .iter()
        .filter(|t| t.config.addr.ends_with(&port_suffix))
        .collect();

    ours.iter()
        .find(|t| t.proto == "https")
        .or_else(|| ours.first())
        .map(|t| t.public_url.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    const TUNNELS_JSON: &str = r#"{
        "tunnels": [
            {
                "name": "command_line (http)",
                "uri": "/api/tunnels/command_line%20%28http%29",
                "public_url": "http://1234.ngrok-free.app",
                "proto": "http",
                "config": {"addr": "http://localhost:8000", "inspect": true}
            },
            {
                "name": "command_line",
                "uri": "/api/tunnels/command_line",
                "public_url": "https://1234.ngrok-free.app",
                "proto": "https",
                "config": {"addr": "http://localhost:8000", "inspect": true}
            },
            {
                "name": "other",
                "uri": "/api/tunnels/other",
                "public_url": "https://other.ngrok-free.app",
                "proto": "https",
                "config": {"addr": "http://localhost:9111", "inspect": true}
            }
        ],
        "uri": "/api/tunnels"
    }"#;

    fn parse_fixture() -> Vec<TunnelInfo> {
        let list: TunnelList = serde_json::from_str(TUNNELS_JSON).unwrap();
        list.tunnels
    }

    #[test]
    fn parses_agent_tunnel_list() {
        let tunnels = parse_fixture();
        assert_eq!(tunnels.len(), 3);
        assert_eq!(tunnels[1].proto, "https");
        assert_eq!(tunnels[1].config.addr, "http://localhost:8000");
    }

    #[test]
    fn prefers_https_edge_for_our_port() {
        let tunnels = parse_fixture();
        assert_eq!(
            pick_public_url(&tunnels, 8000).as_deref(),
            Some("https://1234.ngrok-free.app")
        );
    }

    #[test]
    fn ignores_tunnels_for_other_ports() {
        let tunnels = parse_fixture();
        assert_eq!(
            pick_public_url(&tunnels, 9111).as_deref(),
            Some("https://other.ngrok-free.app")
        );
        assert!(pick_public_url(&tunnels, 7777).is_none());
    }

    #[test]
    fn falls_back_to_http_edge_when_no_https() {
        let mut tunnels = parse_fixture();
        tunnels.remove(1);
        assert_eq!(
            pick_public_url(&tunnels, 8000).as_deref(),
            Some("http://1234.ngrok-free.app")
        );
    }

    #[test]
    fn default_config() {
        let config = TunnelConfig::default();
        assert_eq!(config.agent_bin, "ngrok");
        assert_eq!(config.api_url, "http://127.0.0.1:4040");
        assert!(config.ready_timeout > config.ready_poll_interval);
    }

    #[tokio::test]
    async fn spawn_failure_is_explicit() {
        let config = TunnelConfig {
            agent_bin: "/definitely/not/a/real/agent".into(),
            ready_timeout: Duration::from_millis(200),
            ..TunnelConfig::default()
        };
        let err = Tunnel::connect(8000, None, &config).await.unwrap_err();
        assert!(matches!(err, TunnelError::Spawn { .. }));
    }

    #[tokio::test]
    async fn disconnect_all_without_agent_is_a_noop() {
        // Point the API at a port nobody listens on.
        let config = TunnelConfig {
            api_url: "http://127.0.0.1:1".into(),
            ..TunnelConfig::default()
        };
        Tunnel::disconnect_all(&config).await;
    }
}
