//! NGINX gateway adapter.
//!
//! The NGINX tier usually consists of several peers that all carry the same
//! upstream block. Backends are taken out of rotation by commenting their
//! `server` line in the conf file over SSH, followed by `nginx -t` and a
//! reload; bringing them back uncomments the line again. An offline of an
//! already-commented backend is detected up front and skipped, which keeps
//! the operation idempotent.

use core::time::Duration;
use std::collections::BTreeSet;

use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, error, info};

use super::GatewayError;
use crate::config::NginxCredentials;

const SSH_TIMEOUT: Duration = Duration::from_secs(5);

/// All NGINX peers serving one site, plus the site's conf location.
pub struct NginxGateway {
    peers: Vec<SshPeer>,
    config_file: String,
    backend_port: u16,
}

/// One remote NGINX host, reached as `ssh <user>@<host> '<command>'`.
struct SshPeer {
    host: String,
    user: String,
}

impl SshPeer {
    async fn run(&self, command: &str) -> Result<String, GatewayError> {
        debug!(peer = %self.host, command, "running remote command");
        let output = timeout(
            SSH_TIMEOUT,
            Command::new("ssh")
                .arg(format!("{}@{}", self.user, self.host))
                .arg(command)
                .output(),
        )
        .await
        .map_err(|_elapsed| GatewayError::Timeout {
            peer: self.host.clone(),
        })?
        .map_err(|source| GatewayError::Spawn {
            peer: self.host.clone(),
            source,
        })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(GatewayError::Command {
                peer: self.host.clone(),
                stderr,
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Lists the `server` entries of the upstream block that point at the
/// backend port.
fn enumerate_command(config_file: &str, backend_port: u16) -> String {
    format!(r#"sed -rn "s/.*\bserver\b(.*\b:{backend_port}\b).*/\1/p;" {config_file}"#)
}

/// Comments the backend's `server` line, then tests and reloads. The leading
/// `grep` matches when the line is already commented and short-circuits the
/// edit.
fn offline_command(server: &str, config_file: &str) -> String {
    format!(
        concat!(
            r#"grep -e ".*#.*\bserver\b.*\b{server}\b.*" {conf}"#,
            r#"||(sed --follow-symlinks -ri "s/(.*\bserver\b\s+?\b{server}\b.*)/#\1/g" {conf}"#,
            r"&&nginx -t&&nginx -s reload)"
        ),
        server = server,
        conf = config_file,
    )
}

/// Uncomments the backend's `server` line, then tests and reloads.
fn online_command(server: &str, config_file: &str) -> String {
    format!(
        concat!(
            r#"sed --follow-symlinks -ri "s/(\s+?)#+?(.*\bserver\b\s+?\b{server}\b.*)/\1\2/g" {conf}"#,
            r"&&nginx -t&&nginx -s reload"
        ),
        server = server,
        conf = config_file,
    )
}

impl NginxGateway {
    pub(crate) fn new(
        credentials: &NginxCredentials,
        config_file: String,
        backend_port: u16,
    ) -> Self {
        Self {
            peers: credentials
                .hosts
                .iter()
                .map(|host| SshPeer {
                    host: host.clone(),
                    user: credentials.user.clone(),
                })
                .collect(),
            config_file,
            backend_port,
        }
    }

    /// Union of the backends every peer knows about.
    pub(crate) async fn fetch_servers(&self) -> Result<BTreeSet<String>, GatewayError> {
        let mut servers = BTreeSet::new();
        for peer in &self.peers {
            let stdout = peer
                .run(&enumerate_command(&self.config_file, self.backend_port))
                .await?;
            servers.extend(
                stdout
                    .lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty())
                    .map(ToString::to_string),
            );
        }
        debug!(servers = ?servers, "enumerated backends from nginx peers");
        Ok(servers)
    }

    pub(crate) async fn offline(&self, server: &str) -> Result<(), GatewayError> {
        info!(%server, "commenting backend out on all nginx peers");
        self.apply(server, &offline_command(server, &self.config_file))
            .await
    }

    pub(crate) async fn online(&self, server: &str) -> Result<(), GatewayError> {
        info!(%server, "uncommenting backend on all nginx peers");
        self.apply(server, &online_command(server, &self.config_file))
            .await
    }

    /// Runs the edit on every peer. Peer failures are logged individually;
    /// the overall operation fails if any peer rejected the change so the
    /// caller retries on the next cooldown.
    async fn apply(&self, server: &str, command: &str) -> Result<(), GatewayError> {
        let mut failed = 0;
        for peer in &self.peers {
            if let Err(err) = peer.run(command).await {
                error!(peer = %peer.host, %server, error = %err, "nginx peer did not apply the change");
                failed += 1;
            }
        }
        if failed > 0 {
            return Err(GatewayError::PeerFailures {
                server: server.to_string(),
                failed,
                total: self.peers.len(),
            });
        }
        Ok(())
    }
}
