//! Gateway adapters: taking backends in and out of the serving pool of the
//! upstream tier.
//!
//! The supervisor only sees the [`Gateway`] variant type; which adapter a
//! site uses is decided once at config resolution. All operations are
//! idempotent: offlining an already-offlined backend is a no-op success.

pub(crate) mod nginx;
pub(crate) mod slb;

use std::collections::BTreeSet;

use thiserror::Error as ThisError;

use crate::config::{ConfigError, GatewayEntry, GatewaySection};
use nginx::NginxGateway;
use slb::SlbGateway;

/// Errors returned by gateway operations.
#[derive(Debug, ThisError)]
pub enum GatewayError {
    #[error("remote command via {peer} failed: {stderr}")]
    Command { peer: String, stderr: String },
    #[error("remote command via {peer} timed out")]
    Timeout { peer: String },
    #[error("failed to run ssh for {peer}")]
    Spawn {
        peer: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{failed} of {total} gateway peers rejected the change for {server}")]
    PeerFailures {
        server: String,
        failed: usize,
        total: usize,
    },
    #[error("SLB API returned {code}: {message}")]
    Api { code: String, message: String },
    #[error("backend {server} is not registered on the listener")]
    UnknownBackend { server: String },
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

/// One site's bound gateway, dispatched by the config `type` tag.
pub enum Gateway {
    Nginx(NginxGateway),
    Slb(SlbGateway),
}

impl Gateway {
    /// Binds a site's gateway entry to the global credentials.
    ///
    /// # Errors
    ///
    /// Returns an error if the matching credentials block is missing.
    pub(crate) fn from_entry(
        site: &str,
        entry: &GatewayEntry,
        credentials: &GatewaySection,
    ) -> Result<Self, ConfigError> {
        match *entry {
            GatewayEntry::Nginx {
                ref config_file,
                backend_port,
            } => {
                let nginx = credentials.nginx.as_ref().ok_or_else(|| {
                    ConfigError::GatewayCredentialsMissing {
                        site: site.to_string(),
                        kind: "nginx",
                    }
                })?;
                Ok(Self::Nginx(NginxGateway::new(
                    nginx,
                    config_file.clone(),
                    backend_port,
                )))
            }
            GatewayEntry::Slb {
                ref slb_id,
                listen_port,
            } => {
                let slb = credentials.slb.as_ref().ok_or_else(|| {
                    ConfigError::GatewayCredentialsMissing {
                        site: site.to_string(),
                        kind: "slb",
                    }
                })?;
                Ok(Self::Slb(SlbGateway::new(slb, slb_id.clone(), listen_port)))
            }
        }
    }

    /// Asks the upstream tier for the current backend set (`host:port`).
    ///
    /// # Errors
    ///
    /// Returns an error if the gateway cannot be reached or answers
    /// unexpectedly.
    pub(crate) async fn fetch_servers(&self) -> Result<BTreeSet<String>, GatewayError> {
        match *self {
            Self::Nginx(ref gateway) => gateway.fetch_servers().await,
            Self::Slb(ref gateway) => gateway.fetch_servers().await,
        }
    }

    /// Removes `server` from the serving pool.
    ///
    /// # Errors
    ///
    /// Returns an error if the change could not be applied; the caller is
    /// expected to log it and rely on the cooldown to retry.
    pub(crate) async fn offline(&self, server: &str) -> Result<(), GatewayError> {
        match *self {
            Self::Nginx(ref gateway) => gateway.offline(server).await,
            Self::Slb(ref gateway) => gateway.offline(server).await,
        }
    }

    /// Puts `server` back into the serving pool. Inverse of [`Self::offline`].
    ///
    /// # Errors
    ///
    /// Returns an error if the change could not be applied.
    pub(crate) async fn online(&self, server: &str) -> Result<(), GatewayError> {
        match *self {
            Self::Nginx(ref gateway) => gateway.online(server).await,
            Self::Slb(ref gateway) => gateway.online(server).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NginxCredentials, SlbCredentials};

    fn credentials() -> GatewaySection {
        GatewaySection {
            nginx: Some(NginxCredentials {
                hosts: vec!["lb1.internal".to_string()],
                user: "root".to_string(),
            }),
            slb: None,
        }
    }

    #[test]
    fn binding_nginx_without_credentials_is_rejected() {
        let entry = GatewayEntry::Nginx {
            config_file: "/etc/nginx/conf.d/site.conf".to_string(),
            backend_port: 8080,
        };
        let err = Gateway::from_entry("www.example.com", &entry, &GatewaySection::default())
            .err()
            .expect("missing credentials must be rejected");
        assert!(matches!(
            err,
            ConfigError::GatewayCredentialsMissing { kind: "nginx", .. }
        ));
    }

    #[test]
    fn binding_slb_without_credentials_is_rejected() {
        let entry = GatewayEntry::Slb {
            slb_id: "lb-2zexample".to_string(),
            listen_port: 80,
        };
        let err = Gateway::from_entry("www.example.com", &entry, &credentials())
            .err()
            .expect("missing credentials must be rejected");
        assert!(matches!(
            err,
            ConfigError::GatewayCredentialsMissing { kind: "slb", .. }
        ));
    }

    #[test]
    fn binding_with_credentials_selects_the_matching_adapter() {
        let entry = GatewayEntry::Nginx {
            config_file: "/etc/nginx/conf.d/site.conf".to_string(),
            backend_port: 8080,
        };
        let gateway = Gateway::from_entry("www.example.com", &entry, &credentials())
            .expect("binding should succeed");
        assert!(matches!(gateway, Gateway::Nginx(_)));

        let mut section = credentials();
        section.slb = Some(SlbCredentials {
            access_key: "AK".to_string(),
            secret: "SK".to_string(),
            region: "cn-hangzhou".to_string(),
        });
        let entry = GatewayEntry::Slb {
            slb_id: "lb-2zexample".to_string(),
            listen_port: 80,
        };
        let gateway = Gateway::from_entry("www.example.com", &entry, &section)
            .expect("binding should succeed");
        assert!(matches!(gateway, Gateway::Slb(_)));
    }
}
