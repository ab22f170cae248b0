//! Configuration management for the monitor: the YAML data model, the
//! defaulting rules and the validation that turns a raw document into
//! per-site runtime configuration.
//!
//! The config file is read exactly once at startup; there is no reload
//! mechanism. Anything wrong with the document is a startup failure.

pub(crate) mod loader;

use core::fmt;
use core::time::Duration;
use std::collections::{BTreeMap, BTreeSet};

use serde::Deserialize;
use thiserror::Error as ThisError;
use tracing::warn;

use crate::gateway::Gateway;

pub(crate) const DEFAULT_MAX_FAILED: u32 = 5;
pub(crate) const DEFAULT_DURATION_SECS: u64 = 60;
pub(crate) const DEFAULT_TIMEOUT_SECS: u64 = 5;
pub(crate) const DEFAULT_AUTO_INTERVAL_SECS: u64 = 300;
pub(crate) const DEFAULT_CHECK_INTERVAL_SECS: u64 = 30;
pub(crate) const DEFAULT_PROBE_PATH: &str = "/";

/// Root structure of the YAML configuration document.
#[derive(Debug, Deserialize, Default)]
pub struct Document {
    /// Fallback values applied to every site that omits a field.
    #[serde(default)]
    pub default: DefaultSection,
    /// The monitored sites.
    #[serde(default)]
    pub sites: Vec<SiteEntry>,
    /// Global gateway credentials, keyed by gateway type.
    #[serde(default)]
    pub gateway: GatewaySection,
    /// Notification channels, fanned out to on every emitted event.
    #[serde(default)]
    pub notify: Vec<NotifyEntry>,
}

/// The `default:` section; every field is optional and falls back to the
/// built-in constants above.
#[derive(Debug, Deserialize, Default, Clone)]
pub struct DefaultSection {
    pub max_failed: Option<u32>,
    /// Failure window length in seconds.
    pub duration: Option<u64>,
    /// Per-probe deadline in seconds.
    pub timeout: Option<u64>,
    pub path: Option<String>,
    /// Per-host action/notify cooldown in seconds.
    pub auto_interval: Option<u64>,
    pub max_inactive: Option<usize>,
    /// Delay between probing cycles in seconds.
    pub check_interval: Option<u64>,
    pub recover: Option<RecoverEntry>,
}

/// One entry of the `sites:` list, as written in the document.
#[derive(Debug, Deserialize, Clone)]
pub struct SiteEntry {
    /// Virtual host name, sent as the HTTP `Host` header on every probe.
    pub site: String,
    /// Static backend list (`host:port`). When empty, the gateway is asked
    /// to enumerate the backends once at startup.
    #[serde(default)]
    pub servers: Vec<String>,
    pub path: Option<String>,
    pub timeout: Option<u64>,
    pub max_failed: Option<u32>,
    pub duration: Option<u64>,
    pub max_inactive: Option<usize>,
    pub auto_interval: Option<u64>,
    #[serde(default)]
    pub method: ProbeMethod,
    /// Form body for POST probes.
    pub post_data: Option<BTreeMap<String, String>>,
    pub recover: Option<RecoverEntry>,
    pub gateway: GatewayEntry,
}

/// HTTP method used for probing.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProbeMethod {
    #[default]
    Get,
    Post,
    Head,
}

/// Per-site gateway binding, dispatched by the `type` tag.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum GatewayEntry {
    /// NGINX upstream blocks, edited in place over SSH on every peer.
    Nginx { config_file: String, backend_port: u16 },
    /// Alibaba Cloud SLB listener, driven via the OpenAPI.
    Slb { slb_id: String, listen_port: u16 },
}

/// The `recover:` block as written; validated into [`RecoverAction`].
#[derive(Debug, Deserialize, Default, Clone)]
pub struct RecoverEntry {
    #[serde(default)]
    pub enabled: bool,
    #[serde(rename = "type")]
    pub kind: Option<RestartKind>,
    /// Name of the IIS website or the process to restart.
    pub name: Option<String>,
}

/// Supported backend-side restart flavors.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RestartKind {
    RestartIis,
    RestartProcess,
}

impl fmt::Display for RestartKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::RestartIis => write!(f, "restart_iis"),
            Self::RestartProcess => write!(f, "restart_process"),
        }
    }
}

/// Global `gateway:` credentials section.
#[derive(Debug, Deserialize, Default, Clone)]
pub struct GatewaySection {
    pub nginx: Option<NginxCredentials>,
    pub slb: Option<SlbCredentials>,
}

/// SSH peers that run the NGINX gateway tier.
#[derive(Debug, Deserialize, Clone)]
pub struct NginxCredentials {
    pub hosts: Vec<String>,
    #[serde(default = "default_ssh_user")]
    pub user: String,
}

fn default_ssh_user() -> String {
    "root".to_string()
}

/// Alibaba Cloud credentials for the SLB OpenAPI.
#[derive(Debug, Deserialize, Clone)]
pub struct SlbCredentials {
    pub access_key: String,
    pub secret: String,
    pub region: String,
}

/// One notification channel, dispatched by the `type` tag.
#[derive(Debug, Deserialize, Clone)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum NotifyEntry {
    Dingding {
        robot_token: String,
    },
    Wechat {
        corpid: String,
        secret: String,
        users: Vec<String>,
    },
    Email {
        server: String,
        #[serde(default = "default_smtp_port")]
        port: u16,
        username: String,
        password: String,
        users: Vec<String>,
    },
}

const fn default_smtp_port() -> u16 {
    25
}

/// Errors detected while validating the configuration document.
#[derive(Debug, ThisError)]
pub enum ConfigError {
    #[error("site {0}: recover is enabled but `type` is not set")]
    RecoverKindMissing(String),
    #[error("site {0}: recover is enabled but `name` is not set")]
    RecoverNameMissing(String),
    #[error("site {site}: gateway type `{kind}` is used but `gateway.{kind}` credentials are missing")]
    GatewayCredentialsMissing { site: String, kind: &'static str },
    #[error("site {0}: max_failed must be at least 1")]
    MaxFailedZero(String),
}

/// Validated restart configuration for a site with recovery enabled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoverAction {
    pub kind: RestartKind,
    pub name: String,
}

/// Fully resolved per-site configuration, immutable for the lifetime of the
/// process.
#[derive(Debug, Clone)]
pub struct SiteConfig {
    pub name: String,
    pub servers: BTreeSet<String>,
    pub path: String,
    pub method: ProbeMethod,
    pub post_data: Option<BTreeMap<String, String>>,
    pub timeout: Duration,
    pub max_failed: u32,
    /// Length of the sliding failure window.
    pub duration: Duration,
    /// Upper bound on concurrently offlined backends.
    pub max_inactive: usize,
    pub auto_interval: Duration,
    pub check_interval: Duration,
    /// `None` when recovery is disabled for this site.
    pub recover: Option<RecoverAction>,
}

impl SiteEntry {
    /// Applies the defaulting rules and validates the entry. `servers` is
    /// passed in separately because it may have been enumerated from the
    /// gateway; the `max_inactive` fallback of half the pool depends on it.
    pub(crate) fn resolve(
        &self,
        defaults: &DefaultSection,
        servers: BTreeSet<String>,
    ) -> Result<SiteConfig, ConfigError> {
        let max_failed = self
            .max_failed
            .or(defaults.max_failed)
            .unwrap_or(DEFAULT_MAX_FAILED);
        if max_failed == 0 {
            return Err(ConfigError::MaxFailedZero(self.site.clone()));
        }
        let max_inactive = self
            .max_inactive
            .or(defaults.max_inactive)
            .unwrap_or(servers.len() / 2);
        let recover = resolve_recover(
            &self.site,
            self.recover.as_ref().or(defaults.recover.as_ref()),
        )?;
        Ok(SiteConfig {
            name: self.site.clone(),
            servers,
            path: self
                .path
                .clone()
                .or_else(|| defaults.path.clone())
                .unwrap_or_else(|| DEFAULT_PROBE_PATH.to_string()),
            method: self.method,
            post_data: self.post_data.clone(),
            timeout: Duration::from_secs(
                self.timeout
                    .or(defaults.timeout)
                    .unwrap_or(DEFAULT_TIMEOUT_SECS),
            ),
            max_failed,
            duration: Duration::from_secs(
                self.duration
                    .or(defaults.duration)
                    .unwrap_or(DEFAULT_DURATION_SECS),
            ),
            max_inactive,
            auto_interval: Duration::from_secs(
                self.auto_interval
                    .or(defaults.auto_interval)
                    .unwrap_or(DEFAULT_AUTO_INTERVAL_SECS),
            ),
            check_interval: Duration::from_secs(
                defaults
                    .check_interval
                    .unwrap_or(DEFAULT_CHECK_INTERVAL_SECS),
            ),
            recover,
        })
    }
}

fn resolve_recover(
    site: &str,
    entry: Option<&RecoverEntry>,
) -> Result<Option<RecoverAction>, ConfigError> {
    let Some(entry) = entry else {
        return Ok(None);
    };
    if !entry.enabled {
        return Ok(None);
    }
    let kind = entry
        .kind
        .ok_or_else(|| ConfigError::RecoverKindMissing(site.to_string()))?;
    let name = entry
        .name
        .clone()
        .ok_or_else(|| ConfigError::RecoverNameMissing(site.to_string()))?;
    Ok(Some(RecoverAction { kind, name }))
}

/// A site ready to be driven by the supervisor: its resolved configuration
/// plus the gateway adapter bound to it.
pub struct ResolvedSite {
    pub config: SiteConfig,
    pub gateway: Gateway,
}

/// Builds the runtime view of every configured site.
///
/// Sites with a static `servers` list are taken verbatim. Sites without one
/// ask their gateway for the backend set once, here; an enumeration failure
/// is logged and leaves the site with an empty pool (each of its cycles will
/// warn and do nothing), it does not abort startup.
///
/// # Errors
///
/// Returns an error if any site fails validation, e.g. a gateway without
/// credentials or an enabled `recover` block without `type`/`name`.
pub async fn resolve_sites(document: &Document) -> Result<Vec<ResolvedSite>, ConfigError> {
    let mut sites = Vec::with_capacity(document.sites.len());
    for entry in &document.sites {
        let gateway = Gateway::from_entry(&entry.site, &entry.gateway, &document.gateway)?;
        let mut servers: BTreeSet<String> = entry.servers.iter().cloned().collect();
        if servers.is_empty() {
            match gateway.fetch_servers().await {
                Ok(found) => servers = found,
                Err(error) => {
                    warn!(site = %entry.site, %error, "failed to enumerate backends from gateway");
                }
            }
        }
        let config = entry.resolve(&document.default, servers)?;
        sites.push(ResolvedSite { config, gateway });
    }
    Ok(sites)
}
