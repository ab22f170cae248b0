//! Library entry for the `poolwatch` crate.
//!
//! Exposes [`inner_main`] so the thin shim binary (and integration-style
//! tests) can drive the monitor: load the config, build the notifier and
//! the per-site gateways, then hand everything to the supervisor.

pub mod action;
pub mod cli;
pub mod config;
pub mod gateway;
pub mod notify;
pub mod probe;
pub mod record;
pub mod supervisor;

use std::sync::{Arc, Once};

use eyre::WrapErr as _;
use tracing::info;
use tracing_subscriber::EnvFilter;

use cli::Cli;
use notify::Notifier;

static INIT_TRACING: Once = Once::new();

/// The monitor's main function; can be called from a shim binary.
///
/// Loads the configuration, resolves every site (enumerating backends from
/// the gateway where the config has no static list) and runs the supervisor
/// until a shutdown signal arrives.
///
/// # Errors
///
/// Returns an error if the configuration cannot be loaded or validated, or
/// if the supervisor fails to start. Per-cycle failures at steady state are
/// logged, never returned.
pub async fn inner_main(invocation: Cli) -> eyre::Result<()> {
    INIT_TRACING.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            )
            .init();
    });

    info!("Using config path: {}", invocation.config);
    let document = config::loader::load(&invocation.config)
        .await
        .wrap_err("Configuration load failed")?;

    let notifier = Arc::new(
        Notifier::from_config(&document.notify).wrap_err("Notification setup failed")?,
    );

    let sites = config::resolve_sites(&document)
        .await
        .wrap_err("Configuration validation failed")?;
    if sites.is_empty() {
        eyre::bail!("No sites configured, nothing to monitor");
    }

    supervisor::run(sites, notifier).await
}
