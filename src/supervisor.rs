//! The supervisor: drives one probing cycle per tick for every site and
//! dispatches the emitted directives to the gateway, restart-action and
//! notification collaborators.
//!
//! Each site runs on its own task and exclusively owns its [`SiteRecord`];
//! probes fan out in parallel but their results are consumed on the owning
//! task only. Collaborator failures are confined to the cycle they happen
//! in: a dead gateway peer or webhook is logged and the loop keeps going.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::Local;
use futures::future;
use tokio::signal;
use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};

use crate::action::RestartAction;
use crate::config::{ResolvedSite, SiteConfig};
use crate::gateway::Gateway;
use crate::notify::Notifier;
use crate::probe::Prober;
use crate::record::{Directive, DirectiveKind, SiteRecord};

/// One site's state as owned by its driving task.
struct SiteWorker {
    config: SiteConfig,
    gateway: Gateway,
    record: SiteRecord,
}

/// Runs all site loops until a shutdown signal arrives, then lets every site
/// finish its current cycle and returns.
///
/// # Errors
///
/// Returns an error if the shared probe client cannot be constructed.
pub async fn run(sites: Vec<ResolvedSite>, notifier: Arc<Notifier>) -> eyre::Result<()> {
    let prober = Prober::new()?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut handles = Vec::with_capacity(sites.len());
    for site in sites {
        let worker = SiteWorker {
            record: SiteRecord::new(&site.config),
            config: site.config,
            gateway: site.gateway,
        };
        let prober = prober.clone();
        let notifier = Arc::clone(&notifier);
        let shutdown_rx = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            drive_site(worker, prober, notifier, shutdown_rx).await;
        }));
    }

    shutdown_signal().await;
    info!("Received shutdown, finishing in-flight cycles");
    drop(shutdown_tx.send(true));
    future::join_all(handles).await;
    Ok(())
}

/// Resolves when a shutdown signal is received.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(err) => {
                error!(error = %err, "failed to install the SIGTERM handler, falling back to ctrl-c");
                drop(signal::ctrl_c().await);
                return;
            }
        };
        tokio::select! {
            _ = sigterm.recv() => {}
            _ = signal::ctrl_c() => {}
        }
    }
    #[cfg(not(unix))]
    {
        drop(signal::ctrl_c().await);
    }
}

async fn drive_site(
    mut worker: SiteWorker,
    prober: Prober,
    notifier: Arc<Notifier>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = interval(worker.config.check_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(
        site = %worker.config.name,
        backends = worker.config.servers.len(),
        "starting site loop"
    );
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown_rx.changed() => break,
        }
        run_cycle(&mut worker, &prober, &notifier).await;
    }
    debug!(site = %worker.config.name, "site loop stopped");
}

/// One full cycle: probe everything, absorb the results, derive directives,
/// dispatch them.
async fn run_cycle(worker: &mut SiteWorker, prober: &Prober, notifier: &Notifier) {
    if worker.config.servers.is_empty() {
        warn!(site = %worker.config.name, "no backends to probe");
        return;
    }
    let results = prober.probe_site(&worker.config).await;
    let now = Instant::now();
    worker.record.update(&results, now);
    let directives = worker.record.derive(now);
    if directives.is_empty() {
        return;
    }
    let error_hosts = worker.record.error_hosts();
    for directive in &directives {
        dispatch(worker, directive, &error_hosts, notifier).await;
    }
}

async fn dispatch(
    worker: &SiteWorker,
    directive: &Directive,
    error_hosts: &BTreeSet<String>,
    notifier: &Notifier,
) {
    let site = &worker.config.name;
    match directive.kind {
        DirectiveKind::Offline => {
            let info_line = match worker.config.recover {
                Some(ref recover) => {
                    if let Err(err) = worker.gateway.offline(&directive.host).await {
                        error!(%site, host = %directive.host, error = %err,
                            "failed to take backend out of rotation");
                    }
                    // Fire and forget; the action never writes back into the
                    // record.
                    tokio::spawn(RestartAction::new(recover, site, &directive.host).run());
                    format!("{} {}", directive.host, recover.kind)
                }
                None => format!("{} error occur", directive.host),
            };
            notifier
                .send_all(&notification(
                    site,
                    error_hosts,
                    &info_line,
                    directive.last_status,
                ))
                .await;
        }
        DirectiveKind::Notify => {
            let info_line = format!("{} Error Occur", directive.host);
            notifier
                .send_all(&notification(
                    site,
                    error_hosts,
                    &info_line,
                    directive.last_status,
                ))
                .await;
        }
        DirectiveKind::Online => {
            if worker.config.recover.is_some() {
                if let Err(err) = worker.gateway.online(&directive.host).await {
                    error!(%site, host = %directive.host, error = %err,
                        "failed to bring backend back into rotation");
                }
            }
            let info_line = format!("{} Recover", directive.host);
            notifier
                .send_all(&notification(site, error_hosts, &info_line, 200))
                .await;
        }
    }
}

/// Renders the operator-facing message for one directive.
fn notification(site: &str, error_hosts: &BTreeSet<String>, info: &str, status: u16) -> String {
    let hosts = if error_hosts.is_empty() {
        "None".to_string()
    } else {
        format!(
            "\n\t{}",
            error_hosts.iter().cloned().collect::<Vec<_>>().join("\n\t")
        )
    };
    format!(
        "Time:\t{time}\nDomain:\t{site}\nErrHosts:\t{hosts}\nInfo:\t{info}, latest status {status}\nTotalError:\t{total}",
        time = Local::now().format("%Y-%m-%d %H:%M:%S"),
        total = error_hosts.len(),
    )
}
