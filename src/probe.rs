//! Concurrent HTTP probing of one site's backend pool.
//!
//! Every cycle issues one request per backend, all in parallel, and always
//! returns a complete result set: transport failures of any kind (refused
//! connections, DNS, timeouts) are collapsed into the 504 sentinel so the
//! decision engine only ever sees status codes. Debouncing is not the
//! prober's job.

use eyre::WrapErr as _;
use futures::future;
use reqwest::header;
use tracing::debug;

use crate::config::{ProbeMethod, SiteConfig};

/// Sentinel status for backends that produced no HTTP response at all.
pub(crate) const STATUS_UNREACHABLE: u16 = 504;

/// Outcome of probing a single backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ProbeResult {
    pub status: u16,
    pub server: String,
}

/// Issues the per-backend probes. Cheap to clone; the underlying client is
/// shared.
#[derive(Clone)]
pub(crate) struct Prober {
    client: reqwest::Client,
}

impl Prober {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub(crate) fn new() -> eyre::Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .wrap_err("Failed to build probe HTTP client")?;
        Ok(Self { client })
    }

    /// Probes every backend of `site` concurrently and returns once all of
    /// them have either produced a status or run into their deadline. The
    /// order of the returned results is unspecified.
    pub(crate) async fn probe_site(&self, site: &SiteConfig) -> Vec<ProbeResult> {
        let probes = site.servers.iter().map(|server| self.probe_one(site, server));
        future::join_all(probes).await
    }

    async fn probe_one(&self, site: &SiteConfig, server: &str) -> ProbeResult {
        let url = format!("http://{}{}", server, site.path);
        let request = match site.method {
            ProbeMethod::Get => self.client.get(&url),
            ProbeMethod::Post => match site.post_data {
                Some(ref data) => self.client.post(&url).form(data),
                None => self.client.post(&url),
            },
            ProbeMethod::Head => self.client.head(&url),
        };
        let response = request
            .header(header::HOST, site.name.as_str())
            .timeout(site.timeout)
            .send()
            .await;
        let status = match response {
            Ok(response) => {
                let status = response.status().as_u16();
                if status > 400 {
                    debug!(site = %site.name, %url, status, "probe returned an error status");
                }
                status
            }
            Err(error) => {
                debug!(site = %site.name, %url, %error, "probe did not complete");
                STATUS_UNREACHABLE
            }
        };
        ProbeResult {
            status,
            server: server.to_string(),
        }
    }
}
