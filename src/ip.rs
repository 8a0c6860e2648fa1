//! Discovering the caller's public IPv4 address.

use crate::error::{Error, Operation};
use educe::Educe;
use std::future::Future;
use std::net::Ipv4Addr;
use std::pin::Pin;
use std::time;
use tracing::instrument;
use tracing_futures::Instrument;

/// Echo endpoints tried, in order, by [`EchoService::default`].
pub const DEFAULT_ENDPOINTS: &[&str] = &["https://api.ipify.org", "https://ifconfig.me"];

/// Format `ip` as a CIDR block admitting exactly that address.
pub fn host_cidr(ip: Ipv4Addr) -> String {
    format!("{}/32", ip)
}

/// Something that can tell us which address we appear as on the public Internet.
pub trait IpSource {
    fn resolve<'l>(&'l self) -> Pin<Box<dyn Future<Output = Result<Ipv4Addr, Error>> + Send + 'l>>;
}

/// Parse the body of an IP-echo response.
///
/// The body must be a bare IPv4 literal. Surrounding whitespace is tolerated since some services
/// append a newline.
pub fn parse_echo_body(body: &str) -> Result<Ipv4Addr, String> {
    let body = body.trim();
    if body.is_empty() {
        return Err(String::from("empty response"));
    }
    body.parse()
        .map_err(|_| format!("response {:?} is not an ipv4 address", body))
}

/// Resolve the public IP through plain-text HTTPS "what is my IP" services.
#[derive(Educe)]
#[educe(Debug)]
pub struct EchoService {
    endpoints: Vec<String>,
    timeout: time::Duration,
    #[educe(Debug(ignore))]
    client: reqwest::Client,
}

impl Default for EchoService {
    fn default() -> Self {
        EchoService {
            endpoints: DEFAULT_ENDPOINTS.iter().map(|s| s.to_string()).collect(),
            timeout: time::Duration::from_secs(10),
            client: reqwest::Client::new(),
        }
    }
}

impl EchoService {
    /// Replace the list of echo endpoints. They are queried in order until one answers.
    pub fn endpoints<I, S>(mut self, endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: ToString,
    {
        self.endpoints = endpoints.into_iter().map(|s| s.to_string()).collect();
        self
    }

    /// Bound each echo request by `t`. Defaults to 10 seconds.
    pub fn timeout(mut self, t: time::Duration) -> Self {
        self.timeout = t;
        self
    }

    async fn query(&self, endpoint: &str) -> Result<Ipv4Addr, String> {
        let res = self
            .client
            .get(endpoint)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        let status = res.status();
        if !status.is_success() {
            return Err(format!("http status {}", status));
        }
        let body = res.text().await.map_err(|e| e.to_string())?;
        parse_echo_body(&body)
    }
}

impl IpSource for EchoService {
    #[instrument(level = "debug")]
    fn resolve<'l>(&'l self) -> Pin<Box<dyn Future<Output = Result<Ipv4Addr, Error>> + Send + 'l>> {
        Box::pin(async move {
            let mut failures = Vec::new();
            for endpoint in &self.endpoints {
                tracing::trace!(%endpoint, "querying ip echo service");
                match self.query(endpoint).await {
                    Ok(ip) => {
                        tracing::debug!(%endpoint, %ip, "resolved public ip");
                        return Ok(ip);
                    }
                    Err(e) => {
                        tracing::warn!(%endpoint, "ip echo service failed: {}", e);
                        failures.push(format!("{}: {}", endpoint, e));
                    }
                }
            }

            if failures.is_empty() {
                failures.push(String::from("no echo endpoints configured"));
            }
            Err(Error::network(Operation::ResolveIp, failures.join("; ")))
        }
        .in_current_span())
    }
}
