//! DNS poisoning probe
//!
//! Before blaming the DPI, find out whether the domain is lied about
//! at the resolver. Reference addresses come from DoH endpoints over
//! plain HTTPS; an address only counts when a verified TLS handshake
//! with the domain as SNI succeeds against it. The probe then checks
//! the system resolver, fragmented queries, and the configured
//! reference resolvers in turn until one produces a working answer.

use crate::config::DnsConfig;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::trace;

/// DoH endpoints used for reference-IP acquisition
const DOH_ENDPOINTS: [&str; 3] = [
    "https://dns.google/resolve?name={domain}&type=A",
    "https://dns.quad9.net:5053/dns-query?name={domain}&type=A",
    "https://cloudflare-dns.com/dns-query?name={domain}&type=A",
];

/// One resolver attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsProbeOutcome {
    /// Resolver tried; empty for the system resolver
    pub server: String,
    /// Whether queries were fragmented
    pub fragmented: bool,
    /// Address the resolver returned
    pub resolved_ip: Option<String>,
    /// Whether the returned address serves the domain
    pub works: bool,
    /// Lookup wall time
    pub latency_ms: u64,
}

/// Conclusion of the probe
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DnsDiscoveryResult {
    /// Verified reference addresses
    pub expected_ips: Vec<String>,
    /// The system resolver returned an address that does not serve
    /// the domain
    pub is_poisoned: bool,
    /// Fragmenting the query restored truthful answers
    pub needs_fragment: bool,
    /// First reference resolver that worked; empty when none did
    pub best_server: String,
    /// Every attempt, in order
    pub probes: Vec<DnsProbeOutcome>,
}

impl DnsDiscoveryResult {
    /// Whether the result describes a working DNS path
    pub fn has_working_config(&self) -> bool {
        !self.is_poisoned || !self.best_server.is_empty() || self.needs_fragment
    }

    /// The DNS sub-configuration to install, if poisoning was found
    /// and a workaround exists
    pub fn to_dns_config(&self) -> Option<DnsConfig> {
        if !self.is_poisoned || !self.has_working_config() {
            return None;
        }
        Some(DnsConfig {
            enabled: true,
            target_dns: self.best_server.clone(),
            fragment_query: self.needs_fragment,
        })
    }
}

/// The network operations the probe sequences. Split out so recorded
/// transcripts drive the same decision path as live lookups.
pub trait DnsOps {
    /// Verified reference addresses from the DoH endpoints
    fn reference_ips(&self) -> impl std::future::Future<Output = Vec<String>> + Send;
    /// One address from the given resolver; empty server means the
    /// system resolver
    fn resolve(&self, server: &str) -> impl std::future::Future<Output = Option<String>> + Send;
    /// Like [`DnsOps::resolve`] but with query fragmentation pushed to
    /// the worker pool first
    fn resolve_fragmented(
        &self,
        server: &str,
    ) -> impl std::future::Future<Output = Option<String>> + Send;
    /// Whether a TLS handshake to `ip` with the domain as SNI succeeds
    fn verify_ip(&self, ip: &str) -> impl std::future::Future<Output = bool> + Send;
}

/// Run the probe sequence over any [`DnsOps`]
pub async fn probe<O: DnsOps>(ops: &O, reference_dns: &[String]) -> DnsDiscoveryResult {
    let mut result = DnsDiscoveryResult::default();

    result.expected_ips = ops.reference_ips().await;
    if result.expected_ips.is_empty() {
        trace!("no verified reference address, DNS probe inconclusive");
        return result;
    }

    let sys = attempt(ops, "", false).await;
    let sys_works = sys.works;
    result.probes.push(sys);
    if sys_works {
        return result;
    }
    result.is_poisoned = true;

    let frag = attempt(ops, "", true).await;
    let frag_works = frag.works;
    result.probes.push(frag);
    if frag_works {
        result.needs_fragment = true;
        return result;
    }

    for server in reference_dns {
        let plain = attempt(ops, server, false).await;
        let works = plain.works;
        result.probes.push(plain);
        if works {
            result.best_server = server.clone();
            return result;
        }

        let frag = attempt(ops, server, true).await;
        let works = frag.works;
        result.probes.push(frag);
        if works {
            result.best_server = server.clone();
            result.needs_fragment = true;
            return result;
        }
    }

    result
}

async fn attempt<O: DnsOps>(ops: &O, server: &str, fragmented: bool) -> DnsProbeOutcome {
    let start = tokio::time::Instant::now();
    let resolved = if fragmented {
        ops.resolve_fragmented(server).await
    } else {
        ops.resolve(server).await
    };
    let works = match &resolved {
        Some(ip) => ops.verify_ip(ip).await,
        None => false,
    };
    DnsProbeOutcome {
        server: server.to_string(),
        fragmented,
        resolved_ip: resolved,
        works,
        latency_ms: start.elapsed().as_millis() as u64,
    }
}

/// Live implementation over DoH, hickory and the worker pool
pub struct LiveDnsOps {
    domain: String,
    timeout: Duration,
    client: reqwest::Client,
    pool: Arc<crate::queue::Pool>,
    propagate: Duration,
}

#[derive(Deserialize)]
struct DohResponse {
    #[serde(rename = "Answer", default)]
    answer: Vec<DohAnswer>,
}

#[derive(Deserialize)]
struct DohAnswer {
    #[serde(rename = "data")]
    data: String,
    #[serde(rename = "type")]
    rtype: u16,
}

impl LiveDnsOps {
    /// Build live ops for one domain
    pub fn new(
        domain: impl Into<String>,
        timeout: Duration,
        propagate: Duration,
        pool: Arc<crate::queue::Pool>,
    ) -> crate::error::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| crate::error::Error::Probe {
                probe: "dns",
                message: e.to_string(),
            })?;
        Ok(Self {
            domain: domain.into(),
            timeout,
            client,
            pool,
            propagate,
        })
    }

    async fn resolve_with_hickory(&self, server: &str) -> Option<String> {
        use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
        use hickory_resolver::TokioAsyncResolver;

        if server.is_empty() {
            // system resolver
            let mut addrs = tokio::net::lookup_host((self.domain.as_str(), 443)).await.ok()?;
            return addrs.next().map(|a| a.ip().to_string());
        }

        let ip = server.parse::<std::net::IpAddr>().ok()?;
        let group = NameServerConfigGroup::from_ips_clear(&[ip], 53, true);
        let resolver = TokioAsyncResolver::tokio(
            ResolverConfig::from_parts(None, vec![], group),
            ResolverOpts::default(),
        );
        let lookup = tokio::time::timeout(self.timeout, resolver.lookup_ip(self.domain.clone()))
            .await
            .ok()?
            .ok()?;
        lookup.iter().next().map(|ip| ip.to_string())
    }

    /// Temporarily install a fragment-DNS configuration, resolve, then
    /// restore the previous configuration.
    async fn resolve_under_fragmentation(&self, server: &str) -> Option<String> {
        let previous = self.pool.snapshot();

        let mut test = (*previous).clone();
        if let Some(set) = test.main_set_mut() {
            set.dns = DnsConfig {
                enabled: true,
                target_dns: server.to_string(),
                fragment_query: true,
            };
            set.targets.sni_domains = vec![self.domain.clone()];
        }
        if self.pool.update_config(test).is_err() {
            return None;
        }
        tokio::time::sleep(self.propagate).await;

        let resolved = self.resolve_with_hickory(server).await;

        if let Err(err) = self.pool.update_config((*previous).clone()) {
            tracing::warn!(%err, "failed to restore configuration after DNS probe");
        }
        resolved
    }
}

impl DnsOps for LiveDnsOps {
    async fn reference_ips(&self) -> Vec<String> {
        let mut verified = Vec::new();
        for endpoint in DOH_ENDPOINTS {
            let url = endpoint.replace("{domain}", &self.domain);
            let response = match self
                .client
                .get(&url)
                .header("Accept", "application/dns-json")
                .send()
                .await
            {
                Ok(r) => r,
                Err(err) => {
                    trace!(%err, endpoint, "DoH endpoint failed");
                    continue;
                }
            };
            let Ok(doh) = response.json::<DohResponse>().await else {
                continue;
            };

            for answer in doh.answer.iter().filter(|a| a.rtype == 1) {
                if verified.contains(&answer.data) {
                    continue;
                }
                if self.verify_ip(&answer.data).await {
                    verified.push(answer.data.clone());
                }
            }
            if !verified.is_empty() {
                break;
            }
        }
        verified
    }

    async fn resolve(&self, server: &str) -> Option<String> {
        self.resolve_with_hickory(server).await
    }

    async fn resolve_fragmented(&self, server: &str) -> Option<String> {
        self.resolve_under_fragmentation(server).await
    }

    async fn verify_ip(&self, ip: &str) -> bool {
        let Ok(addr) = ip.parse::<std::net::IpAddr>() else {
            return false;
        };
        let Ok(server_name) = ServerName::try_from(self.domain.clone()) else {
            return false;
        };

        let stream =
            match tokio::time::timeout(self.timeout / 2, TcpStream::connect((addr, 443))).await {
                Ok(Ok(s)) => s,
                _ => return false,
            };

        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(config));

        matches!(
            tokio::time::timeout(self.timeout, connector.connect(server_name, stream)).await,
            Ok(Ok(_))
        )
    }
}
