//! DPI fingerprinting
//!
//! Active probes classify how the middlebox blocks (RST injection,
//! redirect, content injection, TLS alert, silent drop), estimate its
//! distance in hops from injected-RST timing, and test whether it
//! tracks connection state. The derivations from probe results to the
//! fingerprint are pure functions, so recorded transcripts fingerprint
//! identically to live probes.

use crate::discovery::presets::StrategyFamily;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::Instant;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;

/// Number of RST timing samples averaged for the hop estimate
const RST_SAMPLES: usize = 5;

/// Known DPI vendor families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DpiType {
    /// Not enough signal to name one
    #[default]
    Unknown,
    /// TSPU-style inline filtering
    Tspu,
    /// Sandvine PacketLogic
    Sandvine,
    /// Huawei carrier DPI
    Huawei,
    /// Allot NetEnforcer
    Allot,
    /// Fortinet FortiGate
    Fortigate,
    /// No DPI observed
    None,
}

/// How the path blocks the target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockingMethod {
    /// Injected TCP resets
    RstInject,
    /// Silent packet drops
    Timeout,
    /// HTTP redirect to a block page
    Redirect,
    /// Forged response content
    ContentInject,
    /// Injected TLS alerts
    TlsAlert,
    /// Nothing blocked
    #[default]
    None,
}

/// How deep the middlebox looks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InspectionDepth {
    /// Unclassified
    #[default]
    Unknown,
    /// Only the SNI is inspected
    SniOnly,
    /// Tracks connection state
    Stateful,
    /// Per-packet inspection
    Stateless,
}

/// Outcome of one probe
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProbeResult {
    /// Probe name, also the key in the result map
    pub probe: String,
    /// The probe's own success notion
    pub success: bool,
    /// Whether blocking was observed
    pub blocked: bool,
    /// Wall time
    pub latency_ms: u64,
    /// TTL carried by an injected RST, estimated from timing
    pub rst_ttl: Option<u8>,
    /// Coarse failure class (`timeout`, `rst`, `rst_after_hello`, ...)
    pub error_kind: Option<String>,
    /// HTTP status when a response arrived
    pub http_code: Option<u16>,
    /// Body size when read
    pub response_size: Option<u64>,
    /// Free-form probe notes
    pub notes: Option<String>,
}

impl ProbeResult {
    fn named(probe: &str) -> Self {
        Self {
            probe: probe.to_string(),
            ..Self::default()
        }
    }
}

/// The fingerprint derived from a probe transcript
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Fingerprint {
    /// Vendor family guess
    pub dpi_type: DpiType,
    /// Blocking method
    pub blocking: BlockingMethod,
    /// Inspection depth
    pub inspection: InspectionDepth,
    /// Average latency until the injected RST arrived
    pub rst_latency_ms: f64,
    /// Estimated hops between the prober and the DPI
    pub dpi_hop_count: u32,
    /// Whether the DPI sits inline within a few hops
    pub is_inline: bool,
    /// The RST arrived after the ClientHello rather than on connect
    pub tracks_state: bool,
    /// Short-TTL fakes should die between the DPI and the server
    pub vulnerable_to_ttl: bool,
    /// Fragmentation splits the signature
    pub vulnerable_to_frag: bool,
    /// Desync confuses its state machine
    pub vulnerable_to_desync: bool,
    /// A poisoning byte terminates its parser
    pub vulnerable_to_oob: bool,
    /// Fake TTL that should reach the DPI but not the server
    pub optimal_ttl: Option<u8>,
    /// Strategy families worth searching, best first
    pub recommended: Vec<StrategyFamily>,
    /// 0-100
    pub confidence: u8,
    /// Raw per-probe results for audit
    pub probes: HashMap<String, ProbeResult>,
}

/// Map RST latency to the TTL the injected RST plausibly carried
pub fn estimate_rst_ttl(latency: Duration) -> u8 {
    match latency.as_millis() {
        0..=4 => 62,
        5..=19 => 58,
        20..=49 => 50,
        _ => 40,
    }
}

/// Hop count from an averaged RST TTL, assuming the nearest canonical
/// initial TTL
pub fn hop_count_from_ttl(avg_ttl: u32) -> u32 {
    let initial: u32 = if avg_ttl > 200 {
        255
    } else if avg_ttl > 64 {
        128
    } else {
        64
    };
    initial.saturating_sub(avg_ttl).max(1)
}

/// Derive the full fingerprint from a probe transcript. Pure.
pub fn derive(probes: HashMap<String, ProbeResult>) -> Fingerprint {
    let mut fp = Fingerprint {
        probes,
        ..Fingerprint::default()
    };

    let Some(baseline) = fp.probes.get("baseline") else {
        return fp;
    };
    if !baseline.blocked {
        fp.dpi_type = DpiType::None;
        fp.blocking = BlockingMethod::None;
        fp.confidence = 95;
        return fp;
    }

    derive_blocking_method(&mut fp);
    derive_rst_characteristics(&mut fp);
    derive_inspection(&mut fp);
    derive_vulnerabilities(&mut fp);
    derive_type(&mut fp);
    derive_recommendations(&mut fp);
    fp
}

fn derive_blocking_method(fp: &mut Fingerprint) {
    let rst = fp.probes.get("rst_detection");
    if let Some(rst) = rst {
        if rst.rst_ttl.is_some() {
            fp.blocking = BlockingMethod::RstInject;
            fp.rst_latency_ms = rst.latency_ms as f64;
            return;
        }
    }

    if let Some(redirect) = fp.probes.get("redirect_detection") {
        if redirect.blocked && matches!(redirect.http_code, Some(code) if (300..400).contains(&code))
        {
            fp.blocking = BlockingMethod::Redirect;
            return;
        }
    }

    if let Some(inject) = fp.probes.get("content_injection") {
        if inject.notes.as_deref() == Some("content_injected") {
            fp.blocking = BlockingMethod::ContentInject;
            return;
        }
    }

    if rst.and_then(|r| r.error_kind.as_deref()) == Some("timeout") {
        fp.blocking = BlockingMethod::Timeout;
        return;
    }

    if let Some(alert) = fp.probes.get("tls_alert") {
        if alert.notes.as_deref() == Some("tls_alert_received") {
            fp.blocking = BlockingMethod::TlsAlert;
        }
    }
}

fn derive_rst_characteristics(fp: &mut Fingerprint) {
    if fp.blocking != BlockingMethod::RstInject {
        return;
    }

    let samples: Vec<&ProbeResult> = (0..RST_SAMPLES)
        .filter_map(|i| fp.probes.get(&format!("rst_sample_{i}")))
        .filter(|p| p.rst_ttl.is_some())
        .collect();
    let samples = if samples.is_empty() {
        fp.probes.get("rst_detection").into_iter().collect()
    } else {
        samples
    };

    let ttls: Vec<u32> = samples
        .iter()
        .filter_map(|p| p.rst_ttl.map(u32::from))
        .collect();
    if ttls.is_empty() {
        return;
    }

    let avg_ttl = ttls.iter().sum::<u32>() / ttls.len() as u32;
    fp.dpi_hop_count = hop_count_from_ttl(avg_ttl);
    fp.is_inline = fp.dpi_hop_count <= 3;
    fp.rst_latency_ms =
        samples.iter().map(|p| p.latency_ms).sum::<u64>() as f64 / samples.len() as f64;

    // stateful when the reset answers the hello, not the connect
    fp.tracks_state = samples
        .iter()
        .chain(fp.probes.get("rst_detection").iter())
        .any(|p| p.error_kind.as_deref() == Some("rst_after_hello"));
}

fn derive_inspection(fp: &mut Fingerprint) {
    let no_sni_works = fp
        .probes
        .get("no_sni")
        .map(|p| p.success)
        .unwrap_or(false);

    // a working no-SNI handshake pins the depth regardless of state
    // tracking; the DPI only ever reads the server name
    fp.inspection = if no_sni_works {
        InspectionDepth::SniOnly
    } else if fp.tracks_state {
        InspectionDepth::Stateful
    } else {
        InspectionDepth::Stateless
    };
}

fn derive_vulnerabilities(fp: &mut Fingerprint) {
    fp.vulnerable_to_ttl = fp.dpi_hop_count > 2 && fp.dpi_hop_count < 20;
    fp.vulnerable_to_frag = !fp.tracks_state || fp.inspection == InspectionDepth::SniOnly;
    fp.vulnerable_to_desync = fp.tracks_state && fp.blocking == BlockingMethod::RstInject;
    fp.vulnerable_to_oob = fp.blocking == BlockingMethod::Timeout && !fp.tracks_state;

    if fp.vulnerable_to_ttl && fp.dpi_hop_count > 0 {
        fp.optimal_ttl = Some((fp.dpi_hop_count.saturating_sub(1)).max(1) as u8);
    }
}

fn derive_type(fp: &mut Fingerprint) {
    fn bump(scores: &mut [(DpiType, u32)], t: DpiType, points: u32) {
        if let Some(entry) = scores.iter_mut().find(|(ty, _)| *ty == t) {
            entry.1 += points;
        }
    }

    let mut scores: Vec<(DpiType, u32)> = vec![
        (DpiType::Tspu, 0),
        (DpiType::Sandvine, 0),
        (DpiType::Huawei, 0),
        (DpiType::Allot, 0),
        (DpiType::Fortigate, 0),
    ];

    if fp.rst_latency_ms < 15.0 && fp.is_inline {
        bump(&mut scores, DpiType::Tspu, 30);
    }
    if fp.dpi_hop_count > 0 && fp.dpi_hop_count <= 3 {
        bump(&mut scores, DpiType::Tspu, 20);
    }
    if fp.inspection == InspectionDepth::SniOnly {
        bump(&mut scores, DpiType::Tspu, 15);
    }
    if fp.blocking == BlockingMethod::RstInject {
        bump(&mut scores, DpiType::Tspu, 10);
    }

    if (10.0..50.0).contains(&fp.rst_latency_ms) {
        bump(&mut scores, DpiType::Sandvine, 20);
    }
    if fp.blocking == BlockingMethod::ContentInject {
        bump(&mut scores, DpiType::Sandvine, 30);
    }
    if fp.inspection == InspectionDepth::Stateful {
        bump(&mut scores, DpiType::Sandvine, 15);
    }

    if fp.blocking == BlockingMethod::Redirect {
        bump(&mut scores, DpiType::Huawei, 25);
    }
    if (3..=8).contains(&fp.dpi_hop_count) {
        bump(&mut scores, DpiType::Huawei, 15);
    }

    if fp.blocking == BlockingMethod::TlsAlert {
        bump(&mut scores, DpiType::Fortigate, 35);
    }
    if fp.dpi_hop_count > 0 && fp.dpi_hop_count <= 2 {
        bump(&mut scores, DpiType::Fortigate, 15);
    }

    let (best, score) = scores
        .into_iter()
        .max_by_key(|(_, s)| *s)
        .unwrap_or((DpiType::Unknown, 0));
    if score > 0 {
        fp.dpi_type = best;
        fp.confidence = score.min(95) as u8;
    }
}

fn derive_recommendations(fp: &mut Fingerprint) {
    let mut rec = vec![
        StrategyFamily::TcpFrag,
        StrategyFamily::Combo,
    ];

    if fp.vulnerable_to_desync {
        rec.push(StrategyFamily::Desync);
        rec.push(StrategyFamily::SynFake);
    }
    if fp.vulnerable_to_frag {
        rec.push(StrategyFamily::Disorder);
        rec.push(StrategyFamily::Overlap);
        rec.push(StrategyFamily::TcpFrag);
        if fp.inspection == InspectionDepth::SniOnly {
            rec.push(StrategyFamily::ExtSplit);
        }
    }
    if fp.vulnerable_to_ttl {
        rec.push(StrategyFamily::FakeSni);
    }
    if fp.vulnerable_to_oob {
        rec.push(StrategyFamily::Oob);
    }

    match fp.dpi_type {
        DpiType::Tspu => {
            rec.push(StrategyFamily::Disorder);
            rec.push(StrategyFamily::Sack);
        }
        DpiType::Sandvine => {
            rec.push(StrategyFamily::SynFake);
            rec.push(StrategyFamily::Desync);
        }
        DpiType::Huawei | DpiType::Fortigate => {
            rec.push(StrategyFamily::Overlap);
            rec.push(StrategyFamily::ExtSplit);
            rec.push(StrategyFamily::IpFrag);
        }
        _ => {}
    }

    let mut seen = std::collections::HashSet::new();
    fp.recommended = rec.into_iter().filter(|f| seen.insert(*f)).collect();
}

/// Active prober against one domain
pub struct DpiProber {
    domain: String,
    reference_domain: String,
    timeout: Duration,
    client: reqwest::Client,
    no_redirect: reqwest::Client,
}

impl DpiProber {
    /// Build a prober for `domain`, comparing against a known-good
    /// reference domain.
    pub fn new(
        domain: impl Into<String>,
        reference_domain: impl Into<String>,
        timeout: Duration,
    ) -> crate::error::Result<Self> {
        let mk = |redirect: reqwest::redirect::Policy| {
            reqwest::Client::builder()
                .timeout(timeout)
                .danger_accept_invalid_certs(true)
                .redirect(redirect)
                .user_agent("Mozilla/5.0")
                .build()
        };
        let client = mk(reqwest::redirect::Policy::limited(4));
        let no_redirect = mk(reqwest::redirect::Policy::none());
        match (client, no_redirect) {
            (Ok(client), Ok(no_redirect)) => Ok(Self {
                domain: domain.into(),
                reference_domain: reference_domain.into(),
                timeout,
                client,
                no_redirect,
            }),
            (Err(e), _) | (_, Err(e)) => Err(crate::error::Error::Probe {
                probe: "fingerprint",
                message: e.to_string(),
            }),
        }
    }

    /// Run every probe family and derive the fingerprint.
    pub async fn fingerprint(&self) -> Fingerprint {
        let mut probes = HashMap::new();

        let baseline = self.probe_baseline().await;
        let blocked = baseline.blocked;
        probes.insert("baseline".to_string(), baseline);
        if !blocked {
            return derive(probes);
        }

        let rst = self.probe_rst().await;
        let rst_seen = rst.rst_ttl.is_some();
        probes.insert("rst_detection".to_string(), rst);

        if rst_seen {
            for i in 0..RST_SAMPLES {
                let sample = self.probe_rst().await;
                probes.insert(format!("rst_sample_{i}"), sample);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        } else {
            probes.insert(
                "redirect_detection".to_string(),
                self.probe_redirect().await,
            );
            probes.insert(
                "content_injection".to_string(),
                self.probe_content_injection().await,
            );
            probes.insert("tls_alert".to_string(), self.probe_tls_alert().await);
        }

        probes.insert("no_sni".to_string(), self.probe_no_sni().await);
        probes.insert("quic_blocking".to_string(), self.probe_quic().await);

        derive(probes)
    }

    async fn probe_baseline(&self) -> ProbeResult {
        let mut result = ProbeResult::named("baseline");

        let reference = self.https_probe(&self.reference_domain).await;
        if !reference.success {
            result.notes = Some("reference domain also failed".to_string());
            return result;
        }

        let target = self.https_probe(&self.domain).await;
        result.success = target.success;
        result.blocked = !target.success;
        result.latency_ms = target.latency_ms;
        result.error_kind = target.error_kind;
        result.http_code = target.http_code;
        result
    }

    async fn https_probe(&self, domain: &str) -> ProbeResult {
        let mut result = ProbeResult::named(&format!("https_{domain}"));
        let start = Instant::now();
        match self.client.get(format!("https://{domain}/")).send().await {
            Ok(response) => {
                result.success = true;
                result.http_code = Some(response.status().as_u16());
            }
            Err(err) => {
                result.error_kind = Some(categorize_error(&err.to_string()));
            }
        }
        result.latency_ms = start.elapsed().as_millis() as u64;
        result
    }

    /// TCP connect then TLS handshake; resets during either phase
    /// reveal an injector and its distance.
    async fn probe_rst(&self) -> ProbeResult {
        let mut result = ProbeResult::named("rst_detection");
        let start = Instant::now();

        let conn = tokio::time::timeout(
            self.timeout,
            TcpStream::connect((self.domain.as_str(), 443)),
        )
        .await;
        let stream = match conn {
            Err(_) => {
                result.latency_ms = start.elapsed().as_millis() as u64;
                result.error_kind = Some("timeout".to_string());
                return result;
            }
            Ok(Err(err)) => {
                let elapsed = start.elapsed();
                result.latency_ms = elapsed.as_millis() as u64;
                let kind = categorize_error(&err.to_string());
                if kind == "rst" {
                    result.rst_ttl = Some(estimate_rst_ttl(elapsed));
                }
                result.error_kind = Some(kind);
                return result;
            }
            Ok(Ok(stream)) => stream,
        };

        let connector = insecure_connector();
        let Ok(server_name) = ServerName::try_from(self.domain.clone()) else {
            result.error_kind = Some("tls_error".to_string());
            return result;
        };
        match tokio::time::timeout(self.timeout, connector.connect(server_name, stream)).await {
            Ok(Ok(_)) => result.success = true,
            Ok(Err(err)) => {
                let elapsed = start.elapsed();
                let kind = categorize_error(&err.to_string());
                if kind == "rst" {
                    result.error_kind = Some("rst_after_hello".to_string());
                    result.rst_ttl = Some(estimate_rst_ttl(elapsed));
                } else {
                    result.error_kind = Some("tls_error".to_string());
                }
            }
            Err(_) => result.error_kind = Some("timeout".to_string()),
        }
        result.latency_ms = start.elapsed().as_millis() as u64;
        result
    }

    async fn probe_redirect(&self) -> ProbeResult {
        let mut result = ProbeResult::named("redirect_detection");
        let start = Instant::now();

        match self
            .no_redirect
            .get(format!("http://{}/", self.domain))
            .send()
            .await
        {
            Ok(response) => {
                let code = response.status().as_u16();
                result.http_code = Some(code);
                if (300..400).contains(&code) {
                    let location = response
                        .headers()
                        .get(reqwest::header::LOCATION)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("");
                    if !location.is_empty() && !location.contains(&self.domain) {
                        result.blocked = true;
                        result.notes = Some(format!("redirect_to: {location}"));
                    }
                }
            }
            Err(_) => result.error_kind = Some("request_failed".to_string()),
        }
        result.latency_ms = start.elapsed().as_millis() as u64;
        result
    }

    async fn probe_content_injection(&self) -> ProbeResult {
        let mut result = ProbeResult::named("content_injection");
        let start = Instant::now();

        let response = match self
            .client
            .get(format!("https://{}/", self.domain))
            .send()
            .await
        {
            Ok(r) => r,
            Err(_) => {
                result.latency_ms = start.elapsed().as_millis() as u64;
                return result;
            }
        };

        let body = response.bytes().await.unwrap_or_default();
        result.latency_ms = start.elapsed().as_millis() as u64;
        let body = &body[..body.len().min(10 * 1024)];
        result.response_size = Some(body.len() as u64);

        let text = String::from_utf8_lossy(body).to_lowercase();
        const MARKERS: [&str; 6] = [
            "blocked",
            "access denied",
            "filtered",
            "запрещен",
            "заблокирован",
            "не доступ",
        ];
        if MARKERS.iter().any(|m| text.contains(m)) {
            result.blocked = true;
            result.notes = Some("content_injected".to_string());
        } else if result.latency_ms < 50 && body.len() < 1000 {
            result.notes = Some("possibly_injected".to_string());
        }
        result
    }

    async fn probe_tls_alert(&self) -> ProbeResult {
        let mut result = ProbeResult::named("tls_alert");

        let stream = match tokio::time::timeout(
            self.timeout,
            TcpStream::connect((self.domain.as_str(), 443)),
        )
        .await
        {
            Ok(Ok(s)) => s,
            _ => {
                result.error_kind = Some("connect_failed".to_string());
                return result;
            }
        };

        let start = Instant::now();
        let connector = insecure_connector();
        if let Ok(server_name) = ServerName::try_from(self.domain.clone()) {
            match tokio::time::timeout(self.timeout, connector.connect(server_name, stream)).await
            {
                Ok(Err(err)) if err.to_string().to_lowercase().contains("alert") => {
                    result.blocked = true;
                    result.notes = Some("tls_alert_received".to_string());
                }
                Ok(Ok(_)) => result.success = true,
                _ => {}
            }
        }
        result.latency_ms = start.elapsed().as_millis() as u64;
        result
    }

    /// Handshake to the resolved address without sending an SNI; if
    /// the server answers, only the name was being inspected.
    async fn probe_no_sni(&self) -> ProbeResult {
        let mut result = ProbeResult::named("no_sni");

        let addr = match tokio::net::lookup_host((self.domain.as_str(), 443))
            .await
            .ok()
            .and_then(|mut addrs| addrs.next())
        {
            Some(addr) => addr,
            None => {
                result.error_kind = Some("dns_failed".to_string());
                return result;
            }
        };

        let stream = match tokio::time::timeout(self.timeout, TcpStream::connect(addr)).await {
            Ok(Ok(s)) => s,
            _ => {
                result.error_kind = Some("connect_failed".to_string());
                return result;
            }
        };

        let start = Instant::now();
        let connector = insecure_connector();
        // an IP server name suppresses the server_name extension
        let server_name = ServerName::IpAddress(addr.ip().into());
        match tokio::time::timeout(self.timeout, connector.connect(server_name, stream)).await {
            Ok(Ok(_)) => {
                result.success = true;
                result.notes = Some("no_sni_works".to_string());
            }
            _ => result.error_kind = Some("tls_failed".to_string()),
        }
        result.latency_ms = start.elapsed().as_millis() as u64;
        result
    }

    /// A hollow QUIC Initial; silence where TCP 443 answers suggests
    /// QUIC is being dropped wholesale.
    async fn probe_quic(&self) -> ProbeResult {
        let mut result = ProbeResult::named("quic_blocking");

        let socket = match UdpSocket::bind("0.0.0.0:0").await {
            Ok(s) => s,
            Err(_) => {
                result.error_kind = Some("bind_failed".to_string());
                return result;
            }
        };
        if socket
            .connect((self.domain.as_str(), 443))
            .await
            .is_err()
        {
            result.blocked = true;
            result.error_kind = Some("connect_failed".to_string());
            return result;
        }

        let mut fake = [0u8; 100];
        fake[0] = 0xc0;
        if socket.send(&fake).await.is_err() {
            result.blocked = true;
            result.error_kind = Some("write_failed".to_string());
            return result;
        }

        let mut buf = [0u8; 1500];
        match tokio::time::timeout(self.timeout / 2, socket.recv(&mut buf)).await {
            Ok(Ok(_)) => result.success = true,
            _ => result.notes = Some("timeout_no_response".to_string()),
        }
        result
    }
}

/// Coarse error classes shared by every probe
pub fn categorize_error(err: &str) -> String {
    let err = err.to_lowercase();
    if err.contains("timed out") || err.contains("timeout") {
        "timeout"
    } else if err.contains("reset") {
        "rst"
    } else if err.contains("refused") {
        "refused"
    } else if err.contains("no route") {
        "no_route"
    } else if err.contains("certificate") || err.contains("tls") || err.contains("handshake") {
        "tls_error"
    } else {
        "other"
    }
    .to_string()
}

/// A TLS connector that accepts any certificate: probes measure
/// reachability and injected behavior, not authenticity.
fn insecure_connector() -> TlsConnector {
    use tokio_rustls::rustls::client::danger::{
        HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
    };
    use tokio_rustls::rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};

    #[derive(Debug)]
    struct NoVerify;

    impl ServerCertVerifier for NoVerify {
        fn verify_server_cert(
            &self,
            _end_entity: &tokio_rustls::rustls::pki_types::CertificateDer<'_>,
            _intermediates: &[tokio_rustls::rustls::pki_types::CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp: &[u8],
            _now: tokio_rustls::rustls::pki_types::UnixTime,
        ) -> Result<ServerCertVerified, tokio_rustls::rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &tokio_rustls::rustls::pki_types::CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &tokio_rustls::rustls::pki_types::CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            vec![
                SignatureScheme::ECDSA_NISTP256_SHA256,
                SignatureScheme::ECDSA_NISTP384_SHA384,
                SignatureScheme::ED25519,
                SignatureScheme::RSA_PKCS1_SHA256,
                SignatureScheme::RSA_PKCS1_SHA384,
                SignatureScheme::RSA_PKCS1_SHA512,
                SignatureScheme::RSA_PSS_SHA256,
                SignatureScheme::RSA_PSS_SHA384,
                SignatureScheme::RSA_PSS_SHA512,
            ]
        }
    }

    let config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerify))
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe(name: &str) -> ProbeResult {
        ProbeResult::named(name)
    }

    /// Scenario: baseline fails, RST 8ms after connect with TTL 58
    /// across five samples, no-SNI handshake succeeds.
    #[test]
    fn test_fingerprint_from_transcript() {
        let mut probes = HashMap::new();

        let mut baseline = probe("baseline");
        baseline.blocked = true;
        probes.insert("baseline".to_string(), baseline);

        let mut rst = probe("rst_detection");
        rst.error_kind = Some("rst".to_string());
        rst.rst_ttl = Some(58);
        rst.latency_ms = 8;
        probes.insert("rst_detection".to_string(), rst);

        for i in 0..5 {
            let mut sample = probe(&format!("rst_sample_{i}"));
            sample.error_kind = Some("rst".to_string());
            sample.rst_ttl = Some(58);
            sample.latency_ms = 8;
            probes.insert(format!("rst_sample_{i}"), sample);
        }

        let mut no_sni = probe("no_sni");
        no_sni.success = true;
        no_sni.notes = Some("no_sni_works".to_string());
        probes.insert("no_sni".to_string(), no_sni);

        let fp = derive(probes);
        assert_eq!(fp.dpi_type, DpiType::Tspu);
        assert_eq!(fp.blocking, BlockingMethod::RstInject);
        assert_eq!(fp.inspection, InspectionDepth::SniOnly);
        assert_eq!(fp.dpi_hop_count, 6);
        assert!(!fp.tracks_state);
        assert!(fp.vulnerable_to_frag);
        assert!(fp.vulnerable_to_ttl);
        assert_eq!(fp.recommended.first(), Some(&StrategyFamily::TcpFrag));
        assert_eq!(fp.optimal_ttl, Some(5));
        assert!(fp.confidence <= 95);
    }

    #[test]
    fn test_unblocked_baseline_short_circuits() {
        let mut probes = HashMap::new();
        let mut baseline = probe("baseline");
        baseline.success = true;
        baseline.blocked = false;
        probes.insert("baseline".to_string(), baseline);

        let fp = derive(probes);
        assert_eq!(fp.dpi_type, DpiType::None);
        assert_eq!(fp.blocking, BlockingMethod::None);
        assert_eq!(fp.confidence, 95);
    }

    #[test]
    fn test_timeout_blocking_recommends_oob() {
        let mut probes = HashMap::new();
        let mut baseline = probe("baseline");
        baseline.blocked = true;
        probes.insert("baseline".to_string(), baseline);

        let mut rst = probe("rst_detection");
        rst.error_kind = Some("timeout".to_string());
        probes.insert("rst_detection".to_string(), rst);

        let fp = derive(probes);
        assert_eq!(fp.blocking, BlockingMethod::Timeout);
        assert!(fp.vulnerable_to_oob);
        assert!(fp.recommended.contains(&StrategyFamily::Oob));
    }

    #[test]
    fn test_stateful_rst_recommends_desync() {
        let mut probes = HashMap::new();
        let mut baseline = probe("baseline");
        baseline.blocked = true;
        probes.insert("baseline".to_string(), baseline);

        let mut rst = probe("rst_detection");
        rst.error_kind = Some("rst_after_hello".to_string());
        rst.rst_ttl = Some(62);
        rst.latency_ms = 3;
        probes.insert("rst_detection".to_string(), rst);

        let fp = derive(probes);
        assert!(fp.tracks_state);
        assert_eq!(fp.inspection, InspectionDepth::Stateful);
        assert!(fp.vulnerable_to_desync);
        assert!(fp.recommended.contains(&StrategyFamily::Desync));
        // 64 - 62 = 2 hops, inline
        assert_eq!(fp.dpi_hop_count, 2);
        assert!(fp.is_inline);
    }

    #[test]
    fn test_estimate_rst_ttl_bands() {
        assert_eq!(estimate_rst_ttl(Duration::from_millis(2)), 62);
        assert_eq!(estimate_rst_ttl(Duration::from_millis(8)), 58);
        assert_eq!(estimate_rst_ttl(Duration::from_millis(30)), 50);
        assert_eq!(estimate_rst_ttl(Duration::from_millis(200)), 40);
    }

    #[test]
    fn test_hop_count_initial_ttl_guess() {
        assert_eq!(hop_count_from_ttl(58), 6);
        assert_eq!(hop_count_from_ttl(120), 8);
        assert_eq!(hop_count_from_ttl(250), 5);
        // never below one hop
        assert_eq!(hop_count_from_ttl(64), 1);
    }

    #[test]
    fn test_redirect_blocking() {
        let mut probes = HashMap::new();
        let mut baseline = probe("baseline");
        baseline.blocked = true;
        probes.insert("baseline".to_string(), baseline);

        probes.insert("rst_detection".to_string(), probe("rst_detection"));

        let mut redirect = probe("redirect_detection");
        redirect.blocked = true;
        redirect.http_code = Some(302);
        redirect.notes = Some("redirect_to: http://blockpage.example/".to_string());
        probes.insert("redirect_detection".to_string(), redirect);

        let fp = derive(probes);
        assert_eq!(fp.blocking, BlockingMethod::Redirect);
        assert!(fp.recommended.contains(&StrategyFamily::TcpFrag));
    }

    #[test]
    fn test_recommendations_deduplicated() {
        let mut probes = HashMap::new();
        let mut baseline = probe("baseline");
        baseline.blocked = true;
        probes.insert("baseline".to_string(), baseline);
        let mut rst = probe("rst_detection");
        rst.rst_ttl = Some(58);
        rst.latency_ms = 8;
        rst.error_kind = Some("rst".to_string());
        probes.insert("rst_detection".to_string(), rst);

        let fp = derive(probes);
        let mut unique = fp.recommended.clone();
        unique.dedup();
        assert_eq!(unique.len(), fp.recommended.len());
    }

    #[test]
    fn test_categorize_error() {
        assert_eq!(categorize_error("connection reset by peer"), "rst");
        assert_eq!(categorize_error("operation timed out"), "timeout");
        assert_eq!(categorize_error("connection refused"), "refused");
        assert_eq!(categorize_error("invalid certificate"), "tls_error");
        assert_eq!(categorize_error("weird"), "other");
    }
}
