//! Discovery engine
//!
//! When the operator cannot predict which evasion will work against an
//! unknown DPI, the suite runs a directed search: baseline health
//! check, DPI fingerprint, fake-payload selection, preset search
//! filtered by the fingerprint, binary TTL narrowing on the winner and
//! a DNS-poisoning probe — then installs the winning configuration
//! into the worker pool. Progress streams through the
//! [`DiscoveryHub`](crate::hub::DiscoveryHub); cancellation is
//! observed between probes.

pub mod checker;
pub mod dns;
pub mod fingerprint;
pub mod presets;
pub mod ttl;

pub use checker::{CheckResult, CheckStatus, Checker};
pub use fingerprint::{DpiProber, Fingerprint};
pub use presets::{Preset, StrategyFamily};

use crate::config::{Config, FakePayloadKind, SetConfig};
use crate::error::{Error, Result};
use crate::hub::DiscoveryHub;
use crate::queue::Pool;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

/// One discovery run and its accumulating results
pub struct DiscoverySuite {
    /// Registry key
    pub id: String,
    /// Domain under test
    pub domain: String,
    /// URL fetched by every check
    pub check_url: String,
    status: RwLock<CheckStatus>,
    results: DashMap<String, CheckResult>,
    fingerprint: RwLock<Option<Fingerprint>>,
    dns: RwLock<Option<dns::DnsDiscoveryResult>>,
    best_preset: RwLock<Option<(String, f64)>>,
    cancel_tx: watch::Sender<bool>,
    cancel_rx: watch::Receiver<bool>,
}

impl DiscoverySuite {
    fn new(input: &str) -> Arc<Self> {
        let (domain, check_url) = parse_discovery_input(input);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        Arc::new(Self {
            id: Uuid::new_v4().to_string(),
            domain,
            check_url,
            status: RwLock::new(CheckStatus::Pending),
            results: DashMap::new(),
            fingerprint: RwLock::new(None),
            dns: RwLock::new(None),
            best_preset: RwLock::new(None),
            cancel_tx,
            cancel_rx,
        })
    }

    /// Current lifecycle state
    pub fn status(&self) -> CheckStatus {
        *self.status.read()
    }

    fn set_status(&self, status: CheckStatus) {
        *self.status.write() = status;
    }

    /// Request cancellation; the orchestrator observes it between
    /// probes, in-flight probes run to their own timeout.
    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
        self.set_status(CheckStatus::Canceled);
    }

    /// Whether cancellation was requested
    pub fn is_canceled(&self) -> bool {
        *self.cancel_rx.borrow()
    }

    fn record(&self, key: impl Into<String>, result: CheckResult) {
        let key = key.into();
        if result.ok() {
            let speed = result.speed;
            let mut best = self.best_preset.write();
            if best.as_ref().map(|(_, s)| speed > *s).unwrap_or(true) {
                *best = Some((key.clone(), speed));
            }
        }
        self.results.insert(key, result);
    }

    /// Results keyed by phase and preset name
    pub fn results(&self) -> Vec<(String, CheckResult)> {
        self.results
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// The fingerprint, once phase two completed
    pub fn fingerprint(&self) -> Option<Fingerprint> {
        self.fingerprint.read().clone()
    }

    /// The DNS probe conclusion, once it ran
    pub fn dns_result(&self) -> Option<dns::DnsDiscoveryResult> {
        self.dns.read().clone()
    }

    /// Best preset so far and its speed
    pub fn best(&self) -> Option<(String, f64)> {
        self.best_preset.read().clone()
    }
}

/// Live suites, keyed by id
#[derive(Default)]
pub struct SuiteRegistry {
    suites: DashMap<String, Arc<DiscoverySuite>>,
}

impl SuiteRegistry {
    /// Look a suite up
    pub fn get(&self, id: &str) -> Option<Arc<DiscoverySuite>> {
        self.suites.get(id).map(|s| s.clone())
    }

    /// Cancel a running suite; unknown ids are a no-op
    pub fn cancel(&self, id: &str) {
        if let Some(suite) = self.get(id) {
            if suite.status() == CheckStatus::Running {
                suite.cancel();
            }
        }
    }

    fn insert(&self, suite: Arc<DiscoverySuite>) {
        self.suites.insert(suite.id.clone(), suite);
    }
}

/// Discovery orchestrator bound to a worker pool
pub struct Discovery {
    pool: Arc<Pool>,
    hub: Arc<DiscoveryHub>,
    /// Suites this orchestrator has run
    pub registry: SuiteRegistry,
}

impl Discovery {
    /// Bind discovery to a pool and a progress hub
    pub fn new(pool: Arc<Pool>, hub: Arc<DiscoveryHub>) -> Self {
        Self {
            pool,
            hub,
            registry: SuiteRegistry::default(),
        }
    }

    /// Run the full suite against a domain or URL. The winning
    /// configuration is installed into the pool; on failure or
    /// cancellation the original configuration is restored.
    pub async fn run(&self, input: &str) -> Result<Arc<DiscoverySuite>> {
        let suite = DiscoverySuite::new(input);
        self.registry.insert(suite.clone());
        suite.set_status(CheckStatus::Running);
        self.hub.set_active(true);

        let original = self.pool.snapshot();
        let outcome = self.run_phases(&suite, &original).await;
        self.hub.set_active(false);

        match outcome {
            Ok(()) if suite.is_canceled() => {
                suite.set_status(CheckStatus::Canceled);
                self.restore(&original);
            }
            Ok(()) => suite.set_status(CheckStatus::Complete),
            Err(err) => {
                warn!(%err, domain = suite.domain, "discovery failed");
                suite.set_status(CheckStatus::Failed);
                self.restore(&original);
            }
        }
        Ok(suite)
    }

    fn restore(&self, original: &Arc<Config>) {
        if let Err(err) = self.pool.update_config((**original).clone()) {
            warn!(%err, "failed to restore configuration after discovery");
        }
    }

    async fn run_phases(&self, suite: &Arc<DiscoverySuite>, original: &Arc<Config>) -> Result<()> {
        let checker_cfg = original.system.checker.clone();
        let timeout = Duration::from_secs(checker_cfg.timeout_secs);
        let propagate = Duration::from_millis(checker_cfg.config_propagate_ms);
        let checker = Checker::new(timeout)?;

        // phase 1: the network itself must be healthy
        self.hub.log(format!("Phase Baseline: {}", checker_cfg.reference_url));
        let baseline = checker.fetch(&checker_cfg.reference_url).await;
        if !baseline.ok() {
            suite.record("baseline/reference", baseline);
            return Err(Error::Probe {
                probe: "baseline",
                message: "network_unhealthy".into(),
            });
        }
        suite.record("baseline/reference", baseline);
        if suite.is_canceled() {
            return Ok(());
        }

        // phase 2: fingerprint the DPI
        self.hub
            .log(format!("Phase Fingerprint: analyzing DPI for {}", suite.domain));
        let prober = DpiProber::new(&suite.domain, &checker_cfg.reference_domain, timeout)?;
        let fp = prober.fingerprint().await;
        self.hub.log(format!(
            "  fingerprint: type={:?} blocking={:?} confidence={}%",
            fp.dpi_type, fp.blocking, fp.confidence
        ));
        *suite.fingerprint.write() = Some(fp.clone());
        if suite.is_canceled() {
            return Ok(());
        }

        // phase 3: which fake payload moves bytes fastest
        let mut best_payload = FakePayloadKind::Default;
        let mut best_payload_speed = -1.0f64;
        for kind in [FakePayloadKind::Default, FakePayloadKind::Random] {
            if suite.is_canceled() {
                return Ok(());
            }
            let set = presets::payload_probe_set(&suite.domain, kind);
            let result = self
                .try_set(suite, original, &checker, set, propagate, &format!("payload/{kind:?}"))
                .await;
            if result.ok() && result.speed > best_payload_speed {
                best_payload_speed = result.speed;
                best_payload = kind;
            }
        }
        self.hub.log(format!("  best fake payload: {best_payload:?}"));

        // phase 4: walk the preset catalogue
        let mut candidates = presets::filter_by_fingerprint(presets::catalogue(), &fp);
        let mut best: Option<(Preset, f64)> = None;
        for preset in &mut candidates {
            if suite.is_canceled() {
                return Ok(());
            }
            presets::apply_fingerprint(preset, &fp);
            preset.set.faking.payload = best_payload;

            let set = presets::preset_set_for_domain(preset, &suite.domain);
            let result = self
                .try_set(
                    suite,
                    original,
                    &checker,
                    set,
                    propagate,
                    &format!("preset/{}", preset.name),
                )
                .await;
            self.hub.log(format!(
                "  preset {}: {:?} ({:.1} KB/s)",
                preset.name,
                result.status,
                result.speed / 1024.0
            ));
            if result.ok() && best.as_ref().map(|(_, s)| result.speed > *s).unwrap_or(true) {
                best = Some((preset.clone(), result.speed));
            }
        }

        let Some((mut winner, speed)) = best else {
            return Err(Error::Probe {
                probe: "preset_search",
                message: "no preset restored reachability".into(),
            });
        };
        self.hub.log(format!(
            "  best preset: {} ({:.1} KB/s)",
            winner.name,
            speed / 1024.0
        ));

        // phase 5: narrow the fake TTL on the winner
        if winner.set.faking.enabled && !suite.is_canceled() {
            self.hub.log("Phase TTL: binary search for the minimum working TTL");
            let (min_ttl, probed) = ttl::find_minimum_ttl(|candidate| {
                let mut set = presets::preset_set_for_domain(&winner, &suite.domain);
                set.faking.ttl = candidate;
                let key = format!("ttl/{candidate}");
                let checker = &checker;
                async move {
                    if suite.is_canceled() {
                        return false;
                    }
                    let result = self
                        .try_set(suite, original, &checker, set, propagate, &key)
                        .await;
                    result.ok()
                }
            })
            .await;
            self.hub.log(format!(
                "  TTL search probed {probed:?}, minimum: {min_ttl:?}"
            ));
            if let Some(ttl) = min_ttl {
                winner.set.faking.ttl = ttl;
            }
        }

        // phase 6: DNS poisoning
        if !suite.is_canceled() {
            self.hub
                .log(format!("Phase DNS: checking DNS poisoning for {}", suite.domain));
            let ops = dns::LiveDnsOps::new(
                suite.domain.clone(),
                timeout,
                propagate,
                self.pool.clone(),
            )?;
            let dns_result = dns::probe(&ops, &checker_cfg.reference_dns).await;
            if let Some(dns_cfg) = dns_result.to_dns_config() {
                self.hub.log(format!(
                    "  DNS bypass: server='{}' fragment={}",
                    dns_cfg.target_dns, dns_cfg.fragment_query
                ));
                winner.set.dns = dns_cfg;
            }
            *suite.dns.write() = Some(dns_result);
        }

        if suite.is_canceled() {
            return Ok(());
        }

        // phase 7: install the winner into the main set
        let mut config = (**original).clone();
        let winner_set = install_winner(&mut config, &winner, &suite.domain);
        self.pool.update_config(config)?;
        info!(
            preset = winner.name,
            domain = suite.domain,
            set = winner_set,
            "discovery winner installed"
        );
        self.hub
            .log(format!("Installed winning preset '{}'", winner.name));
        Ok(())
    }

    /// Push a single-set configuration, wait for it to take effect and
    /// time a check through it.
    async fn try_set(
        &self,
        suite: &DiscoverySuite,
        original: &Arc<Config>,
        checker: &Checker,
        set: SetConfig,
        propagate: Duration,
        key: &str,
    ) -> CheckResult {
        let mut test = (**original).clone();
        test.sets = vec![set];
        if let Err(err) = self.pool.update_config(test) {
            let result = CheckResult::failed(&suite.check_url, err.to_string());
            suite.record(key, result.clone());
            return result;
        }
        tokio::time::sleep(propagate).await;

        let result = checker.fetch(&suite.check_url).await;
        suite.record(key, result.clone());
        result
    }
}

/// Replace the main set's evasion settings with the winner's while
/// keeping the operator's target list, and add the probed domain.
/// Returns the id of the updated set.
fn install_winner(config: &mut Config, winner: &Preset, domain: &str) -> String {
    let Some(main) = config.main_set_mut() else {
        config.sets.push(presets::preset_set_for_domain(winner, domain));
        return config.sets[0].id.clone();
    };

    main.fragmentation = winner.set.fragmentation.clone();
    main.faking = winner.set.faking.clone();
    main.tcp = winner.set.tcp.clone();
    if winner.set.dns.enabled {
        main.dns = winner.set.dns.clone();
    }
    main.enabled = true;
    if !main.targets.sni_domains.iter().any(|d| d == domain) {
        main.targets.sni_domains.push(domain.to_string());
    }
    main.id.clone()
}

/// Split a discovery input into the bare domain and the URL checks
/// will fetch.
pub fn parse_discovery_input(input: &str) -> (String, String) {
    let trimmed = input.trim();
    let without_scheme = trimmed
        .strip_prefix("https://")
        .or_else(|| trimmed.strip_prefix("http://"))
        .unwrap_or(trimmed);
    let domain = without_scheme
        .split(['/', ':'])
        .next()
        .unwrap_or(without_scheme)
        .to_string();

    let check_url = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{domain}/")
    };
    (domain, check_url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_discovery_input() {
        assert_eq!(
            parse_discovery_input("video.example"),
            ("video.example".to_string(), "https://video.example/".to_string())
        );
        assert_eq!(
            parse_discovery_input("https://video.example/watch?v=1"),
            (
                "video.example".to_string(),
                "https://video.example/watch?v=1".to_string()
            )
        );
        assert_eq!(
            parse_discovery_input("http://host.example:8080/x"),
            ("host.example".to_string(), "http://host.example:8080/x".to_string())
        );
    }

    #[test]
    fn test_suite_lifecycle() {
        let suite = DiscoverySuite::new("video.example");
        assert_eq!(suite.status(), CheckStatus::Pending);
        assert!(!suite.is_canceled());

        suite.cancel();
        assert!(suite.is_canceled());
        assert_eq!(suite.status(), CheckStatus::Canceled);
    }

    #[test]
    fn test_best_preset_tracking() {
        let suite = DiscoverySuite::new("video.example");

        let mut slow = CheckResult::failed("x", "nope");
        slow.status = CheckStatus::Complete;
        slow.speed = 100.0;
        suite.record("preset/slow", slow);

        let mut fast = CheckResult::failed("x", "nope");
        fast.status = CheckStatus::Complete;
        fast.speed = 900.0;
        suite.record("preset/fast", fast);

        let failed = CheckResult::failed("x", "down");
        suite.record("preset/failed", failed);

        let (name, speed) = suite.best().unwrap();
        assert_eq!(name, "preset/fast");
        assert!((speed - 900.0).abs() < f64::EPSILON);
        assert_eq!(suite.results().len(), 3);
    }

    #[test]
    fn test_registry_cancel_unknown_is_noop() {
        let registry = SuiteRegistry::default();
        registry.cancel("not-there");
        assert!(registry.get("not-there").is_none());
    }

    #[test]
    fn test_install_winner_keeps_targets() {
        let mut config = Config::default();
        config.sets[0].targets.sni_domains = vec!["existing.example".to_string()];

        let winner = presets::catalogue().into_iter().next().unwrap();
        install_winner(&mut config, &winner, "blocked.example");

        let main = config.main_set().unwrap();
        assert!(main.targets.sni_domains.contains(&"existing.example".to_string()));
        assert!(main.targets.sni_domains.contains(&"blocked.example".to_string()));
        assert_eq!(main.fragmentation.strategy, winner.set.fragmentation.strategy);
    }
}
