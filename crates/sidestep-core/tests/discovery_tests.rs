//! Integration tests for the discovery engine
//!
//! Synthetic transcripts drive the same code paths the live probes
//! feed: fingerprint derivation, TTL binary search convergence, the
//! DNS probe sequence and preset filtering.

use sidestep_core::discovery::dns::{self, DnsOps};
use sidestep_core::discovery::fingerprint::{
    derive, BlockingMethod, DpiType, InspectionDepth, ProbeResult,
};
use sidestep_core::discovery::presets;
use sidestep_core::discovery::ttl::find_minimum_ttl;
use sidestep_core::discovery::StrategyFamily;
use std::collections::HashMap;

fn blocked_baseline() -> (String, ProbeResult) {
    let mut p = ProbeResult::default();
    p.probe = "baseline".to_string();
    p.blocked = true;
    ("baseline".to_string(), p)
}

/// Baseline fails, RSTs arrive 8 ms after connect carrying an
/// estimated TTL of 58 across five samples, and the no-SNI handshake
/// succeeds: a TSPU-style SNI-only injector six hops away.
#[test]
fn test_scenario_fingerprint() {
    let mut probes = HashMap::new();
    probes.extend([blocked_baseline()]);

    let mut rst = ProbeResult::default();
    rst.probe = "rst_detection".to_string();
    rst.error_kind = Some("rst".to_string());
    rst.rst_ttl = Some(58);
    rst.latency_ms = 8;
    probes.insert("rst_detection".to_string(), rst.clone());
    for i in 0..5 {
        let mut sample = rst.clone();
        sample.probe = format!("rst_sample_{i}");
        probes.insert(sample.probe.clone(), sample);
    }

    let mut no_sni = ProbeResult::default();
    no_sni.probe = "no_sni".to_string();
    no_sni.success = true;
    probes.insert("no_sni".to_string(), no_sni);

    let fp = derive(probes);
    assert_eq!(fp.dpi_type, DpiType::Tspu);
    assert_eq!(fp.blocking, BlockingMethod::RstInject);
    assert_eq!(fp.inspection, InspectionDepth::SniOnly);
    assert_eq!(fp.dpi_hop_count, 6);
    assert!(fp.vulnerable_to_frag);
    assert_eq!(fp.recommended.first(), Some(&StrategyFamily::TcpFrag));
}

/// Success predicate `ttl >= 7`: probes 16, 8, 4, 6, 7 and lands on 7.
#[tokio::test]
async fn test_scenario_ttl_search() {
    let (best, probed) = find_minimum_ttl(|ttl| async move { ttl >= 7 }).await;
    assert_eq!(best, Some(7));
    assert_eq!(probed, vec![16, 8, 4, 6, 7]);
}

/// The system resolver returns a poisoned address; the reference
/// resolver at 1.1.1.1 returns an address that passes TLS
/// verification.
#[tokio::test]
async fn test_scenario_dns_poison() {
    struct Script;

    impl DnsOps for Script {
        async fn reference_ips(&self) -> Vec<String> {
            vec!["93.184.216.34".to_string()]
        }
        async fn resolve(&self, server: &str) -> Option<String> {
            match server {
                "" => Some("10.0.0.1".to_string()),
                "1.1.1.1" => Some("93.184.216.34".to_string()),
                _ => None,
            }
        }
        async fn resolve_fragmented(&self, _server: &str) -> Option<String> {
            None
        }
        async fn verify_ip(&self, ip: &str) -> bool {
            ip == "93.184.216.34"
        }
    }

    let reference = vec!["1.1.1.1".to_string(), "8.8.8.8".to_string()];
    let result = dns::probe(&Script, &reference).await;

    assert!(result.is_poisoned);
    assert_eq!(result.best_server, "1.1.1.1");
    assert!(!result.needs_fragment);

    let config = result.to_dns_config().unwrap();
    assert!(config.enabled);
    assert_eq!(config.target_dns, "1.1.1.1");
    assert!(!config.fragment_query);
}

/// Fingerprint filtering keeps recommended families plus the baseline
/// presets, and tunes kept presets with the discovered TTL.
#[test]
fn test_preset_filtering_and_tuning() {
    let mut probes = HashMap::new();
    probes.extend([blocked_baseline()]);
    let mut rst = ProbeResult::default();
    rst.probe = "rst_detection".to_string();
    rst.rst_ttl = Some(58);
    rst.latency_ms = 8;
    rst.error_kind = Some("rst".to_string());
    probes.insert("rst_detection".to_string(), rst);
    let fp = derive(probes);

    let kept = presets::filter_by_fingerprint(presets::catalogue(), &fp);
    assert!(!kept.is_empty());
    assert!(kept.iter().any(|p| p.family == StrategyFamily::None));
    for preset in &kept {
        assert!(
            preset.family == StrategyFamily::None || fp.recommended.contains(&preset.family),
            "preset {} outside recommendations",
            preset.name
        );
    }

    let mut tunable = kept
        .into_iter()
        .find(|p| p.set.faking.enabled)
        .expect("a faking preset survives");
    presets::apply_fingerprint(&mut tunable, &fp);
    if let Some(ttl) = fp.optimal_ttl {
        assert_eq!(tunable.set.faking.ttl, ttl);
    }
}

/// An unblocked baseline produces a none-fingerprint that leaves the
/// catalogue untouched.
#[test]
fn test_unblocked_keeps_catalogue() {
    let mut probes = HashMap::new();
    let mut baseline = ProbeResult::default();
    baseline.probe = "baseline".to_string();
    baseline.success = true;
    probes.insert("baseline".to_string(), baseline);

    let fp = derive(probes);
    assert_eq!(fp.dpi_type, DpiType::None);

    let n = presets::catalogue().len();
    assert_eq!(presets::filter_by_fingerprint(presets::catalogue(), &fp).len(), n);
}
