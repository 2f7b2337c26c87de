//! Strategy presets
//!
//! A preset is a named, ordered combination of fragmentation, faking
//! and TCP settings that defines one candidate evasion. The search
//! walks the catalogue, filtered by the fingerprint's recommended
//! families, and times a check under each.

use crate::config::{
    DesyncMode, FakePayloadKind, FakingStrategy, SetConfig, ShuffleMode, StrategyTag,
};
use crate::discovery::fingerprint::Fingerprint;
use serde::{Deserialize, Serialize};

/// Coarse strategy families the fingerprinter reasons in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyFamily {
    /// Baseline presets, always kept in the search
    None,
    /// Transport-layer splits
    TcpFrag,
    /// Network-layer fragmentation
    IpFrag,
    /// Multi-point combo splits
    Combo,
    /// Out-of-order segments
    Disorder,
    /// Overlapping sequence space
    Overlap,
    /// Splits at extension boundaries
    ExtSplit,
    /// Fake ClientHello pre-emission
    FakeSni,
    /// Payload poisoning
    Oob,
    /// Connection-state desynchronization
    Desync,
    /// SYN-carried decoys
    SynFake,
    /// SACK removal
    Sack,
}

/// One candidate evasion
#[derive(Debug, Clone)]
pub struct Preset {
    /// Stable name, also the key in suite results
    pub name: &'static str,
    /// Operator-facing description
    pub description: &'static str,
    /// Family used for fingerprint filtering
    pub family: StrategyFamily,
    /// Lower tries earlier
    pub priority: u8,
    /// The set configuration this preset installs
    pub set: SetConfig,
}

fn base_set() -> SetConfig {
    let mut set = SetConfig::default();
    set.faking.enabled = false;
    set.fragmentation.middle_sni = true;
    set.fragmentation.reverse_order = false;
    set
}

/// The built-in catalogue, ordered by priority
pub fn catalogue() -> Vec<Preset> {
    let mut presets = vec![
        Preset {
            name: "tcp-split-sni",
            description: "single split in the middle of the SNI",
            family: StrategyFamily::TcpFrag,
            priority: 10,
            set: {
                let mut s = base_set();
                s.fragmentation.strategy = StrategyTag::Tcp;
                s
            },
        },
        Preset {
            name: "tcp-split-first-byte",
            description: "split after the first payload byte",
            family: StrategyFamily::TcpFrag,
            priority: 11,
            set: {
                let mut s = base_set();
                s.fragmentation.strategy = StrategyTag::Tcp;
                s.fragmentation.middle_sni = false;
                s.fragmentation.split_pos = 1;
                s
            },
        },
        Preset {
            name: "tcp-split-reverse",
            description: "SNI split, higher sequence first",
            family: StrategyFamily::TcpFrag,
            priority: 12,
            set: {
                let mut s = base_set();
                s.fragmentation.strategy = StrategyTag::Tcp;
                s.fragmentation.reverse_order = true;
                s
            },
        },
        Preset {
            name: "fake-ttl",
            description: "short-lived fake hello before an SNI split",
            family: StrategyFamily::FakeSni,
            priority: 20,
            set: {
                let mut s = base_set();
                s.fragmentation.strategy = StrategyTag::Tcp;
                s.faking.enabled = true;
                s.faking.strategy = FakingStrategy::Ttl;
                s.faking.ttl = 8;
                s
            },
        },
        Preset {
            name: "fake-pastseq",
            description: "stale-sequence fake hello before an SNI split",
            family: StrategyFamily::FakeSni,
            priority: 21,
            set: {
                let mut s = base_set();
                s.fragmentation.strategy = StrategyTag::Tcp;
                s.faking.enabled = true;
                s.faking.strategy = FakingStrategy::PastSeq;
                s
            },
        },
        Preset {
            name: "fake-badsum",
            description: "checksum-corrupted fake hello",
            family: StrategyFamily::FakeSni,
            priority: 22,
            set: {
                let mut s = base_set();
                s.fragmentation.strategy = StrategyTag::Tcp;
                s.faking.enabled = true;
                s.faking.strategy = FakingStrategy::TcpCheck;
                s
            },
        },
        Preset {
            name: "disorder-full",
            description: "SNI-boundary segments, shuffled",
            family: StrategyFamily::Disorder,
            priority: 30,
            set: {
                let mut s = base_set();
                s.fragmentation.strategy = StrategyTag::Disorder;
                s
            },
        },
        Preset {
            name: "disorder-seqovl",
            description: "reversed segments with a sequence overlap",
            family: StrategyFamily::Disorder,
            priority: 31,
            set: {
                let mut s = base_set();
                s.fragmentation.strategy = StrategyTag::Disorder;
                s.fragmentation.disorder.shuffle_mode = ShuffleMode::Reverse;
                s.fragmentation.seq_overlap_pattern = "\u{0}\u{0}\u{0}\u{0}".into();
                s
            },
        },
        Preset {
            name: "overlap-garbage-sni",
            description: "garbage SNI overwritten by the real one",
            family: StrategyFamily::Overlap,
            priority: 40,
            set: {
                let mut s = base_set();
                s.fragmentation.strategy = StrategyTag::Overlap;
                s
            },
        },
        Preset {
            name: "ext-split",
            description: "split at the extension before the SNI",
            family: StrategyFamily::ExtSplit,
            priority: 41,
            set: {
                let mut s = base_set();
                s.fragmentation.strategy = StrategyTag::ExtSplit;
                s
            },
        },
        Preset {
            name: "ip-frag",
            description: "network-layer fragmentation",
            family: StrategyFamily::IpFrag,
            priority: 50,
            set: {
                let mut s = base_set();
                s.fragmentation.strategy = StrategyTag::Ip;
                s.fragmentation.split_pos = 8;
                s
            },
        },
        Preset {
            name: "combo",
            description: "multi-point split, shuffle and pacing",
            family: StrategyFamily::Combo,
            priority: 60,
            set: {
                let mut s = base_set();
                s.fragmentation.strategy = StrategyTag::Combo;
                s.faking.enabled = true;
                s.faking.strategy = FakingStrategy::PastSeq;
                s
            },
        },
        Preset {
            name: "oob-poison",
            description: "poisoning byte before the split",
            family: StrategyFamily::Oob,
            priority: 70,
            set: {
                let mut s = base_set();
                s.fragmentation.strategy = StrategyTag::Oob;
                s
            },
        },
        Preset {
            name: "desync-rst",
            description: "low-TTL RSTs before the real hello",
            family: StrategyFamily::Desync,
            priority: 80,
            set: {
                let mut s = base_set();
                s.fragmentation.strategy = StrategyTag::Tcp;
                s.tcp.desync = DesyncMode::Rst;
                s
            },
        },
        Preset {
            name: "syn-fake",
            description: "decoy payload on a copied SYN",
            family: StrategyFamily::SynFake,
            priority: 85,
            set: {
                let mut s = base_set();
                s.fragmentation.strategy = StrategyTag::Tcp;
                s.tcp.syn_fake = true;
                s.tcp.syn_fake_len = 16;
                s
            },
        },
        Preset {
            name: "sack-strip",
            description: "SNI split with SACK options removed",
            family: StrategyFamily::Sack,
            priority: 86,
            set: {
                let mut s = base_set();
                s.fragmentation.strategy = StrategyTag::Tcp;
                s.tcp.strip_sack = true;
                s
            },
        },
        Preset {
            name: "baseline",
            description: "no evasion, for comparison",
            family: StrategyFamily::None,
            priority: 5,
            set: {
                let mut s = base_set();
                s.fragmentation.strategy = StrategyTag::Tcp;
                s.fragmentation.middle_sni = false;
                s.fragmentation.split_pos = 1;
                s
            },
        },
    ];
    presets.sort_by_key(|p| p.priority);
    presets
}

/// Retain presets whose family the fingerprint recommends; baseline
/// (`none`-family) presets always stay.
pub fn filter_by_fingerprint(presets: Vec<Preset>, fp: &Fingerprint) -> Vec<Preset> {
    if fp.recommended.is_empty() {
        return presets;
    }
    let before = presets.len();
    let kept: Vec<Preset> = presets
        .into_iter()
        .filter(|p| p.family == StrategyFamily::None || fp.recommended.contains(&p.family))
        .collect();
    tracing::info!(before, after = kept.len(), "fingerprint preset filtering");
    kept
}

/// Fold fingerprint findings into a preset before trying it
pub fn apply_fingerprint(preset: &mut Preset, fp: &Fingerprint) {
    if let Some(ttl) = fp.optimal_ttl {
        if preset.set.faking.enabled {
            preset.set.faking.ttl = ttl;
        }
    }
    if fp.tracks_state && preset.set.tcp.desync == DesyncMode::Off {
        preset.set.tcp.desync = DesyncMode::Rst;
        preset.set.tcp.desync_ttl = fp.optimal_ttl.unwrap_or(3);
        preset.set.tcp.desync_count = 2;
    }
}

/// A set configured to target one domain with this preset
pub fn preset_set_for_domain(preset: &Preset, domain: &str) -> SetConfig {
    let mut set = preset.set.clone();
    set.id = format!("discovery-{}", preset.name);
    set.name = preset.name.to_string();
    set.enabled = true;
    set.targets.sni_domains = vec![domain.to_string(), format!("*.{domain}")];
    set
}

/// The default set used while probing fake payload kinds
pub fn payload_probe_set(domain: &str, payload: FakePayloadKind) -> SetConfig {
    let mut set = preset_set_for_domain(
        &Preset {
            name: "payload-probe",
            description: "fake payload selection",
            family: StrategyFamily::FakeSni,
            priority: 0,
            set: base_set(),
        },
        domain,
    );
    set.fragmentation.strategy = StrategyTag::Tcp;
    set.faking.enabled = true;
    set.faking.payload = payload;
    set
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::fingerprint::Fingerprint;

    #[test]
    fn test_catalogue_sorted_and_unique() {
        let presets = catalogue();
        assert!(presets.len() >= 12);
        let mut names: Vec<_> = presets.iter().map(|p| p.name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), presets.len());

        let priorities: Vec<u8> = presets.iter().map(|p| p.priority).collect();
        let mut sorted = priorities.clone();
        sorted.sort_unstable();
        assert_eq!(priorities, sorted);
    }

    #[test]
    fn test_filter_keeps_baselines() {
        let mut fp = Fingerprint::default();
        fp.recommended = vec![StrategyFamily::Disorder];

        let kept = filter_by_fingerprint(catalogue(), &fp);
        assert!(kept.iter().any(|p| p.family == StrategyFamily::None));
        assert!(kept
            .iter()
            .all(|p| matches!(p.family, StrategyFamily::None | StrategyFamily::Disorder)));
    }

    #[test]
    fn test_filter_noop_without_recommendations() {
        let fp = Fingerprint::default();
        let all = catalogue();
        let n = all.len();
        assert_eq!(filter_by_fingerprint(all, &fp).len(), n);
    }

    #[test]
    fn test_apply_fingerprint_ttl() {
        let mut fp = Fingerprint::default();
        fp.optimal_ttl = Some(5);
        fp.tracks_state = true;

        let mut preset = catalogue()
            .into_iter()
            .find(|p| p.name == "fake-ttl")
            .unwrap();
        apply_fingerprint(&mut preset, &fp);
        assert_eq!(preset.set.faking.ttl, 5);
        assert_eq!(preset.set.tcp.desync, DesyncMode::Rst);
    }

    #[test]
    fn test_preset_set_targets_domain() {
        let preset = &catalogue()[0];
        let set = preset_set_for_domain(preset, "blocked.example");
        assert!(set.enabled);
        assert!(set
            .targets
            .sni_domains
            .contains(&"blocked.example".to_string()));
        assert!(set
            .targets
            .sni_domains
            .contains(&"*.blocked.example".to_string()));
    }
}
