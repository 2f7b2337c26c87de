//! Evasion strategy catalogue
//!
//! Each real-packet rewriting strategy is a variant of
//! [`StrategyTag`](crate::config::StrategyTag) with the uniform
//! signature `plan(packet, info, set, rng) -> Vec<Emission>`. Planning
//! is pure: it only builds buffers and delays, the actual sends happen
//! in [`engine`](crate::engine). A strategy that cannot apply to a
//! packet (payload too small, SNI absent) degrades to a less demanding
//! one and ultimately to emitting the packet unchanged, so a matched
//! flow is never starved.

mod combo;
mod disorder;
mod faking;
mod incoming;
mod ipfrag;
mod mutation;
mod overlap;
mod split;

pub use faking::{build_fake_client_hello, default_fake_payload};

use crate::config::{SetConfig, StrategyTag};
use crate::packet::PacketInfo;
use rand::Rng;
use std::time::Duration;

pub(crate) use faking::plan_desync;
pub(crate) use faking::plan_fakes;
pub(crate) use faking::plan_syn_fake;
pub(crate) use incoming::plan_incoming;
pub(crate) use mutation::mutate_client_hello;

/// One crafted packet awaiting transmission, plus the pause that
/// follows it
#[derive(Debug, Clone)]
pub struct Emission {
    /// Complete packet bytes, checksummed
    pub data: Vec<u8>,
    /// Sleep after this send before the next one
    pub delay_after: Duration,
}

impl Emission {
    /// An emission with no trailing delay
    pub fn immediate(data: Vec<u8>) -> Self {
        Self {
            data,
            delay_after: Duration::ZERO,
        }
    }

    /// An emission followed by a pause
    pub fn delayed(data: Vec<u8>, delay_after: Duration) -> Self {
        Self { data, delay_after }
    }
}

/// Emit the packet unchanged; the fallback every strategy bottoms
/// out at
pub(crate) fn passthrough(packet: &[u8]) -> Vec<Emission> {
    vec![Emission::immediate(packet.to_vec())]
}

/// Dispatch table over the strategy tags
pub fn plan_strategy<R: Rng>(
    tag: StrategyTag,
    packet: &[u8],
    info: &PacketInfo,
    set: &SetConfig,
    rng: &mut R,
) -> Vec<Emission> {
    match tag {
        StrategyTag::Tcp => split::plan_tcp(packet, info, set),
        StrategyTag::Ip => ipfrag::plan(packet, info, set),
        StrategyTag::ExtSplit => split::plan_ext_split(packet, info, set),
        StrategyTag::Oob => split::plan_oob(packet, info, set),
        StrategyTag::Disorder => disorder::plan(packet, info, set, rng),
        StrategyTag::Overlap => overlap::plan(packet, info, set, rng),
        StrategyTag::Combo => combo::plan(packet, info, set, rng),
    }
}

/// Every strategy tag, for exhaustive property tests
pub fn all_tags() -> [StrategyTag; 7] {
    [
        StrategyTag::Tcp,
        StrategyTag::Ip,
        StrategyTag::Combo,
        StrategyTag::Disorder,
        StrategyTag::Overlap,
        StrategyTag::ExtSplit,
        StrategyTag::Oob,
    ]
}


#[cfg(test)]
mod tests {
    use super::tests_support::*;
    use super::*;
    use crate::config::SetConfig;
    use crate::packet::{checksum, IpFamily, PacketInfo};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    /// Property: every emitted packet of every strategy carries valid
    /// checksums and a consistent length field.
    #[test]
    fn test_all_strategies_emit_valid_packets() {
        let packet = hello_packet("example.com", 1000);
        let info = PacketInfo::parse(&packet).unwrap();
        let set = SetConfig::default();

        for tag in all_tags() {
            let mut rng = StdRng::seed_from_u64(7);
            let emissions = plan_strategy(tag, &packet, &info, &set, &mut rng);
            assert!(!emissions.is_empty(), "{tag:?} emitted nothing");

            for e in &emissions {
                assert!(
                    checksum::verify_ipv4(&e.data, 20),
                    "{tag:?}: bad IPv4 checksum"
                );
                assert_eq!(
                    crate::packet::read_u16(&e.data, 2) as usize,
                    e.data.len(),
                    "{tag:?}: total length mismatch"
                );
            }
        }
    }

    /// Property: TCP-level strategies put PSH on exactly one segment,
    /// the one with the largest sequence number.
    #[test]
    fn test_psh_invariant() {
        let packet = hello_packet("example.com", 5000);
        let info = PacketInfo::parse(&packet).unwrap();
        let set = SetConfig::default();

        for tag in [
            crate::config::StrategyTag::Tcp,
            crate::config::StrategyTag::ExtSplit,
            crate::config::StrategyTag::Disorder,
            crate::config::StrategyTag::Combo,
            crate::config::StrategyTag::Overlap,
        ] {
            let mut rng = StdRng::seed_from_u64(11);
            let emissions = plan_strategy(tag, &packet, &info, &set, &mut rng);

            let psh: Vec<u32> = emissions
                .iter()
                .filter(|e| e.data[33] & 0x08 != 0)
                .map(|e| PacketInfo::parse(&e.data).unwrap().seq0)
                .collect();
            assert_eq!(psh.len(), 1, "{tag:?}: expected exactly one PSH segment");

            let max_seq = emissions
                .iter()
                .map(|e| PacketInfo::parse(&e.data).unwrap().seq0)
                .max()
                .unwrap();
            assert_eq!(psh[0], max_seq, "{tag:?}: PSH not on max-seq segment");
        }
    }

    /// Property: a sequence-space reassembly of the emitted segments
    /// reproduces the original payload for the non-poisoning TCP
    /// strategies.
    #[test]
    fn test_sequence_coverage() {
        let packet = hello_packet("example.com", 90_000);
        let info = PacketInfo::parse(&packet).unwrap();
        let set = SetConfig::default();

        for tag in [
            crate::config::StrategyTag::Tcp,
            crate::config::StrategyTag::ExtSplit,
            crate::config::StrategyTag::Disorder,
            crate::config::StrategyTag::Combo,
            crate::config::StrategyTag::Overlap,
        ] {
            let mut rng = StdRng::seed_from_u64(23);
            let emissions = plan_strategy(tag, &packet, &info, &set, &mut rng);
            let stream = reassemble(&emissions, info.seq0);
            assert_eq!(
                &stream,
                info.payload(&packet),
                "{tag:?}: reassembly diverges from the original payload"
            );
        }
    }

    #[test]
    fn test_tiny_payload_degrades_to_passthrough() {
        let packet = packet_with_payload(5, &[0xab; 4]);
        let info = PacketInfo::parse(&packet).unwrap();
        let set = SetConfig::default();

        for tag in all_tags() {
            let mut rng = StdRng::seed_from_u64(3);
            let emissions = plan_strategy(tag, &packet, &info, &set, &mut rng);
            let total: usize = emissions
                .iter()
                .map(|e| PacketInfo::parse(&e.data).unwrap().payload_len)
                .sum();
            assert!(total >= 4, "{tag:?} lost payload bytes");
            for e in &emissions {
                assert!(checksum::verify_tcp(&e.data, IpFamily::V4, 20));
            }
        }
    }
}
