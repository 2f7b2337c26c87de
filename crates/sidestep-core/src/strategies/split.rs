//! Two-segment splits: `tcp`, `ext-split` and `oob`
//!
//! The simplest members of the catalogue: cut the payload once and
//! transmit both halves, optionally higher-sequence first. `ext-split`
//! cuts at the extension preceding the SNI, `oob` poisons one payload
//! byte before cutting.

use super::{passthrough, Emission};
use crate::config::SetConfig;
use crate::packet::{segment, PacketInfo};
use crate::sni;
use std::time::Duration;
use tracing::trace;

/// Split `payload[..pos]` / `payload[pos..]` and order the two
/// segments for transmission.
fn split_emissions(
    packet: &[u8],
    info: &PacketInfo,
    payload: &[u8],
    pos: usize,
    set: &SetConfig,
) -> Vec<Emission> {
    let mut segs = [
        segment::build(packet, info, &payload[..pos], 0, 0),
        segment::build(packet, info, &payload[pos..], pos as u32, 1),
    ];
    segment::set_max_seq_psh(&mut segs, info.family, info.ip_header_len);

    if set.fragmentation.reverse_order {
        segs.reverse();
    }
    let delay = Duration::from_millis(set.tcp.seg2_delay_ms);
    let [first, second] = segs;
    vec![
        Emission::delayed(first.data, delay),
        Emission::immediate(second.data),
    ]
}

/// Split position for the `tcp` strategy: the middle of the SNI when
/// `middle_sni` is set and an SNI exists, the configured byte offset
/// otherwise.
fn tcp_split_pos(payload: &[u8], set: &SetConfig) -> usize {
    if set.fragmentation.middle_sni {
        if let Some(range) = sni::locate(payload) {
            return range.start + (range.end - range.start) / 2;
        }
    }
    set.fragmentation.split_pos
}

/// `tcp`: one split at the transport layer
pub fn plan_tcp(packet: &[u8], info: &PacketInfo, set: &SetConfig) -> Vec<Emission> {
    let payload = info.payload(packet);
    if payload.len() < 2 {
        return passthrough(packet);
    }

    let pos = tcp_split_pos(payload, set).clamp(1, payload.len() - 1);
    split_emissions(packet, info, payload, pos, set)
}

/// `ext-split`: cut at the first extension byte preceding the SNI
/// extension; falls back to `tcp` when the boundary is degenerate.
pub fn plan_ext_split(packet: &[u8], info: &PacketInfo, set: &SetConfig) -> Vec<Emission> {
    let payload = info.payload(packet);
    if payload.len() < 50 {
        return passthrough(packet);
    }

    match sni::pre_extension_split_point(payload) {
        Some(pos) if pos > 5 && pos < payload.len() - 10 => {
            split_emissions(packet, info, payload, pos, set)
        }
        _ => {
            trace!("ext-split boundary unusable, falling back to tcp split");
            plan_tcp(packet, info, set)
        }
    }
}

/// `oob`: write the poisoning byte at `oob_position`, then split right
/// after it so the first segment ends on the poison.
pub fn plan_oob(packet: &[u8], info: &PacketInfo, set: &SetConfig) -> Vec<Emission> {
    let payload_len = info.payload_len;
    if payload_len < 2 {
        return passthrough(packet);
    }

    let pos = set.fragmentation.oob_position.clamp(0, payload_len - 2);
    let mut poisoned = info.payload(packet).to_vec();
    poisoned[pos] = set.fragmentation.oob_char;

    split_emissions(packet, info, &poisoned, pos + 1, set)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SetConfig;
    use crate::packet::checksum;
    use crate::strategies::tests_support::{hello_packet, packet_with_payload};

    fn no_middle_sni() -> SetConfig {
        let mut set = SetConfig::default();
        set.fragmentation.middle_sni = false;
        set.fragmentation.reverse_order = false;
        set
    }

    /// Scenario: split-pos 1, no reverse, no delay; a 517-byte hello at
    /// seq 1000 becomes seq 1000 (1 byte) then seq 1001 (rest), PSH on
    /// the second.
    #[test]
    fn test_tcp_split_at_one() {
        let mut payload = crate::sni::tests_support::client_hello("example.com");
        payload.resize(517, 0);
        // keep the record length honest about the padding
        let body_len = (payload.len() - 5) as u16;
        payload[3..5].copy_from_slice(&body_len.to_be_bytes());
        let packet = packet_with_payload(1000, &payload);
        let info = PacketInfo::parse(&packet).unwrap();
        let set = no_middle_sni();

        let out = plan_tcp(&packet, &info, &set);
        assert_eq!(out.len(), 2);

        let first = PacketInfo::parse(&out[0].data).unwrap();
        let second = PacketInfo::parse(&out[1].data).unwrap();
        assert_eq!(first.seq0, 1000);
        assert_eq!(first.payload_len, 1);
        assert_eq!(second.seq0, 1001);
        assert_eq!(second.payload_len, 516);
        // PSH on the max-sequence segment only
        assert_eq!(out[0].data[33] & 0x08, 0);
        assert_eq!(out[1].data[33] & 0x08, 0x08);
        for e in &out {
            assert!(checksum::verify_ipv4(&e.data, 20));
            assert!(checksum::verify_tcp(&e.data, crate::packet::IpFamily::V4, 20));
        }
    }

    #[test]
    fn test_tcp_split_middle_sni() {
        let packet = hello_packet("example.com", 2000);
        let info = PacketInfo::parse(&packet).unwrap();
        let set = SetConfig::default(); // middle_sni on, reverse on

        let out = plan_tcp(&packet, &info, &set);
        assert_eq!(out.len(), 2);

        // reverse order: higher sequence first
        let first = PacketInfo::parse(&out[0].data).unwrap();
        let second = PacketInfo::parse(&out[1].data).unwrap();
        assert!(first.seq0 > second.seq0);

        // the split lands strictly inside the SNI bytes
        let range = crate::sni::locate(info.payload(&packet)).unwrap();
        let split = (first.seq0 - info.seq0) as usize;
        assert!(range.contains(&split));
    }

    #[test]
    fn test_seg2_delay_applied() {
        let packet = hello_packet("example.com", 1);
        let info = PacketInfo::parse(&packet).unwrap();
        let mut set = no_middle_sni();
        set.tcp.seg2_delay_ms = 7;

        let out = plan_tcp(&packet, &info, &set);
        assert_eq!(out[0].delay_after, Duration::from_millis(7));
        assert_eq!(out[1].delay_after, Duration::ZERO);
    }

    #[test]
    fn test_ext_split_before_sni() {
        let packet = hello_packet("example.com", 400);
        let info = PacketInfo::parse(&packet).unwrap();
        let set = no_middle_sni();

        let out = plan_ext_split(&packet, &info, &set);
        assert_eq!(out.len(), 2);
        let first = PacketInfo::parse(&out[0].data).unwrap();
        let split = sni::pre_extension_split_point(info.payload(&packet)).unwrap();
        assert_eq!(first.seq0, 400);
        assert_eq!(first.payload_len, split);
        // everything before the SNI host bytes stays in segment one
        let range = sni::locate(info.payload(&packet)).unwrap();
        assert!(split < range.start);
    }

    #[test]
    fn test_oob_poisons_one_byte() {
        let packet = hello_packet("example.com", 30);
        let info = PacketInfo::parse(&packet).unwrap();
        let mut set = no_middle_sni();
        set.fragmentation.oob_position = 1;
        set.fragmentation.oob_char = b'x';

        let out = plan_oob(&packet, &info, &set);
        let first = PacketInfo::parse(&out[0].data).unwrap();
        // first segment ends on the poison byte
        assert_eq!(first.payload_len, 2);
        assert_eq!(first.payload(&out[0].data)[1], b'x');
        // remaining bytes are untouched
        let second = PacketInfo::parse(&out[1].data).unwrap();
        assert_eq!(
            second.payload(&out[1].data),
            &info.payload(&packet)[2..]
        );
    }
}
