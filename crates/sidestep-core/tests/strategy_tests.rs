//! Integration tests for the strategy catalogue
//!
//! Exercise the dispatch table the way the engine does and check the
//! wire-level invariants end to end: checksums, length fields,
//! sequence coverage and the PSH placement rule.

use sidestep_core::config::{SetConfig, StrategyTag};
use sidestep_core::packet::{checksum, IpFamily, PacketInfo};
use sidestep_core::strategies::{all_tags, plan_strategy, Emission};
use rand::rngs::StdRng;
use rand::SeedableRng;

mod test_helpers {
    /// TLS ClientHello record with the given SNI host
    pub fn client_hello(host: &str) -> Vec<u8> {
        let host = host.as_bytes();

        let mut exts = Vec::new();
        exts.extend_from_slice(&0u16.to_be_bytes());
        exts.extend_from_slice(&((host.len() + 5) as u16).to_be_bytes());
        exts.extend_from_slice(&((host.len() + 3) as u16).to_be_bytes());
        exts.push(0);
        exts.extend_from_slice(&(host.len() as u16).to_be_bytes());
        exts.extend_from_slice(host);
        exts.extend_from_slice(&0x002bu16.to_be_bytes());
        exts.extend_from_slice(&3u16.to_be_bytes());
        exts.extend_from_slice(&[0x02, 0x03, 0x04]);

        let mut body = Vec::new();
        body.extend_from_slice(&[0x03, 0x03]);
        body.extend_from_slice(&[0x42; 32]);
        body.push(0);
        body.extend_from_slice(&[0x00, 0x04, 0x13, 0x01, 0x13, 0x02]);
        body.extend_from_slice(&[0x01, 0x00]);
        body.extend_from_slice(&(exts.len() as u16).to_be_bytes());
        body.extend_from_slice(&exts);

        let mut hs = vec![0x01, 0, 0, 0];
        hs[1] = (body.len() >> 16) as u8;
        hs[2] = (body.len() >> 8) as u8;
        hs[3] = body.len() as u8;
        hs.extend_from_slice(&body);

        let mut record = vec![0x16, 0x03, 0x01, 0, 0];
        record[3] = (hs.len() >> 8) as u8;
        record[4] = hs.len() as u8;
        record.extend_from_slice(&hs);
        record
    }

    /// IPv4 TCP packet to port 443 carrying `payload`, checksums valid
    pub fn tcp_packet(seq: u32, payload: &[u8]) -> Vec<u8> {
        let total = 40 + payload.len();
        let mut pkt = vec![
            0x45, 0x00, (total >> 8) as u8, (total & 0xff) as u8,
            0x00, 0x01, 0x40, 0x00,
            0x40, 0x06, 0x00, 0x00,
            0xc0, 0xa8, 0x01, 0x64,
            0x5d, 0xb8, 0xd8, 0x22,
        ];
        pkt.extend_from_slice(&51000u16.to_be_bytes());
        pkt.extend_from_slice(&443u16.to_be_bytes());
        pkt.extend_from_slice(&seq.to_be_bytes());
        pkt.extend_from_slice(&0x2000u32.to_be_bytes());
        pkt.extend_from_slice(&[0x50, 0x18, 0xff, 0xff, 0x00, 0x00, 0x00, 0x00]);
        pkt.extend_from_slice(payload);
        sidestep_core::packet::checksum::fix_ipv4(&mut pkt, 20);
        sidestep_core::packet::checksum::fix_tcp_v4(&mut pkt, 20);
        pkt
    }

    /// Receiver-style reassembly: write segments in arrival order,
    /// later bytes win overlap regions
    pub fn reassemble(emissions: &[sidestep_core::strategies::Emission], seq0: u32) -> Vec<u8> {
        let mut stream: Vec<u8> = Vec::new();
        for e in emissions {
            let info = sidestep_core::packet::PacketInfo::parse(&e.data).unwrap();
            let rel = info.seq0.wrapping_sub(seq0) as usize;
            let payload = info.payload(&e.data);
            if rel + payload.len() > stream.len() {
                stream.resize(rel + payload.len(), 0);
            }
            stream[rel..rel + payload.len()].copy_from_slice(payload);
        }
        stream
    }
}

use test_helpers::{client_hello, reassemble, tcp_packet};

/// A 517-byte ClientHello split at byte 1: two packets, seq 1000 with
/// one byte then seq 1001 with the rest, checksums valid, PSH on the
/// second.
#[test]
fn test_scenario_tls_split() {
    let mut payload = client_hello("example.com");
    let pad = 517 - payload.len();
    payload.extend(std::iter::repeat(0u8).take(pad));
    let record_len = (payload.len() - 5) as u16;
    payload[3..5].copy_from_slice(&record_len.to_be_bytes());

    let packet = tcp_packet(1000, &payload);
    let info = PacketInfo::parse(&packet).unwrap();

    let mut set = SetConfig::default();
    set.fragmentation.strategy = StrategyTag::Tcp;
    set.fragmentation.split_pos = 1;
    set.fragmentation.middle_sni = false;
    set.fragmentation.reverse_order = false;
    set.tcp.seg2_delay_ms = 0;

    let mut rng = StdRng::seed_from_u64(1);
    let out = plan_strategy(StrategyTag::Tcp, &packet, &info, &set, &mut rng);
    assert_eq!(out.len(), 2);

    let first = PacketInfo::parse(&out[0].data).unwrap();
    let second = PacketInfo::parse(&out[1].data).unwrap();
    assert_eq!((first.seq0, first.payload_len), (1000, 1));
    assert_eq!((second.seq0, second.payload_len), (1001, 516));

    for e in &out {
        assert!(checksum::verify_ipv4(&e.data, 20));
        assert!(checksum::verify_tcp(&e.data, IpFamily::V4, 20));
    }
    assert_eq!(out[0].data[33] & 0x08, 0);
    assert_eq!(out[1].data[33] & 0x08, 0x08);
}

/// Overlap: segment one covers the payload through SNI-end plus two
/// with garbage over the SNI; segment two starts eight bytes before
/// the SNI and carries the real bytes.
#[test]
fn test_scenario_overlap() {
    let payload = client_hello("example.com");
    let packet = tcp_packet(1000, &payload);
    let info = PacketInfo::parse(&packet).unwrap();
    let sni = sidestep_core::sni::locate(&payload).unwrap();

    let set = SetConfig::default();
    let mut rng = StdRng::seed_from_u64(2);
    let out = plan_strategy(StrategyTag::Overlap, &packet, &info, &set, &mut rng);
    assert_eq!(out.len(), 2);

    let first = PacketInfo::parse(&out[0].data).unwrap();
    let second = PacketInfo::parse(&out[1].data).unwrap();

    assert_eq!(first.seq0, 1000);
    assert_eq!(first.payload_len, sni.end + 2);
    assert_ne!(
        &first.payload(&out[0].data)[sni.clone()],
        &payload[sni.clone()]
    );

    assert_eq!(second.seq0, 1000 + sni.start as u32 - 8);
    assert_eq!(second.payload_len, payload.len() - (sni.start - 8));

    for e in &out {
        assert!(checksum::verify_tcp(&e.data, IpFamily::V4, 20));
    }

    // a sequence-space receiver ends up with the real hello
    let stream = reassemble(&out, 1000);
    assert_eq!(stream, payload);
}

/// Every strategy, every emission: correct checksums and length
/// fields.
#[test]
fn test_catalogue_emits_valid_packets() {
    let payload = client_hello("target.example");
    let packet = tcp_packet(123_456, &payload);
    let info = PacketInfo::parse(&packet).unwrap();
    let set = SetConfig::default();

    for tag in all_tags() {
        let mut rng = StdRng::seed_from_u64(99);
        let out = plan_strategy(tag, &packet, &info, &set, &mut rng);
        assert!(!out.is_empty());
        for e in &out {
            assert!(
                checksum::verify_ipv4(&e.data, 20),
                "{tag:?} emitted a bad IPv4 checksum"
            );
            assert_eq!(
                u16::from_be_bytes([e.data[2], e.data[3]]) as usize,
                e.data.len(),
                "{tag:?} emitted an inconsistent total length"
            );
        }
    }
}

/// Sequence coverage: reassembling the TCP-level strategies yields the
/// original payload exactly.
#[test]
fn test_catalogue_sequence_coverage() {
    let payload = client_hello("target.example");
    let packet = tcp_packet(700_000, &payload);
    let info = PacketInfo::parse(&packet).unwrap();
    let set = SetConfig::default();

    for tag in [
        StrategyTag::Tcp,
        StrategyTag::ExtSplit,
        StrategyTag::Disorder,
        StrategyTag::Combo,
        StrategyTag::Overlap,
    ] {
        let mut rng = StdRng::seed_from_u64(5);
        let out = plan_strategy(tag, &packet, &info, &set, &mut rng);
        assert_eq!(
            reassemble(&out, 700_000),
            payload,
            "{tag:?} lost or corrupted payload bytes"
        );
    }
}

/// PSH sits on exactly one segment and that segment carries the
/// highest sequence number.
#[test]
fn test_catalogue_psh_rule() {
    let payload = client_hello("target.example");
    let packet = tcp_packet(42, &payload);
    let info = PacketInfo::parse(&packet).unwrap();
    let set = SetConfig::default();

    for tag in [
        StrategyTag::Tcp,
        StrategyTag::ExtSplit,
        StrategyTag::Disorder,
        StrategyTag::Combo,
        StrategyTag::Overlap,
    ] {
        let mut rng = StdRng::seed_from_u64(6);
        let out = plan_strategy(tag, &packet, &info, &set, &mut rng);

        let psh: Vec<&Emission> = out.iter().filter(|e| e.data[33] & 0x08 != 0).collect();
        assert_eq!(psh.len(), 1, "{tag:?} PSH count");

        let max_seq = out
            .iter()
            .map(|e| PacketInfo::parse(&e.data).unwrap().seq0)
            .max()
            .unwrap();
        assert_eq!(
            PacketInfo::parse(&psh[0].data).unwrap().seq0,
            max_seq,
            "{tag:?} PSH not on the max-sequence segment"
        );
    }
}
