//! Fake-SNI pre-emission, SYN fakes and desync packets
//!
//! Fakes are crafted to be *processed by the DPI but never by the
//! server*: they expire early (`ttl`), live in stale or future
//! sequence space (`pastseq`/`randseq`), fail checksum validation at
//! the first honest hop (`tcp_check`) or carry an unverifiable MD5
//! signature option (`md5sum`). The DPI records the decoy host; the
//! real segments follow.

use super::Emission;
use crate::config::{DesyncMode, FakePayloadKind, FakingStrategy, SetConfig};
use crate::packet::{self, options, IpFamily, PacketInfo};
use rand::Rng;
use tracing::trace;

/// Default sequence displacement into already-acknowledged space
const DEFAULT_PASTSEQ_OFFSET: u32 = 10_000;
/// Default displacement into future unacknowledged space
const DEFAULT_RANDSEQ_OFFSET: u32 = 100_000;

/// Decoy host carried by the canned fake ClientHello
const DECOY_HOST: &str = "www.wikipedia.org";

/// Build a plausible ClientHello record for an arbitrary host: TLS 1.2
/// record around a TLS 1.3 hello with SNI first, the shape every DPI
/// classifier accepts.
pub fn build_fake_client_hello(host: &str) -> Vec<u8> {
    let host = host.as_bytes();

    let mut exts = Vec::new();
    // server_name
    exts.extend_from_slice(&0u16.to_be_bytes());
    exts.extend_from_slice(&((host.len() + 5) as u16).to_be_bytes());
    exts.extend_from_slice(&((host.len() + 3) as u16).to_be_bytes());
    exts.push(0);
    exts.extend_from_slice(&(host.len() as u16).to_be_bytes());
    exts.extend_from_slice(host);
    // supported_groups
    exts.extend_from_slice(&0x000au16.to_be_bytes());
    exts.extend_from_slice(&8u16.to_be_bytes());
    exts.extend_from_slice(&[0x00, 0x06, 0x00, 0x1d, 0x00, 0x17, 0x00, 0x18]);
    // supported_versions: TLS 1.3, 1.2
    exts.extend_from_slice(&0x002bu16.to_be_bytes());
    exts.extend_from_slice(&5u16.to_be_bytes());
    exts.extend_from_slice(&[0x04, 0x03, 0x04, 0x03, 0x03]);

    let mut body = Vec::with_capacity(128 + host.len());
    body.extend_from_slice(&[0x03, 0x03]);
    body.extend_from_slice(&[0x5a; 32]); // fixed client random
    body.push(0);
    body.extend_from_slice(&[0x00, 0x06, 0x13, 0x01, 0x13, 0x02, 0x13, 0x03]);
    body.extend_from_slice(&[0x01, 0x00]);
    body.extend_from_slice(&(exts.len() as u16).to_be_bytes());
    body.extend_from_slice(&exts);

    let mut record = Vec::with_capacity(body.len() + 9);
    record.extend_from_slice(&[0x16, 0x03, 0x01]);
    record.extend_from_slice(&((body.len() + 4) as u16).to_be_bytes());
    record.push(0x01);
    record.push((body.len() >> 16) as u8);
    record.push((body.len() >> 8) as u8);
    record.push(body.len() as u8);
    record.extend_from_slice(&body);
    record
}

/// The canned fake payload
pub fn default_fake_payload() -> Vec<u8> {
    build_fake_client_hello(DECOY_HOST)
}

/// Resolve the configured fake payload kind into bytes
fn fake_payload<R: Rng>(set: &SetConfig, rng: &mut R) -> Vec<u8> {
    match set.faking.payload {
        FakePayloadKind::Default => default_fake_payload(),
        FakePayloadKind::Random => {
            let mut buf = vec![0u8; default_fake_payload().len()];
            rng.fill(buf.as_mut_slice());
            buf
        }
        FakePayloadKind::Custom => match hex::decode(&set.faking.custom_payload) {
            Ok(bytes) if !bytes.is_empty() => bytes,
            _ => {
                // validated at the control-plane boundary; a stale blob
                // degrades to the canned payload
                trace!("custom fake payload unusable, using default");
                default_fake_payload()
            }
        },
    }
}

/// Swap the packet payload for `fake` and finalize lengths/checksums
fn repack_with_payload(packet: &[u8], info: &PacketInfo, fake: &[u8], index: u16) -> Vec<u8> {
    let mut out = Vec::with_capacity(info.payload_start + fake.len());
    out.extend_from_slice(&packet[..info.payload_start]);
    out.extend_from_slice(fake);
    if info.family == IpFamily::V4 {
        let id = packet::read_u16(&out, 4).wrapping_add(index);
        packet::write_u16(&mut out, 4, id);
    }
    info.family.set_length(&mut out, info.ip_header_len);
    info.family.fix_tcp_checksums(&mut out, info.ip_header_len);
    out
}

/// Apply the faking strategy to a finalized fake packet
fn apply_strategy(buf: &mut Vec<u8>, info: &PacketInfo, set: &SetConfig) {
    match set.faking.strategy {
        FakingStrategy::Ttl => {
            buf[info.family.ttl_offset()] = set.faking.ttl;
            info.family.fix_tcp_checksums(buf, info.ip_header_len);
        }
        FakingStrategy::PastSeq => {
            let offset = match set.faking.seq_offset {
                0 => DEFAULT_PASTSEQ_OFFSET,
                o => o,
            };
            let seq = packet::tcp_seq(buf, info.ip_header_len).wrapping_sub(offset);
            packet::set_tcp_seq(buf, info.ip_header_len, seq);
            info.family.fix_tcp_checksums(buf, info.ip_header_len);
        }
        FakingStrategy::RandSeq => {
            let offset = match set.faking.seq_offset {
                0 => DEFAULT_RANDSEQ_OFFSET,
                o => o,
            };
            let seq = packet::tcp_seq(buf, info.ip_header_len).wrapping_add(offset);
            packet::set_tcp_seq(buf, info.ip_header_len, seq);
            info.family.fix_tcp_checksums(buf, info.ip_header_len);
        }
        FakingStrategy::TcpCheck => {
            // flip one checksum byte after everything else is fixed
            buf[info.ip_header_len + 16] ^= 0xff;
        }
        FakingStrategy::Md5Sum => {
            *buf = options::append_md5sig(buf, info);
        }
    }
}

/// Build the fake emissions preceding the real packets
pub(crate) fn plan_fakes<R: Rng>(
    packet: &[u8],
    info: &PacketInfo,
    set: &SetConfig,
    rng: &mut R,
) -> Vec<Emission> {
    if !set.faking.enabled || set.faking.seq_len == 0 {
        return Vec::new();
    }

    let payload = fake_payload(set, rng);
    (0..set.faking.seq_len)
        .map(|i| {
            let mut fake = repack_with_payload(packet, info, &payload, u16::from(i) + 1);
            apply_strategy(&mut fake, info, set);
            Emission::immediate(fake)
        })
        .collect()
}

/// Copy an outbound SYN with `syn_fake_len` bytes of the canned hello
/// appended, mangled by the active faking strategy. A zero length
/// keeps the pure SYN copy.
pub(crate) fn plan_syn_fake(packet: &[u8], info: &PacketInfo, set: &SetConfig) -> Option<Emission> {
    if !set.tcp.syn_fake {
        return None;
    }

    let canned = default_fake_payload();
    let take = set.tcp.syn_fake_len.min(canned.len());
    let mut fake = repack_with_payload(packet, info, &canned[..take], 1);
    apply_strategy(&mut fake, info, set);
    Some(Emission::immediate(fake))
}

/// Desync packets: low-TTL RST copies of the matched segment (and a
/// FIN-ACK under `combo`) so a stateful DPI believes the connection
/// tore down before the real payload arrives.
pub(crate) fn plan_desync(packet: &[u8], info: &PacketInfo, set: &SetConfig) -> Vec<Emission> {
    if set.tcp.desync == DesyncMode::Off {
        return Vec::new();
    }

    let build_flagged = |flags: u8, index: u16| {
        let mut buf = packet[..info.payload_start].to_vec();
        buf[info.ip_header_len + 13] = flags;
        buf[info.family.ttl_offset()] = set.tcp.desync_ttl;
        if info.family == IpFamily::V4 {
            let id = packet::read_u16(&buf, 4).wrapping_add(0x0100 + index);
            packet::write_u16(&mut buf, 4, id);
        }
        info.family.set_length(&mut buf, info.ip_header_len);
        info.family.fix_tcp_checksums(&mut buf, info.ip_header_len);
        Emission::immediate(buf)
    };

    let mut plan: Vec<Emission> = (0..set.tcp.desync_count.max(1))
        .map(|i| build_flagged(0x04, i as u16)) // RST
        .collect();
    if set.tcp.desync == DesyncMode::Combo {
        plan.push(build_flagged(0x11, set.tcp.desync_count as u16)); // FIN+ACK
    }
    plan
}
