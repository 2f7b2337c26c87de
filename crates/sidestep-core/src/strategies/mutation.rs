//! ClientHello mutation
//!
//! Rewrites of the hello itself, applied before any segmentation:
//! decoy SNI duplicates, GREASE extensions (RFC 8701 values only), a
//! padding extension, extension reordering with the SNI kept first,
//! and a fake ALPN advertising many protocols. After mutation the IP
//! total length, TLS record length, ClientHello length and both
//! checksums are recomputed.

use crate::config::{MutationMode, SetConfig};
use crate::packet::{self, PacketInfo};
use rand::Rng;

/// GREASE values (RFC 8701)
const GREASE_VALUES: [u16; 16] = [
    0x0a0a, 0x1a1a, 0x2a2a, 0x3a3a, 0x4a4a, 0x5a5a, 0x6a6a, 0x7a7a, 0x8a8a, 0x9a9a, 0xaaaa,
    0xbaba, 0xcaca, 0xdada, 0xeaea, 0xfafa,
];

const EXT_SERVER_NAME: u16 = 0x0000;
const EXT_ALPN: u16 = 0x0010;
const EXT_PADDING: u16 = 0x0015;

/// Apply the configured mutation to a matched ClientHello packet.
/// Returns the original buffer untouched when the payload is not a
/// mutable hello.
pub(crate) fn mutate_client_hello<R: Rng>(
    packet: &[u8],
    info: &PacketInfo,
    set: &SetConfig,
    rng: &mut R,
) -> Vec<u8> {
    let mode = set.faking.mutation.mode;
    if mode == MutationMode::Off {
        return packet.to_vec();
    }

    let payload = info.payload(packet);
    if payload.len() < 6 || payload[0] != 0x16 || payload[1] != 0x03 || payload[5] != 0x01 {
        return packet.to_vec();
    }

    match mode {
        MutationMode::Off => packet.to_vec(),
        MutationMode::Duplicate => insert_extensions(packet, info, &decoy_snis(set)),
        MutationMode::Grease => insert_extensions(packet, info, &grease(set, rng)),
        MutationMode::Padding => insert_extensions(packet, info, &padding(set)),
        MutationMode::Reorder => reorder_extensions(packet, info, rng),
        MutationMode::Full => {
            let mut out = insert_extensions(packet, info, &decoy_snis(set));
            let step = |buf: Vec<u8>, exts: Vec<u8>| -> Vec<u8> {
                match PacketInfo::parse(&buf) {
                    Ok(i) => insert_extensions(&buf, &i, &exts),
                    Err(_) => buf,
                }
            };
            out = step(out, grease(set, rng));
            out = step(out, fake_alpn());
            if let Ok(i) = PacketInfo::parse(&out) {
                out = reorder_extensions(&out, &i, rng);
            }
            // padding last, to round the hello out
            step(out, padding(set))
        }
    }
}

/// Decoy `server_name` extensions for each configured host
fn decoy_snis(set: &SetConfig) -> Vec<u8> {
    let mut out = Vec::new();
    for host in &set.faking.mutation.decoy_snis {
        if host.is_empty() {
            continue;
        }
        let host = host.as_bytes();
        out.extend_from_slice(&EXT_SERVER_NAME.to_be_bytes());
        out.extend_from_slice(&((host.len() + 5) as u16).to_be_bytes());
        out.extend_from_slice(&((host.len() + 3) as u16).to_be_bytes());
        out.push(0);
        out.extend_from_slice(&(host.len() as u16).to_be_bytes());
        out.extend_from_slice(host);
    }
    out
}

/// GREASE extensions with four random body bytes each
fn grease<R: Rng>(set: &SetConfig, rng: &mut R) -> Vec<u8> {
    let mut out = Vec::new();
    for i in 0..set.faking.mutation.grease_count {
        let value = GREASE_VALUES[i % GREASE_VALUES.len()];
        out.extend_from_slice(&value.to_be_bytes());
        out.extend_from_slice(&4u16.to_be_bytes());
        let mut body = [0u8; 4];
        rng.fill(&mut body);
        out.extend_from_slice(&body);
    }
    out
}

/// A zero-filled padding extension, clamped to 16-4096 bytes
fn padding(set: &SetConfig) -> Vec<u8> {
    let size = set.faking.mutation.padding_size.clamp(16, 4096);
    let mut out = Vec::with_capacity(4 + size);
    out.extend_from_slice(&EXT_PADDING.to_be_bytes());
    out.extend_from_slice(&(size as u16).to_be_bytes());
    out.resize(4 + size, 0);
    out
}

/// A fake ALPN listing many protocols
fn fake_alpn() -> Vec<u8> {
    const PROTOCOLS: [&str; 12] = [
        "http/1.0", "http/1.1", "h2", "h3", "spdy/3.1", "quic", "hq", "doq", "xmpp", "mqtt",
        "grpc", "websocket",
    ];

    let mut list = Vec::new();
    for proto in PROTOCOLS {
        list.push(proto.len() as u8);
        list.extend_from_slice(proto.as_bytes());
    }

    let mut out = Vec::with_capacity(6 + list.len());
    out.extend_from_slice(&EXT_ALPN.to_be_bytes());
    out.extend_from_slice(&((list.len() + 2) as u16).to_be_bytes());
    out.extend_from_slice(&(list.len() as u16).to_be_bytes());
    out.extend_from_slice(&list);
    out
}

/// Offset of the extensions-vector length field within the TLS payload
fn extensions_offset(payload: &[u8]) -> Option<usize> {
    if payload.len() < 43 {
        return None;
    }
    // record header (5) + handshake header (4) + version (2) + random (32)
    let mut pos = 43usize;

    let sid_len = *payload.get(pos)? as usize;
    pos += 1 + sid_len;

    let cs_len = be16(payload, pos)? as usize;
    pos += 2 + cs_len;

    let comp_len = *payload.get(pos)? as usize;
    pos += 1 + comp_len;

    if pos + 2 > payload.len() {
        return None;
    }
    Some(pos)
}

/// Append `new_exts` to the extension vector and refit every length
fn insert_extensions(packet: &[u8], info: &PacketInfo, new_exts: &[u8]) -> Vec<u8> {
    if new_exts.is_empty() {
        return packet.to_vec();
    }
    let payload = info.payload(packet);
    let Some(ext_off) = extensions_offset(payload) else {
        return packet.to_vec();
    };
    let Some(current_len) = be16(payload, ext_off) else {
        return packet.to_vec();
    };
    let current_len = current_len as usize;
    let ext_pos = info.payload_start + ext_off;
    if packet.len() < ext_pos + 2 + current_len {
        return packet.to_vec();
    }

    let mut out = Vec::with_capacity(packet.len() + new_exts.len());
    out.extend_from_slice(&packet[..ext_pos]);
    out.extend_from_slice(&((current_len + new_exts.len()) as u16).to_be_bytes());
    out.extend_from_slice(&packet[ext_pos + 2..ext_pos + 2 + current_len]);
    out.extend_from_slice(new_exts);
    out.extend_from_slice(&packet[ext_pos + 2 + current_len..]);

    refit_lengths(&mut out, info);
    out
}

/// Permute the extension order, SNI kept in first position
fn reorder_extensions<R: Rng>(packet: &[u8], info: &PacketInfo, rng: &mut R) -> Vec<u8> {
    let payload = info.payload(packet);
    let Some(ext_off) = extensions_offset(payload) else {
        return packet.to_vec();
    };
    let Some(total) = be16(payload, ext_off) else {
        return packet.to_vec();
    };
    let total = total as usize;
    if payload.len() < ext_off + 2 + total {
        return packet.to_vec();
    }

    // slice out each extension
    let area = &payload[ext_off + 2..ext_off + 2 + total];
    let mut sni: Option<&[u8]> = None;
    let mut others: Vec<&[u8]> = Vec::new();
    let mut pos = 0usize;
    while pos + 4 <= area.len() {
        let ext_type = u16::from_be_bytes([area[pos], area[pos + 1]]);
        let len = u16::from_be_bytes([area[pos + 2], area[pos + 3]]) as usize;
        if pos + 4 + len > area.len() {
            return packet.to_vec();
        }
        let ext = &area[pos..pos + 4 + len];
        // pin the first server_name; decoy duplicates shuffle freely
        if ext_type == EXT_SERVER_NAME && sni.is_none() {
            sni = Some(ext);
        } else {
            others.push(ext);
        }
        pos += 4 + len;
    }
    if others.len() < 2 {
        return packet.to_vec();
    }

    for i in (1..others.len()).rev() {
        let j = rng.gen_range(0..=i);
        others.swap(i, j);
    }

    let mut rebuilt = Vec::with_capacity(total);
    if let Some(sni) = sni {
        rebuilt.extend_from_slice(sni);
    }
    for ext in others {
        rebuilt.extend_from_slice(ext);
    }

    let ext_pos = info.payload_start + ext_off;
    let mut out = packet.to_vec();
    out[ext_pos + 2..ext_pos + 2 + total].copy_from_slice(&rebuilt);
    refit_lengths(&mut out, info);
    out
}

/// Rewrite IP total length, TLS record length, ClientHello length and
/// both checksums after a mutation changed the payload size
fn refit_lengths(out: &mut [u8], info: &PacketInfo) {
    let payload_len = out.len() - info.payload_start;
    info.family.set_length(out, info.ip_header_len);
    if payload_len >= 5 {
        let record_len = (payload_len - 5) as u16;
        packet::write_u16(out, info.payload_start + 3, record_len);
    }
    if payload_len >= 9 {
        let hello_len = payload_len - 9;
        out[info.payload_start + 6] = (hello_len >> 16) as u8;
        out[info.payload_start + 7] = (hello_len >> 8) as u8;
        out[info.payload_start + 8] = hello_len as u8;
    }
    info.family.fix_tcp_checksums(out, info.ip_header_len);
}

fn be16(buf: &[u8], at: usize) -> Option<u16> {
    Some(u16::from_be_bytes([*buf.get(at)?, *buf.get(at + 1)?]))
}
