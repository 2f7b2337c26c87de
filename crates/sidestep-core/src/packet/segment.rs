//! TCP segment and IPv4 fragment construction
//!
//! Builders for the crafted packets the strategy engine emits. Every
//! builder returns a fully finalized buffer: length fields rewritten,
//! PSH cleared, checksums recomputed for the packet's family.

use super::{clear_psh, set_psh, set_tcp_seq, write_u16, IpFamily, PacketInfo};
use crate::config::ShuffleMode;
use crate::error::{Error, Result};
use rand::Rng;

/// A crafted TCP segment awaiting transmission
#[derive(Debug, Clone)]
pub struct Segment {
    /// Complete packet bytes, checksummed
    pub data: Vec<u8>,
    /// Sequence number the segment carries
    pub seq: u32,
}

/// Build a segment of `original` whose payload is `payload_slice` and
/// whose sequence number is `seq0 + seq_offset`.
///
/// The IPv4 `Identification` field is incremented by `index` so
/// middleboxes see distinct datagrams. PSH defaults to clear; use
/// [`set_max_seq_psh`] after the full set is built.
pub fn build(
    original: &[u8],
    info: &PacketInfo,
    payload_slice: &[u8],
    seq_offset: u32,
    index: u16,
) -> Segment {
    let mut data = Vec::with_capacity(info.payload_start + payload_slice.len());
    data.extend_from_slice(&original[..info.payload_start]);
    data.extend_from_slice(payload_slice);

    let seq = info.seq0.wrapping_add(seq_offset);
    finalize(&mut data, info, seq, index);
    Segment { data, seq }
}

/// Like [`build`], but prepend `overlap_pattern` to the payload and
/// decrease the sequence number by its length so the pattern occupies
/// the sequence space *before* the intended payload.
pub fn build_with_overlap(
    original: &[u8],
    info: &PacketInfo,
    payload_slice: &[u8],
    seq_offset: u32,
    index: u16,
    overlap_pattern: &[u8],
) -> Segment {
    let mut data =
        Vec::with_capacity(info.payload_start + overlap_pattern.len() + payload_slice.len());
    data.extend_from_slice(&original[..info.payload_start]);
    data.extend_from_slice(overlap_pattern);
    data.extend_from_slice(payload_slice);

    let seq = info
        .seq0
        .wrapping_add(seq_offset)
        .wrapping_sub(overlap_pattern.len() as u32);
    finalize(&mut data, info, seq, index);
    Segment { data, seq }
}

fn finalize(data: &mut [u8], info: &PacketInfo, seq: u32, index: u16) {
    set_tcp_seq(data, info.ip_header_len, seq);
    if info.family == IpFamily::V4 {
        let id = super::read_u16(data, 4).wrapping_add(index);
        write_u16(data, 4, id);
    }
    info.family.set_length(data, info.ip_header_len);
    clear_psh(data, info.ip_header_len);
    info.family.fix_tcp_checksums(data, info.ip_header_len);
}

/// Clear PSH on every segment, then set it on the segment carrying the
/// numerically largest sequence number (not necessarily the last in
/// transmission order) and re-fix that segment's checksum.
pub fn set_max_seq_psh(segments: &mut [Segment], family: IpFamily, ip_header_len: usize) {
    if segments.is_empty() {
        return;
    }

    for seg in segments.iter_mut() {
        if seg.data[ip_header_len + 13] & 0x08 != 0 {
            clear_psh(&mut seg.data, ip_header_len);
            family.fix_tcp_checksums(&mut seg.data, ip_header_len);
        }
    }

    let max_idx = segments
        .iter()
        .enumerate()
        .max_by_key(|(_, s)| s.seq)
        .map(|(i, _)| i)
        .unwrap_or(0);

    let seg = &mut segments[max_idx];
    set_psh(&mut seg.data, ip_header_len);
    family.fix_tcp_checksums(&mut seg.data, ip_header_len);
}

/// Reorder segments for transmission
pub fn shuffle<R: Rng>(segments: &mut [Segment], mode: ShuffleMode, rng: &mut R) {
    match mode {
        ShuffleMode::Reverse => segments.reverse(),
        ShuffleMode::Full => {
            for i in (1..segments.len()).rev() {
                let j = rng.gen_range(0..=i);
                segments.swap(i, j);
            }
        }
    }
}

/// Split a single IPv4 datagram into two fragments on an 8-byte
/// boundary. The requested first-fragment payload size is rounded *up*
/// to the boundary; the first fragment carries More-Fragments, the
/// second the fragment offset.
pub fn ipv4_fragment(packet: &[u8], first_frag_payload_bytes: usize) -> Result<(Vec<u8>, Vec<u8>)> {
    if packet.len() < 20 {
        return Err(Error::PacketTooSmall {
            expected: 20,
            actual: packet.len(),
        });
    }
    let ihl = ((packet[0] & 0x0f) as usize) * 4;
    let ip_payload = &packet[ihl..];

    let split = (first_frag_payload_bytes + 7) & !7;
    if split == 0 || split >= ip_payload.len() {
        return Err(Error::strategy(
            "ip",
            format!(
                "fragment split {split} outside payload of {} bytes",
                ip_payload.len()
            ),
        ));
    }

    let flags_frag = super::read_u16(packet, 6);

    let mut first = Vec::with_capacity(ihl + split);
    first.extend_from_slice(&packet[..ihl]);
    first.extend_from_slice(&ip_payload[..split]);
    write_u16(&mut first, 2, (ihl + split) as u16);
    // More-Fragments, offset 0; DF cannot survive fragmentation
    write_u16(&mut first, 6, 0x2000);
    checksum_ipv4(&mut first, ihl);

    let mut second = Vec::with_capacity(ihl + ip_payload.len() - split);
    second.extend_from_slice(&packet[..ihl]);
    second.extend_from_slice(&ip_payload[split..]);
    write_u16(&mut second, 2, (ihl + ip_payload.len() - split) as u16);
    write_u16(
        &mut second,
        6,
        (flags_frag & 0x8000) | ((split / 8) as u16 & 0x1fff),
    );
    checksum_ipv4(&mut second, ihl);

    Ok((first, second))
}

fn checksum_ipv4(buf: &mut [u8], ihl: usize) {
    super::checksum::fix_ipv4(buf, ihl);
}

#[cfg(test)]
pub(crate) mod tests_support {
    /// Minimal IPv4 TCP packet with the given sequence number and payload,
    /// 192.168.1.1:40000 -> 192.168.1.2:443, checksums left zeroed.
    pub fn tcp_v4_packet(seq: u32, payload: &[u8]) -> Vec<u8> {
        let total = 40 + payload.len();
        let mut pkt = vec![
            0x45, 0x00, (total >> 8) as u8, (total & 0xff) as u8,
            0x00, 0x01, 0x40, 0x00,
            0x40, 0x06, 0x00, 0x00,
            0xc0, 0xa8, 0x01, 0x01,
            0xc0, 0xa8, 0x01, 0x02,
        ];
        pkt.extend_from_slice(&0x9c40u16.to_be_bytes()); // 40000
        pkt.extend_from_slice(&443u16.to_be_bytes());
        pkt.extend_from_slice(&seq.to_be_bytes());
        pkt.extend_from_slice(&1u32.to_be_bytes());
        pkt.extend_from_slice(&[0x50, 0x18, 0xff, 0xff, 0x00, 0x00, 0x00, 0x00]);
        pkt.extend_from_slice(payload);
        pkt
    }
}
