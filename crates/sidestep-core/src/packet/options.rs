//! TCP option surgery
//!
//! Rewrites of the TCP options area: SACK removal (so mid-stream
//! retransmit hints do not reveal the true segmentation) and the MD5
//! signature option used by the `md5sum` faking strategy. Both rebuild
//! the packet, realign options to a 4-byte multiple, rewrite the data
//! offset and re-fix every length and checksum.

use super::PacketInfo;

const OPT_EOL: u8 = 0;
const OPT_NOP: u8 = 1;
const OPT_SACK_PERMITTED: u8 = 4;
const OPT_SACK: u8 = 5;
const OPT_MD5SIG: u8 = 19;
const OPT_MD5SIG_LEN: u8 = 18;

/// Remove SACK-Permitted (kind 4) and SACK (kind 5) from the TCP
/// options. Returns the rebuilt packet, or a plain copy when there are
/// no options to strip.
pub fn strip_sack(packet: &[u8], info: &PacketInfo) -> Vec<u8> {
    if info.transport_header_len <= 20 {
        return packet.to_vec();
    }

    let opt_start = info.ip_header_len + 20;
    let opt_end = info.ip_header_len + info.transport_header_len;
    let mut kept: Vec<u8> = Vec::with_capacity(opt_end - opt_start);

    let mut i = opt_start;
    while i < opt_end {
        match packet[i] {
            OPT_EOL => break,
            OPT_NOP => {
                kept.push(OPT_NOP);
                i += 1;
            }
            kind => {
                if i + 1 >= opt_end {
                    break;
                }
                let len = packet[i + 1] as usize;
                if len < 2 || i + len > opt_end {
                    break;
                }
                if kind != OPT_SACK_PERMITTED && kind != OPT_SACK {
                    kept.extend_from_slice(&packet[i..i + len]);
                }
                i += len;
            }
        }
    }

    rebuild_with_options(packet, info, kept)
}

/// Append a TCP MD5 signature option (kind 19, len 18, zeroed digest).
///
/// Middleboxes that parse options see a signed segment they cannot
/// verify; endpoints without TCP-MD5 configured ignore the option.
pub fn append_md5sig(packet: &[u8], info: &PacketInfo) -> Vec<u8> {
    let opt_start = info.ip_header_len + 20;
    let opt_end = info.ip_header_len + info.transport_header_len;

    let mut opts = packet[opt_start..opt_end].to_vec();
    opts.push(OPT_MD5SIG);
    opts.push(OPT_MD5SIG_LEN);
    opts.extend_from_slice(&[0u8; 16]);

    rebuild_with_options(packet, info, opts)
}

/// Reassemble a packet around a new options area: pad to a 4-byte
/// multiple with end-of-options bytes, rewrite the data offset, the
/// length field and both checksums.
fn rebuild_with_options(packet: &[u8], info: &PacketInfo, mut opts: Vec<u8>) -> Vec<u8> {
    // TCP header length is capped at 60 bytes; options beyond 40 bytes
    // cannot be expressed in the data offset field.
    opts.truncate(40);
    let aligned = (opts.len() + 3) & !3;
    opts.resize(aligned, OPT_EOL);

    let new_hdr_len = 20 + opts.len();
    let tcp_start = info.ip_header_len;

    let mut out = Vec::with_capacity(tcp_start + new_hdr_len + info.payload_len);
    out.extend_from_slice(&packet[..tcp_start + 20]);
    out.extend_from_slice(&opts);
    out.extend_from_slice(&packet[info.payload_start..]);

    out[tcp_start + 12] = (((new_hdr_len / 4) as u8) << 4) | (packet[tcp_start + 12] & 0x0f);
    info.family.set_length(&mut out, info.ip_header_len);
    info.family.fix_tcp_checksums(&mut out, info.ip_header_len);
    out
}
