//! `ip`: network-layer fragmentation
//!
//! Splits the matched IPv4 datagram itself instead of the TCP stream;
//! DPIs that do not reassemble fragments never see a whole ClientHello.
//! The transport checksum spans both fragments, so the original packet
//! is fragmented as-is. IPv6 has no on-path fragmentation worth
//! exploiting here, so v6 packets degrade to a `tcp` split.

use super::{split, Emission};
use crate::config::SetConfig;
use crate::packet::{segment, IpFamily, PacketInfo};
use std::time::Duration;
use tracing::trace;

pub fn plan(packet: &[u8], info: &PacketInfo, set: &SetConfig) -> Vec<Emission> {
    if info.family == IpFamily::V6 {
        return split::plan_tcp(packet, info, set);
    }

    // the split position counts payload bytes; the first fragment also
    // carries the transport header
    let first_frag = set.fragmentation.split_pos.max(1) + info.transport_header_len;

    match segment::ipv4_fragment(packet, first_frag) {
        Ok((first, second)) => {
            let delay = Duration::from_millis(set.tcp.seg2_delay_ms);
            let (a, b) = if set.fragmentation.reverse_order {
                (second, first)
            } else {
                (first, second)
            };
            vec![Emission::delayed(a, delay), Emission::immediate(b)]
        }
        Err(err) => {
            trace!(%err, "ipv4 fragmentation unavailable, falling back to tcp split");
            split::plan_tcp(packet, info, set)
        }
    }
}
