//! `overlap`: a garbage SNI overwritten by the real one
//!
//! Segment one runs from the payload start to just past the SNI with
//! the SNI bytes replaced by random garbage. Segment two starts a few
//! bytes *before* the SNI (its sequence number overlaps segment one)
//! and carries the real SNI through to the end of the payload. A DPI
//! that trusts first-arrival data records the garbage host; a
//! compliant receiver reassembles by sequence and keeps the second
//! segment's bytes in the overlap region.

use super::{split, Emission};
use crate::config::SetConfig;
use crate::packet::{segment, PacketInfo};
use crate::sni;
use rand::Rng;
use std::time::Duration;
use tracing::trace;

/// How far before the SNI start the real segment begins
const OVERLAP_REACH: usize = 8;

pub fn plan<R: Rng>(
    packet: &[u8],
    info: &PacketInfo,
    set: &SetConfig,
    rng: &mut R,
) -> Vec<Emission> {
    let payload = info.payload(packet);
    if payload.len() < 20 {
        return super::passthrough(packet);
    }

    let Some(range) = sni::locate(payload) else {
        trace!("no SNI visible, falling back to tcp split");
        return split::plan_tcp(packet, info, set);
    };

    // segment 1: payload start through just past the SNI, garbage over
    // the host bytes
    let seg1_end = (range.end + 2).min(payload.len());
    let mut decoy = payload[..seg1_end].to_vec();
    rng.fill(&mut decoy[range.start..range.end]);
    let seg1 = segment::build(packet, info, &decoy, 0, 0);

    // segment 2: begins before the SNI ends, carries the real bytes to
    // the end of the payload
    let overlap_start = range.start.saturating_sub(OVERLAP_REACH);
    let seg2 = segment::build(
        packet,
        info,
        &payload[overlap_start..],
        overlap_start as u32,
        1,
    );

    let mut segs = [seg1, seg2];
    segment::set_max_seq_psh(&mut segs, info.family, info.ip_header_len);
    let [seg1, seg2] = segs;

    let delay = Duration::from_millis(set.tcp.seg2_delay_ms);
    vec![
        Emission::delayed(seg1.data, delay),
        Emission::immediate(seg2.data),
    ]
}
