//! `disorder`: SNI-boundary splits sent out of order
//!
//! DPI reassembly expects sequential data. The payload is cut at the
//! SNI boundaries (or quartiles when no SNI is visible), the segments
//! are reversed or shuffled, and jitter is inserted between sends.
//! An optional sequence-overlap pattern is grafted onto one segment so
//! the DPI additionally sees contradictory sequence space.

use super::{passthrough, Emission};
use crate::config::SetConfig;
use crate::packet::{segment, PacketInfo};
use crate::sni;
use rand::Rng;
use std::time::Duration;

pub fn plan<R: Rng>(
    packet: &[u8],
    info: &PacketInfo,
    set: &SetConfig,
    rng: &mut R,
) -> Vec<Emission> {
    let payload = info.payload(packet);
    if payload.len() < 10 {
        return passthrough(packet);
    }

    let frag = &set.fragmentation;
    let disorder = &frag.disorder;

    // split at SNI boundaries, quartiles otherwise
    let mut splits: Vec<usize> = Vec::new();
    if frag.middle_sni {
        if let Some(range) = sni::locate(payload) {
            let sni_len = range.end - range.start;
            splits.push(range.start);
            if sni_len > 6 {
                splits.push(range.start + sni_len / 2);
            }
            splits.push(range.end);
        }
    }
    if splits.is_empty() {
        splits = vec![1, payload.len() / 2, payload.len() * 3 / 4];
    }

    let mut cuts = vec![0];
    for s in splits {
        if s > 0 && s < payload.len() {
            cuts.push(s);
        }
    }
    cuts.push(payload.len());
    cuts.sort_unstable();
    cuts.dedup();

    let intervals: Vec<(usize, usize)> = cuts.windows(2).map(|w| (w[0], w[1])).collect();
    let mut segments: Vec<segment::Segment> = intervals
        .iter()
        .enumerate()
        .map(|(i, &(start, end))| {
            segment::build(packet, info, &payload[start..end], start as u32, i as u16)
        })
        .collect();

    // graft the sequence overlap onto one segment; which one is an
    // empirical tunable
    let pattern = frag.seq_overlap_pattern.as_bytes();
    if !pattern.is_empty() && segments.len() >= 2 {
        let target = disorder
            .seqovl_segment
            .unwrap_or(1)
            .min(segments.len() - 1);
        let (start, end) = intervals[target];
        segments[target] = segment::build_with_overlap(
            packet,
            info,
            &payload[start..end],
            start as u32,
            target as u16 + 100,
            pattern,
        );
    }

    segment::shuffle(&mut segments, disorder.shuffle_mode, rng);
    segment::set_max_seq_psh(&mut segments, info.family, info.ip_header_len);

    let min_jitter = disorder.min_jitter_us.max(1);
    let max_jitter = disorder.max_jitter_us.max(min_jitter + 1);
    let seg2_delay = set.tcp.seg2_delay_ms;

    let last = segments.len() - 1;
    segments
        .into_iter()
        .enumerate()
        .map(|(i, seg)| {
            if i == last {
                Emission::immediate(seg.data)
            } else if seg2_delay > 0 {
                let jitter_ms = rng.gen_range(0..=seg2_delay / 2);
                Emission::delayed(seg.data, Duration::from_millis(seg2_delay + jitter_ms))
            } else {
                let jitter_us = rng.gen_range(min_jitter..=max_jitter);
                Emission::delayed(seg.data, Duration::from_micros(jitter_us))
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SetConfig, ShuffleMode};
    use crate::packet::checksum;
    use crate::strategies::tests_support::{hello_packet, packet_with_payload, reassemble};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_splits_at_sni_boundaries() {
        let packet = hello_packet("a-long-hostname.example.com", 10_000);
        let info = PacketInfo::parse(&packet).unwrap();
        let set = SetConfig::default();
        let mut rng = StdRng::seed_from_u64(1);

        let out = plan(&packet, &info, &set, &mut rng);
        // pre-SNI, first half, second half, post-SNI
        assert_eq!(out.len(), 4);

        let range = sni::locate(info.payload(&packet)).unwrap();
        let mut starts: Vec<u32> = out
            .iter()
            .map(|e| PacketInfo::parse(&e.data).unwrap().seq0 - 10_000)
            .collect();
        starts.sort_unstable();
        assert!(starts.contains(&(range.start as u32)));
        assert!(starts.contains(&(range.end as u32)));
    }

    #[test]
    fn test_reverse_mode_orders_descending() {
        let packet = hello_packet("example.com", 500);
        let info = PacketInfo::parse(&packet).unwrap();
        let mut set = SetConfig::default();
        set.fragmentation.disorder.shuffle_mode = ShuffleMode::Reverse;
        let mut rng = StdRng::seed_from_u64(2);

        let out = plan(&packet, &info, &set, &mut rng);
        let seqs: Vec<u32> = out
            .iter()
            .map(|e| PacketInfo::parse(&e.data).unwrap().seq0)
            .collect();
        let mut sorted = seqs.clone();
        sorted.sort_unstable_by(|a, b| b.cmp(a));
        assert_eq!(seqs, sorted);
    }

    #[test]
    fn test_quartile_fallback_without_sni() {
        let payload: Vec<u8> = (0..160).map(|i| i as u8).collect();
        let packet = packet_with_payload(77, &payload);
        let info = PacketInfo::parse(&packet).unwrap();
        let set = SetConfig::default();
        let mut rng = StdRng::seed_from_u64(3);

        let out = plan(&packet, &info, &set, &mut rng);
        assert_eq!(out.len(), 4);
        assert_eq!(reassemble(&out, 77), payload);
    }

    #[test]
    fn test_seq_overlap_grafted() {
        let packet = hello_packet("example.com", 9000);
        let info = PacketInfo::parse(&packet).unwrap();
        let mut set = SetConfig::default();
        set.fragmentation.seq_overlap_pattern = "ABCD".to_string();
        set.fragmentation.disorder.seqovl_segment = Some(1);
        set.fragmentation.disorder.shuffle_mode = ShuffleMode::Reverse;
        let mut rng = StdRng::seed_from_u64(4);

        let out = plan(&packet, &info, &set, &mut rng);

        // exactly one segment starts 4 bytes before its interval and
        // carries the pattern up front
        let grafted: Vec<&Emission> = out
            .iter()
            .filter(|e| {
                let i = PacketInfo::parse(&e.data).unwrap();
                i.payload(&e.data).starts_with(b"ABCD")
            })
            .collect();
        assert_eq!(grafted.len(), 1);
        for e in &out {
            assert!(checksum::verify_tcp(
                &e.data,
                crate::packet::IpFamily::V4,
                20
            ));
        }
    }

    #[test]
    fn test_jitter_bounds() {
        let packet = hello_packet("example.com", 1);
        let info = PacketInfo::parse(&packet).unwrap();
        let mut set = SetConfig::default();
        set.fragmentation.disorder.min_jitter_us = 100;
        set.fragmentation.disorder.max_jitter_us = 200;
        let mut rng = StdRng::seed_from_u64(5);

        let out = plan(&packet, &info, &set, &mut rng);
        for e in &out[..out.len() - 1] {
            let us = e.delay_after.as_micros() as u64;
            assert!((100..=200).contains(&us), "jitter {us} out of bounds");
        }
        assert_eq!(out.last().unwrap().delay_after, Duration::ZERO);
    }
}
