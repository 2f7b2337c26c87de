//! `combo`: multi-point split, shuffle, overlap and timed sends
//!
//! The kitchen-sink strategy the preset search leans on: split at the
//! SNI boundaries, optionally graft the sequence-overlap pattern onto
//! the first segment, shuffle, then pace the sends — a long first
//! delay followed by microsecond jitter.

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
    if payload.len() < 20 {
        return passthrough(packet);
    }

    let frag = &set.fragmentation;
    let combo = &frag.combo;

    // pre-SNI, mid-SNI and post-SNI cuts, deduplicated and sorted
    let mut splits: Vec<usize> = Vec::new();
    if frag.middle_sni {
        if let Some(range) = sni::locate(payload) {
            splits.push(range.start);
            splits.push(range.start + (range.end - range.start) / 2);
            splits.push(range.end);
        }
    }
    splits.retain(|&s| s > 0 && s < payload.len());
    splits.sort_unstable();
    splits.dedup();
    if splits.is_empty() {
        splits.push(payload.len() / 2);
    }

    let pattern = frag.seq_overlap_pattern.as_bytes();

    let mut segments: Vec<segment::Segment> = Vec::with_capacity(splits.len() + 1);
    let mut prev_end = 0usize;
    for &split_pos in &splits {
        if split_pos <= prev_end {
            continue;
        }
        let idx = segments.len();
        let slice = &payload[prev_end..split_pos];
        let seg = if idx == 0 && !pattern.is_empty() {
            segment::build_with_overlap(packet, info, slice, prev_end as u32, idx as u16, pattern)
        } else {
            segment::build(packet, info, slice, prev_end as u32, idx as u16)
        };
        segments.push(seg);
        prev_end = split_pos;
    }
    if prev_end < payload.len() {
        let idx = segments.len();
        segments.push(segment::build(
            packet,
            info,
            &payload[prev_end..],
            prev_end as u32,
            idx as u16,
        ));
    }

    if segments.is_empty() {
        return passthrough(packet);
    }

    segment::shuffle(&mut segments, combo.shuffle_mode, rng);
    segment::set_max_seq_psh(&mut segments, info.family, info.ip_header_len);

    let first_delay = combo.first_delay_ms.max(1);
    let jitter_max = combo.jitter_max_us.max(1);

    let last = segments.len() - 1;
    segments
        .into_iter()
        .enumerate()
        .map(|(i, seg)| {
            if i == 0 && last > 0 {
                // first-delay-ms plus-or-minus a third
                let third = first_delay / 3;
                let ms = first_delay - third + rng.gen_range(0..=2 * third.max(1));
                Emission::delayed(seg.data, Duration::from_millis(ms))
            } else if i < last {
                Emission::delayed(seg.data, Duration::from_micros(rng.gen_range(0..jitter_max)))
            } else {
                Emission::immediate(seg.data)
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
    fn test_covers_payload_across_shuffle() {
        let packet = hello_packet("example.com", 7777);
        let info = PacketInfo::parse(&packet).unwrap();
        let set = SetConfig::default();

        for seed in 0..16 {
            let mut rng = StdRng::seed_from_u64(seed);
            let out = plan(&packet, &info, &set, &mut rng);
            assert!(out.len() >= 3);
            assert_eq!(reassemble(&out, 7777), info.payload(&packet));
        }
    }

    #[test]
    fn test_overlap_pattern_on_first_built_segment() {
        let packet = hello_packet("example.com", 31_000);
        let info = PacketInfo::parse(&packet).unwrap();
        let mut set = SetConfig::default();
        set.fragmentation.seq_overlap_pattern = "ZZ".to_string();
        set.fragmentation.combo.shuffle_mode = ShuffleMode::Reverse;
        let mut rng = StdRng::seed_from_u64(6);

        let out = plan(&packet, &info, &set, &mut rng);

        // the pre-SNI segment was built first: its sequence dips two
        // bytes below seq0 to host the pattern
        let min_seq = out
            .iter()
            .map(|e| PacketInfo::parse(&e.data).unwrap().seq0)
            .min()
            .unwrap();
        assert_eq!(min_seq, 31_000 - 2);

        let grafted = out
            .iter()
            .find(|e| PacketInfo::parse(&e.data).unwrap().seq0 == min_seq)
            .unwrap();
        assert!(PacketInfo::parse(&grafted.data)
            .unwrap()
            .payload(&grafted.data)
            .starts_with(b"ZZ"));
    }

    #[test]
    fn test_first_send_delay_window() {
        let packet = hello_packet("example.com", 2);
        let info = PacketInfo::parse(&packet).unwrap();
        let mut set = SetConfig::default();
        set.fragmentation.combo.first_delay_ms = 90;
        set.fragmentation.combo.jitter_max_us = 500;

        let mut rng = StdRng::seed_from_u64(8);
        let out = plan(&packet, &info, &set, &mut rng);

        let first_ms = out[0].delay_after.as_millis() as u64;
        assert!((60..=120).contains(&first_ms), "first delay {first_ms}ms");
        for e in &out[1..out.len() - 1] {
            assert!(e.delay_after.as_micros() < 500);
        }
        assert_eq!(out.last().unwrap().delay_after, Duration::ZERO);
    }

    #[test]
    fn test_fallback_split_without_sni() {
        let payload: Vec<u8> = (0..64).map(|i| i as u8).collect();
        let packet = packet_with_payload(5, &payload);
        let info = PacketInfo::parse(&packet).unwrap();
        let set = SetConfig::default();
        let mut rng = StdRng::seed_from_u64(12);

        let out = plan(&packet, &info, &set, &mut rng);
        assert_eq!(out.len(), 2);
        assert_eq!(reassemble(&out, 5), payload);
        for e in &out {
            assert!(checksum::verify_tcp(&e.data, crate::packet::IpFamily::V4, 20));
        }
    }
}
