//! Inbound forgeries
//!
//! On a match the engine can also forge packets that *look like* they
//! came from the server: low-TTL bad-checksum copies the DPI records
//! but the endpoint rejects, or bare RSTs with swapped endpoints whose
//! sequence number is the acknowledgement the client just sent.

use super::Emission;
use crate::config::{IncomingMode, SetConfig};
use crate::packet::{self, IpFamily, PacketInfo, IPV6_HEADER_LEN};
use rand::Rng;

/// Build the inbound forgery emissions for a matched packet
pub(crate) fn plan_incoming<R: Rng>(
    packet: &[u8],
    info: &PacketInfo,
    set: &SetConfig,
    rng: &mut R,
) -> Vec<Emission> {
    let inc = &set.tcp.incoming;
    match inc.mode {
        IncomingMode::Off => Vec::new(),
        IncomingMode::Fake => (0..inc.count.max(1))
            .map(|_| {
                let mut fake = packet.to_vec();
                fake[info.family.ttl_offset()] = inc.ttl;
                // corrupt the TCP checksum so only the DPI accepts it
                fake[info.ip_header_len + 16] ^= 0xff;
                fake[info.ip_header_len + 17] ^= 0xff;
                if info.family == IpFamily::V4 {
                    crate::packet::checksum::fix_ipv4(&mut fake, info.ip_header_len);
                }
                Emission::immediate(fake)
            })
            .collect(),
        IncomingMode::Rst => (0..inc.count.max(1))
            .map(|_| Emission::immediate(build_reset(packet, info, inc.ttl, rng.gen())))
            .collect(),
    }
}

/// A header-only RST from the server to the client: endpoints swapped,
/// sequence number taken from the observed acknowledgement.
fn build_reset(packet: &[u8], info: &PacketInfo, ttl: u8, ip_id: u16) -> Vec<u8> {
    let tcp = info.ip_header_len;
    let sport = packet::read_u16(packet, tcp);
    let dport = packet::read_u16(packet, tcp + 2);
    let ack = packet::read_u32(packet, tcp + 8);

    match info.family {
        IpFamily::V4 => {
            let mut rst = vec![0u8; 40];
            rst[0] = 0x45;
            packet::write_u16(&mut rst, 2, 40);
            packet::write_u16(&mut rst, 4, ip_id);
            rst[8] = ttl;
            rst[9] = 6;
            rst[12..16].copy_from_slice(&packet[16..20]); // src = observed dst
            rst[16..20].copy_from_slice(&packet[12..16]); // dst = observed src

            packet::write_u16(&mut rst, 20, dport);
            packet::write_u16(&mut rst, 22, sport);
            packet::write_u32(&mut rst, 24, ack);
            rst[32] = 0x50;
            rst[33] = 0x04; // RST

            crate::packet::checksum::fix_ipv4(&mut rst, 20);
            crate::packet::checksum::fix_tcp_v4(&mut rst, 20);
            rst
        }
        IpFamily::V6 => {
            let mut rst = vec![0u8; IPV6_HEADER_LEN + 20];
            rst[0] = 0x60;
            packet::write_u16(&mut rst, 4, 20);
            rst[6] = 6;
            rst[7] = ttl;
            rst[8..24].copy_from_slice(&packet[24..40]);
            rst[24..40].copy_from_slice(&packet[8..24]);

            let tcp0 = IPV6_HEADER_LEN;
            packet::write_u16(&mut rst, tcp0, dport);
            packet::write_u16(&mut rst, tcp0 + 2, sport);
            packet::write_u32(&mut rst, tcp0 + 4, ack);
            rst[tcp0 + 12] = 0x50;
            rst[tcp0 + 13] = 0x04;

            crate::packet::checksum::fix_tcp_v6(&mut rst);
            rst
        }
    }
}
