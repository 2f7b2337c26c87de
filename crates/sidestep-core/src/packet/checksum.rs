//! One's-complement checksums (RFC 1071)
//!
//! Every packet the engine emits must carry a correct IPv4 header
//! checksum and a correct TCP/UDP checksum over the right pseudo
//! header; these are the only functions allowed to write the checksum
//! fields.

use super::IpFamily;

/// Fold a byte slice into a running 32-bit one's-complement sum
fn sum_words(data: &[u8], mut sum: u32) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for pair in &mut chunks {
        sum += u32::from(u16::from_be_bytes([pair[0], pair[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(*last) << 8;
    }
    sum
}

/// Fold the 32-bit sum to 16 bits and complement
fn finish(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Internet checksum over a byte slice
pub fn internet(data: &[u8]) -> u16 {
    finish(sum_words(data, 0))
}

/// Pseudo-header sum shared by the TCP/UDP variants
fn pseudo_sum(src: &[u8], dst: &[u8], proto: u8, transport_len: usize) -> u32 {
    let mut sum = sum_words(src, 0);
    sum = sum_words(dst, sum);
    sum += u32::from(proto);
    sum += transport_len as u32;
    sum
}

/// Recompute the IPv4 header checksum in place
pub fn fix_ipv4(packet: &mut [u8], ip_header_len: usize) {
    packet[10] = 0;
    packet[11] = 0;
    let csum = internet(&packet[..ip_header_len]);
    packet[10..12].copy_from_slice(&csum.to_be_bytes());
}

fn fix_transport(packet: &mut [u8], ip_header_len: usize, family: IpFamily, proto: u8, csum_off: usize) {
    let transport_len = packet.len() - ip_header_len;
    let at = ip_header_len + csum_off;
    packet[at] = 0;
    packet[at + 1] = 0;

    let sum = match family {
        IpFamily::V4 => pseudo_sum(&packet[12..16], &packet[16..20], proto, transport_len),
        IpFamily::V6 => pseudo_sum(&packet[8..24], &packet[24..40], proto, transport_len),
    };
    let mut csum = finish(sum_words(&packet[ip_header_len..], sum));
    // UDP transmits an all-zero checksum as 0xffff
    if proto == 17 && csum == 0 {
        csum = 0xffff;
    }
    packet[at..at + 2].copy_from_slice(&csum.to_be_bytes());
}

/// Recompute the TCP checksum of a complete IPv4 packet in place
pub fn fix_tcp_v4(packet: &mut [u8], ip_header_len: usize) {
    fix_transport(packet, ip_header_len, IpFamily::V4, 6, 16);
}

/// Recompute the TCP checksum of a complete IPv6 packet in place
pub fn fix_tcp_v6(packet: &mut [u8]) {
    fix_transport(packet, super::IPV6_HEADER_LEN, IpFamily::V6, 6, 16);
}

/// Recompute the UDP checksum of a complete IPv4 packet in place
pub fn fix_udp_v4(packet: &mut [u8], ip_header_len: usize) {
    fix_transport(packet, ip_header_len, IpFamily::V4, 17, 6);
}

/// Recompute the UDP checksum of a complete IPv6 packet in place
pub fn fix_udp_v6(packet: &mut [u8]) {
    fix_transport(packet, super::IPV6_HEADER_LEN, IpFamily::V6, 17, 6);
}

/// Verify the IPv4 header checksum of a packet
pub fn verify_ipv4(packet: &[u8], ip_header_len: usize) -> bool {
    internet(&packet[..ip_header_len]) == 0
}

/// Verify the TCP checksum of a complete packet
pub fn verify_tcp(packet: &[u8], family: IpFamily, ip_header_len: usize) -> bool {
    let transport_len = packet.len() - ip_header_len;
    let sum = match family {
        IpFamily::V4 => pseudo_sum(&packet[12..16], &packet[16..20], 6, transport_len),
        IpFamily::V6 => pseudo_sum(&packet[8..24], &packet[24..40], 6, transport_len),
    };
    finish(sum_words(&packet[ip_header_len..], sum)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::segment::tests_support::tcp_v4_packet;

    #[test]
    fn test_internet_checksum() {
        // Example from RFC 1071
        let data = [0x00, 0x01, 0xf2, 0x03, 0xf4, 0xf5, 0xf6, 0xf7];
        assert_eq!(internet(&data), 0x220d);
    }

    #[test]
    fn test_odd_length() {
        let even = internet(&[0x12, 0x34, 0x56, 0x00]);
        let odd = internet(&[0x12, 0x34, 0x56]);
        assert_eq!(even, odd);
    }

    #[test]
    fn test_fix_and_verify_v4() {
        let mut pkt = tcp_v4_packet(42, b"hello checksum");
        fix_ipv4(&mut pkt, 20);
        fix_tcp_v4(&mut pkt, 20);
        assert!(verify_ipv4(&pkt, 20));
        assert!(verify_tcp(&pkt, IpFamily::V4, 20));

        // Corrupting a payload byte must break the TCP checksum
        let last = pkt.len() - 1;
        pkt[last] ^= 0xff;
        assert!(!verify_tcp(&pkt, IpFamily::V4, 20));
    }
}
