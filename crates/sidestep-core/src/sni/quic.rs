//! QUIC Initial SNI extraction (QUIC v1, RFC 9000/9001)
//!
//! An Initial packet is protected only by keys derived from its own
//! Destination Connection ID, so any on-path observer can undo the
//! protection: derive the client Initial secret from the v1 salt,
//! strip AES-128 header protection, decrypt the AES-128-GCM payload,
//! reassemble the CRYPTO frames by offset and hand the ClientHello to
//! the TLS parser.
//!
//! Other versions are left alone; the caller treats "no SNI" as a
//! pass-through.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;
use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes128Gcm, Key, Nonce};
use hkdf::Hkdf;
use sha2::Sha256;
use tracing::trace;

/// Initial salt for QUIC v1 (RFC 9001 §5.2)
const INITIAL_SALT_V1: [u8; 20] = [
    0x38, 0x76, 0x2c, 0xf7, 0xf5, 0x59, 0x34, 0xb3, 0x4d, 0x17, 0x9a, 0xe6, 0xa4, 0xc8, 0x0c,
    0xad, 0x1c, 0xcb, 0xb6, 0x43,
];

const QUIC_V1: u32 = 0x0000_0001;

/// Frame types appearing in a client Initial
const FRAME_PADDING: u8 = 0x00;
const FRAME_PING: u8 = 0x01;
const FRAME_CRYPTO: u8 = 0x06;

/// AEAD tag length
const TAG_LEN: usize = 16;

pub(crate) struct InitialKeys {
    pub key: [u8; 16],
    pub iv: [u8; 12],
    pub hp: [u8; 16],
}

/// Extract the SNI host from a QUIC v1 Initial datagram.
pub fn extract_sni(datagram: &[u8]) -> Option<String> {
    let hello = decrypt_initial(datagram)?;
    match super::parse_client_hello(&hello) {
        Ok(sni) => Some(sni.host),
        Err(err) => {
            trace!(?err, "QUIC CRYPTO payload without usable SNI");
            None
        }
    }
}

/// Decrypt the first Initial packet of a datagram and return the
/// reassembled CRYPTO stream (the TLS handshake bytes).
pub(crate) fn decrypt_initial(datagram: &[u8]) -> Option<Vec<u8>> {
    // 1 first byte + 4 version + 1 dcid len + 1 scid len
    if datagram.len() < 7 {
        return None;
    }

    let first = datagram[0];
    // long header with the fixed bit set
    if first & 0xc0 != 0xc0 {
        return None;
    }
    let version = u32::from_be_bytes([datagram[1], datagram[2], datagram[3], datagram[4]]);
    if version != QUIC_V1 {
        trace!(version, "unsupported QUIC version");
        return None;
    }
    // packet type Initial (bits 4-5 zero in v1)
    if first & 0x30 != 0 {
        return None;
    }

    let dcid_len = datagram[5] as usize;
    let dcid_end = 6 + dcid_len;
    if datagram.len() <= dcid_end {
        return None;
    }
    let dcid = &datagram[6..dcid_end];

    let scid_len = datagram[dcid_end] as usize;
    let mut p = dcid_end + 1 + scid_len;

    let (token_len, n) = parse_varint(datagram.get(p..)?)?;
    p += n + token_len as usize;

    let (length, n) = parse_varint(datagram.get(p..)?)?;
    p += n;
    let length = length as usize;

    let pn_offset = p;
    if length < 4 + TAG_LEN || datagram.len() < pn_offset + length {
        return None;
    }

    let keys = client_initial_keys(dcid)?;

    // header protection: sample 16 bytes assuming the longest packet
    // number encoding (RFC 9001 §5.4.2)
    let sample_at = pn_offset + 4;
    let sample = datagram.get(sample_at..sample_at + 16)?;
    let mask = hp_mask(&keys.hp, sample);

    let unprotected_first = first ^ (mask[0] & 0x0f);
    let pn_len = (unprotected_first & 0x03) as usize + 1;

    let mut header = datagram[..pn_offset + pn_len].to_vec();
    header[0] = unprotected_first;
    let mut pn: u64 = 0;
    for i in 0..pn_len {
        header[pn_offset + i] ^= mask[1 + i];
        pn = (pn << 8) | u64::from(header[pn_offset + i]);
    }

    let mut nonce = keys.iv;
    for (i, b) in pn.to_be_bytes().iter().enumerate() {
        nonce[4 + i] ^= *b;
    }

    let ciphertext = &datagram[pn_offset + pn_len..pn_offset + length];
    let cipher = Aes128Gcm::new(Key::<Aes128Gcm>::from_slice(&keys.key));
    let plaintext = cipher
        .decrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: ciphertext,
                aad: &header,
            },
        )
        .ok()?;

    reassemble_crypto(&plaintext)
}

/// Derive the client Initial key, IV and header-protection key from
/// the Destination Connection ID (RFC 9001 §5.2).
pub(crate) fn client_initial_keys(dcid: &[u8]) -> Option<InitialKeys> {
    let (_, initial) = Hkdf::<Sha256>::extract(Some(&INITIAL_SALT_V1), dcid);

    let mut client_secret = [0u8; 32];
    initial
        .expand(&hkdf_label("client in", 32), &mut client_secret)
        .ok()?;

    let client = Hkdf::<Sha256>::from_prk(&client_secret).ok()?;
    let mut keys = InitialKeys {
        key: [0; 16],
        iv: [0; 12],
        hp: [0; 16],
    };
    client.expand(&hkdf_label("quic key", 16), &mut keys.key).ok()?;
    client.expand(&hkdf_label("quic iv", 12), &mut keys.iv).ok()?;
    client.expand(&hkdf_label("quic hp", 16), &mut keys.hp).ok()?;
    Some(keys)
}

/// HkdfLabel encoding of HKDF-Expand-Label (RFC 8446 §7.1), empty context
fn hkdf_label(label: &str, len: u16) -> Vec<u8> {
    let mut out = Vec::with_capacity(10 + label.len());
    out.extend_from_slice(&len.to_be_bytes());
    out.push((6 + label.len()) as u8);
    out.extend_from_slice(b"tls13 ");
    out.extend_from_slice(label.as_bytes());
    out.push(0);
    out
}

/// AES-128-ECB of the sample; the first five bytes form the mask
pub(crate) fn hp_mask(hp: &[u8; 16], sample: &[u8]) -> [u8; 5] {
    let cipher = Aes128::new(GenericArray::from_slice(hp));
    let mut block = GenericArray::clone_from_slice(&sample[..16]);
    cipher.encrypt_block(&mut block);
    [block[0], block[1], block[2], block[3], block[4]]
}

/// Walk the decrypted frame sequence and reassemble the CRYPTO stream
/// by offset. The handshake must start at offset zero and be gap-free
/// up to the highest byte received.
fn reassemble_crypto(plain: &[u8]) -> Option<Vec<u8>> {
    let mut chunks: Vec<(usize, &[u8])> = Vec::new();
    let mut p = 0usize;

    while p < plain.len() {
        match plain[p] {
            FRAME_PADDING | FRAME_PING => p += 1,
            FRAME_CRYPTO => {
                p += 1;
                let (offset, n) = parse_varint(&plain[p..])?;
                p += n;
                let (len, n) = parse_varint(&plain[p..])?;
                p += n;
                let len = len as usize;
                if p + len > plain.len() {
                    return None;
                }
                chunks.push((offset as usize, &plain[p..p + len]));
                p += len;
            }
            // any other frame ends the region we understand
            _ => break,
        }
    }

    if chunks.is_empty() {
        return None;
    }
    chunks.sort_by_key(|(off, _)| *off);
    if chunks[0].0 != 0 {
        return None;
    }

    let mut stream = Vec::new();
    for (off, data) in chunks {
        if off > stream.len() {
            // gap: a later Initial carries the rest; nothing usable yet
            return None;
        }
        if off + data.len() > stream.len() {
            let keep = stream.len() - off;
            stream.extend_from_slice(&data[keep..]);
        }
    }
    Some(stream)
}

/// QUIC variable-length integer (RFC 9000 §16)
fn parse_varint(data: &[u8]) -> Option<(u64, usize)> {
    let first = *data.first()?;
    match first >> 6 {
        0 => Some((u64::from(first & 0x3f), 1)),
        1 => {
            if data.len() < 2 {
                return None;
            }
            Some((u64::from(u16::from_be_bytes([first & 0x3f, data[1]])), 2))
        }
        2 => {
            if data.len() < 4 {
                return None;
            }
            Some((
                u64::from(u32::from_be_bytes([first & 0x3f, data[1], data[2], data[3]])),
                4,
            ))
        }
        _ => {
            if data.len() < 8 {
                return None;
            }
            Some((
                u64::from_be_bytes([
                    first & 0x3f,
                    data[1],
                    data[2],
                    data[3],
                    data[4],
                    data[5],
                    data[6],
                    data[7],
                ]),
                8,
            ))
        }
    }
}


#[cfg(test)]
mod tests {
    use super::tests_support::protect_initial;
    use super::*;
    use crate::sni::tests_support::client_hello;

    #[test]
    fn test_initial_roundtrip() {
        let record = client_hello("video.example");
        // CRYPTO frames carry the handshake without the record layer
        let hello = &record[5..];
        let packet = protect_initial(&[0x83, 0x94, 0xc8, 0xf0, 0x3e, 0x51, 0x57, 0x08], hello);

        assert_eq!(extract_sni(&packet), Some("video.example".to_string()));
    }

    #[test]
    fn test_short_header_rejected() {
        let packet = [0x43u8; 64];
        assert_eq!(extract_sni(&packet), None);
    }

    #[test]
    fn test_unknown_version_rejected() {
        let record = client_hello("video.example");
        let mut packet = protect_initial(&[1, 2, 3, 4, 5, 6, 7, 8], &record[5..]);
        packet[4] = 0x02; // not v1
        assert_eq!(extract_sni(&packet), None);
    }

    #[test]
    fn test_corrupted_payload_rejected() {
        let record = client_hello("video.example");
        let mut packet = protect_initial(&[1, 2, 3, 4, 5, 6, 7, 8], &record[5..]);
        let last = packet.len() - 1;
        packet[last] ^= 0xff; // breaks the AEAD tag
        assert_eq!(extract_sni(&packet), None);
    }

    #[test]
    fn test_varint_forms() {
        assert_eq!(parse_varint(&[0x25]), Some((37, 1)));
        assert_eq!(parse_varint(&[0x7b, 0xbd]), Some((15293, 2)));
        assert_eq!(
            parse_varint(&[0x9d, 0x7f, 0x3e, 0x7d]),
            Some((494_878_333, 4))
        );
        assert_eq!(parse_varint(&[]), None);
    }
}
