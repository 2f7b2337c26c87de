//! TLS ClientHello recognition and SNI location
//!
//! Strict walk of the ClientHello structure: record header, handshake
//! header, legacy version, random, session id, cipher suites,
//! compression methods, then the extension vector until `server_name`
//! is found. Failures are values, not panics: `Incomplete` means more
//! bytes may still arrive (the flow buffer keeps accumulating),
//! `Malformed` and `NotFound` are terminal for the flow.
//!
//! The only allocation on this path is the copy of the host string.

pub mod quic;

use std::ops::Range;

/// TLS record type for handshake messages
const RECORD_HANDSHAKE: u8 = 0x16;
/// Handshake message type for ClientHello
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
/// Extension number of `server_name`
const EXT_SERVER_NAME: u16 = 0x0000;
/// ServerNameList entry type `host_name`
const NAME_TYPE_HOST: u8 = 0;
/// Longest hostname the DNS permits
const MAX_HOSTNAME_LEN: usize = 253;

/// Why no SNI came out of a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SniError {
    /// The buffer ends before the declared structure does; more bytes
    /// may complete it
    Incomplete,
    /// The structure contradicts itself; no amount of extra bytes will
    /// fix it
    Malformed,
    /// A well-formed ClientHello without a usable `server_name` entry
    NotFound,
}

/// A located SNI: the host string and the byte range its raw bytes
/// occupy in the parsed buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sni {
    /// The requested host
    pub host: String,
    /// Range of the host bytes within the input buffer
    pub range: Range<usize>,
    /// Offset of the `server_name` extension header within the input
    pub ext_start: usize,
}

/// Parse a TLS record carrying a ClientHello and extract the SNI.
///
/// `payload` starts at the TLS record header (the first byte of the
/// TCP payload).
pub fn parse_tls_record(payload: &[u8]) -> Result<Sni, SniError> {
    if payload.len() < 5 {
        return Err(SniError::Incomplete);
    }
    if payload[0] != RECORD_HANDSHAKE || payload[1] != 0x03 {
        return Err(SniError::Malformed);
    }
    let record_len = be16(payload, 3) as usize;
    if payload.len() < 5 + record_len {
        return Err(SniError::Incomplete);
    }

    let mut sni = parse_client_hello(&payload[5..5 + record_len])?;
    sni.range.start += 5;
    sni.range.end += 5;
    sni.ext_start += 5;
    Ok(sni)
}

/// Parse a bare ClientHello handshake message (no record layer), as it
/// appears inside QUIC CRYPTO frames.
pub fn parse_client_hello(hs: &[u8]) -> Result<Sni, SniError> {
    if hs.len() < 4 {
        return Err(SniError::Incomplete);
    }
    if hs[0] != HANDSHAKE_CLIENT_HELLO {
        return Err(SniError::Malformed);
    }
    let msg_len = be24(hs, 1);
    if hs.len() < 4 + msg_len {
        return Err(SniError::Incomplete);
    }
    let body = &hs[4..4 + msg_len];

    // legacy version (2) + random (32)
    let mut p = 34usize;
    if body.len() < p + 1 {
        return Err(SniError::Malformed);
    }

    // session id
    p += 1 + body[p] as usize;
    if body.len() < p + 2 {
        return Err(SniError::Malformed);
    }

    // cipher suites
    p += 2 + be16(body, p) as usize;
    if body.len() < p + 1 {
        return Err(SniError::Malformed);
    }

    // compression methods
    p += 1 + body[p] as usize;
    if body.len() < p + 2 {
        return Err(SniError::Malformed);
    }

    // extension vector
    let ext_total = be16(body, p) as usize;
    p += 2;
    let ext_end = p + ext_total;
    if body.len() < ext_end {
        return Err(SniError::Malformed);
    }

    while p + 4 <= ext_end {
        let ext_type = be16(body, p);
        let ext_len = be16(body, p + 2) as usize;
        let ext_body = p + 4;
        if ext_body + ext_len > ext_end {
            return Err(SniError::Malformed);
        }

        if ext_type == EXT_SERVER_NAME {
            let mut sni = parse_server_name_list(&body[ext_body..ext_body + ext_len])?;
            // shift from list-relative to caller-relative offsets
            sni.range.start += ext_body + 4;
            sni.range.end += ext_body + 4;
            sni.ext_start = p + 4;
            return Ok(sni);
        }

        p = ext_body + ext_len;
    }

    Err(SniError::NotFound)
}

/// Descend into a ServerNameList and pick the `host_name` entry
fn parse_server_name_list(list: &[u8]) -> Result<Sni, SniError> {
    if list.len() < 2 {
        return Err(SniError::Malformed);
    }
    let list_len = be16(list, 0) as usize;
    if list.len() < 2 + list_len {
        return Err(SniError::Malformed);
    }

    let mut p = 2usize;
    while p + 3 <= 2 + list_len {
        let name_type = list[p];
        let name_len = be16(list, p + 1) as usize;
        let name_start = p + 3;
        if name_start + name_len > 2 + list_len {
            return Err(SniError::Malformed);
        }

        if name_type == NAME_TYPE_HOST {
            let raw = &list[name_start..name_start + name_len];
            if raw.is_empty() || raw.len() > MAX_HOSTNAME_LEN || !is_hostname(raw) {
                return Err(SniError::NotFound);
            }
            return Ok(Sni {
                host: String::from_utf8_lossy(raw).into_owned(),
                range: name_start..name_start + name_len,
                ext_start: 0,
            });
        }
        p = name_start + name_len;
    }

    Err(SniError::NotFound)
}

fn is_hostname(raw: &[u8]) -> bool {
    raw.iter()
        .all(|&b| b.is_ascii_alphanumeric() || b == b'.' || b == b'-' || b == b'_')
}

/// The byte range of the SNI host within a raw TLS payload, used to
/// compute split points. `None` when the payload is not a ClientHello
/// with an SNI.
pub fn locate(payload: &[u8]) -> Option<Range<usize>> {
    parse_tls_record(payload).ok().map(|s| s.range)
}

/// The first byte of the extension directly preceding the
/// `server_name` extension — i.e. the offset of the SNI extension
/// header itself, which is where `ext-split` cuts the payload.
pub fn pre_extension_split_point(payload: &[u8]) -> Option<usize> {
    parse_tls_record(payload).ok().map(|s| s.ext_start)
}

fn be16(buf: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([buf[at], buf[at + 1]])
}

fn be24(buf: &[u8], at: usize) -> usize {
    ((buf[at] as usize) << 16) | ((buf[at + 1] as usize) << 8) | buf[at + 2] as usize
}
