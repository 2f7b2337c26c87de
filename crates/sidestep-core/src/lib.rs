//! # sidestep-core
//!
//! Userspace packet mangling for SNI-targeted DPI evasion.
//!
//! The crate has two halves:
//!
//! - **The interception pipeline** — an NFQUEUE worker pool
//!   ([`queue`]) that parses egress packets ([`packet`]), extracts the
//!   TLS/QUIC SNI ([`sni`], buffered across segments by [`flow`]),
//!   matches it against configured target sets ([`filter`]) and replays
//!   the matched packet through a catalogue of evasion strategies
//!   ([`strategies`], [`engine`]) via a marked raw socket ([`sock`]).
//! - **The discovery engine** ([`discovery`]) — DPI fingerprinting,
//!   strategy-preset search, TTL binary search and a DNS-poisoning
//!   probe that converge on a working configuration and install it
//!   into the running worker pool.
//!
//! Configuration ([`config`]) is a versioned JSON document hot-swapped
//! atomically into the pool; in-flight packets always observe one
//! complete snapshot.

pub mod config;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod filter;
pub mod flow;
pub mod hub;
pub mod packet;
pub mod queue;
pub mod sni;
pub mod sock;
pub mod strategies;

pub use config::Config;
pub use error::{Error, Result};
pub use packet::PacketInfo;
pub use queue::Pool;
