//! Flow reassembly
//!
//! A ClientHello does not always fit one TCP segment. Per 4-tuple we
//! accumulate payload bytes up to a configured limit until the TLS
//! parser either produces a host or rules the flow out. The map lock
//! is held only for pointer and length bookkeeping; parsing runs on a
//! copy taken under the lock.

use crate::sni::{self, SniError};
use bytes::BytesMut;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::trace;

/// How often the background sweep runs
const SWEEP_INTERVAL: Duration = Duration::from_secs(2);
/// Default idle lifetime of an unresolved flow
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// TCP flow identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    /// Source address
    pub src: IpAddr,
    /// Source port
    pub src_port: u16,
    /// Destination address
    pub dst: IpAddr,
    /// Destination port
    pub dst_port: u16,
}

/// Outcome of feeding one payload chunk into the table
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowVerdict {
    /// A complete ClientHello produced this host; the flow state is gone
    Resolved(String),
    /// Not enough bytes yet; the flow keeps accumulating
    Pending,
    /// The flow is not a ClientHello with an SNI; parsing stopped
    Rejected,
}

struct FlowState {
    buf: BytesMut,
    last_seen: Instant,
    resolved: bool,
}

/// Per-flow accumulation buffers, bounded and idle-swept
pub struct FlowTable {
    flows: Mutex<HashMap<FlowKey, FlowState>>,
    limit: usize,
    idle_timeout: Duration,
}

impl FlowTable {
    /// Create a table whose per-flow buffers never exceed `limit` bytes
    pub fn new(limit: usize) -> Self {
        Self::with_idle_timeout(limit, DEFAULT_IDLE_TIMEOUT)
    }

    /// Create with a custom idle timeout
    pub fn with_idle_timeout(limit: usize, idle_timeout: Duration) -> Self {
        Self {
            flows: Mutex::new(HashMap::new()),
            limit,
            idle_timeout,
        }
    }

    /// Feed one TCP payload chunk of a flow into the table.
    pub fn push(&self, key: FlowKey, chunk: &[u8]) -> FlowVerdict {
        if chunk.is_empty() {
            return FlowVerdict::Pending;
        }

        let snapshot = {
            let mut flows = self.flows.lock();
            let state = flows.entry(key).or_insert_with(|| FlowState {
                buf: BytesMut::new(),
                last_seen: Instant::now(),
                resolved: false,
            });
            state.last_seen = Instant::now();
            if state.resolved {
                return FlowVerdict::Rejected;
            }

            let room = self.limit.saturating_sub(state.buf.len());
            state.buf.extend_from_slice(&chunk[..chunk.len().min(room)]);
            state.buf.clone()
        };

        match sni::parse_tls_record(&snapshot) {
            Ok(found) => {
                self.flows.lock().remove(&key);
                FlowVerdict::Resolved(found.host)
            }
            Err(SniError::Incomplete) => {
                if snapshot.len() >= self.limit {
                    // the buffer can never complete; stop parsing
                    self.mark_resolved(key);
                    FlowVerdict::Rejected
                } else {
                    FlowVerdict::Pending
                }
            }
            Err(SniError::Malformed) | Err(SniError::NotFound) => {
                self.mark_resolved(key);
                FlowVerdict::Rejected
            }
        }
    }

    fn mark_resolved(&self, key: FlowKey) {
        if let Some(state) = self.flows.lock().get_mut(&key) {
            state.resolved = true;
            state.buf = BytesMut::new();
        }
    }

    /// Drop every flow idle for longer than the timeout
    pub fn sweep(&self) {
        let now = Instant::now();
        let mut flows = self.flows.lock();
        let before = flows.len();
        flows.retain(|_, state| now.duration_since(state.last_seen) < self.idle_timeout);
        let evicted = before - flows.len();
        if evicted > 0 {
            trace!(evicted, remaining = flows.len(), "flow sweep");
        }
    }

    /// Number of tracked flows
    pub fn len(&self) -> usize {
        self.flows.lock().len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.flows.lock().is_empty()
    }

    /// Run the periodic sweep until the table is dropped
    pub fn spawn_sweeper(table: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let weak = Arc::downgrade(table);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                tick.tick().await;
                match weak.upgrade() {
                    Some(table) => table.sweep(),
                    None => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sni::tests_support::client_hello;
    use std::net::Ipv4Addr;

    fn key(port: u16) -> FlowKey {
        FlowKey {
            src: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            src_port: port,
            dst: IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34)),
            dst_port: 443,
        }
    }

    #[test]
    fn test_single_chunk_resolves() {
        let table = FlowTable::new(8192);
        let record = client_hello("example.com");
        assert_eq!(
            table.push(key(40000), &record),
            FlowVerdict::Resolved("example.com".into())
        );
        assert!(table.is_empty());
    }

    #[test]
    fn test_split_hello_accumulates() {
        let table = FlowTable::new(8192);
        let record = client_hello("example.com");
        let (a, b) = record.split_at(30);

        assert_eq!(table.push(key(40001), a), FlowVerdict::Pending);
        assert_eq!(table.len(), 1);
        assert_eq!(
            table.push(key(40001), b),
            FlowVerdict::Resolved("example.com".into())
        );
        assert!(table.is_empty());
    }

    #[test]
    fn test_not_tls_rejected_once() {
        let table = FlowTable::new(8192);
        assert_eq!(
            table.push(key(40002), b"GET / HTTP/1.1\r\n"),
            FlowVerdict::Rejected
        );
        // rejected flows stop parsing but stay keyed until the sweep
        assert_eq!(table.push(key(40002), b"more bytes"), FlowVerdict::Rejected);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_limit_caps_buffer() {
        let table = FlowTable::new(48);
        let record = client_hello("a-rather-long-hostname.example.com");
        // a full buffer that still parses incomplete can never resolve
        assert_eq!(table.push(key(40003), &record[..48]), FlowVerdict::Rejected);
        assert_eq!(table.push(key(40003), &record[48..]), FlowVerdict::Rejected);
    }

    #[test]
    fn test_sweep_evicts_idle() {
        let table = FlowTable::with_idle_timeout(8192, Duration::from_millis(5));
        let record = client_hello("example.com");
        table.push(key(40004), &record[..20]);
        assert_eq!(table.len(), 1);
        std::thread::sleep(Duration::from_millis(10));
        table.sweep();
        assert!(table.is_empty());
    }
}
