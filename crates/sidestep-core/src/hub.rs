//! Discovery log hub
//!
//! Progress lines from a running discovery suite are fanned out to
//! whoever subscribed (the control plane forwards them to its
//! WebSocket clients) in addition to the normal log stream. Slow
//! subscribers lose old lines rather than blocking the suite.

use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;
use tracing::info;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for discovery progress lines
pub struct DiscoveryHub {
    tx: broadcast::Sender<String>,
    active: AtomicBool,
}

impl DiscoveryHub {
    /// Create an idle hub
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            tx,
            active: AtomicBool::new(false),
        }
    }

    /// Subscribe to progress lines
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    /// Whether a suite is currently running
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    /// Flip the running flag
    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Relaxed);
    }

    /// Broadcast one progress line; also mirrored to the log stream
    pub fn log(&self, msg: impl Into<String>) {
        let msg = msg.into();
        info!(target: "discovery", "{msg}");
        // no subscribers is fine
        let _ = self.tx.send(msg);
    }
}

impl Default for DiscoveryHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_lines() {
        let hub = DiscoveryHub::new();
        let mut rx = hub.subscribe();
        hub.log("phase one");
        assert_eq!(rx.recv().await.unwrap(), "phase one");
    }

    #[test]
    fn test_log_without_subscribers() {
        let hub = DiscoveryHub::new();
        hub.log("nobody listening");
    }

    #[test]
    fn test_active_flag() {
        let hub = DiscoveryHub::new();
        assert!(!hub.is_active());
        hub.set_active(true);
        assert!(hub.is_active());
    }
}
