//! Binary TTL search
//!
//! Fakes must live long enough to reach the DPI and die before the
//! server. The search converges on the minimum TTL that still passes
//! a check: probe the midpoint, halve towards the smallest success.

use std::future::Future;
use tracing::debug;

/// Search bounds
const TTL_LOW: u8 = 1;
const TTL_HIGH: u8 = 32;

/// Find the minimum TTL in `[1, 32]` for which `probe` succeeds.
/// Returns the minimum and the probed sequence; `None` when no probed
/// TTL worked.
pub async fn find_minimum_ttl<F, Fut>(mut probe: F) -> (Option<u8>, Vec<u8>)
where
    F: FnMut(u8) -> Fut,
    Fut: Future<Output = bool>,
{
    let (mut low, mut high) = (TTL_LOW, TTL_HIGH);
    let mut best = None;
    let mut probed = Vec::new();

    while low < high {
        let mid = low + (high - low) / 2;
        probed.push(mid);
        if probe(mid).await {
            debug!(ttl = mid, "TTL probe succeeded");
            best = Some(mid);
            high = mid;
        } else {
            debug!(ttl = mid, "TTL probe failed");
            low = mid + 1;
        }
    }

    (best, probed)
}
