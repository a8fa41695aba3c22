//! Tiered forwarding delay for the remote-to-client direction
//!
//! A fixed, escalating per-chunk delay bounds the rate of a session's
//! TCP-to-WebSocket leg once a sustained transfer is detected. The delay
//! depends only on how many chunks the session has forwarded so far, so
//! the policy stays a pure function of the session's chunk counter.

use std::time::Duration;

/// Chunk counts at which the delay steps up.
const TIER_SLOW: u64 = 20;
const TIER_SLOWER: u64 = 120;
const TIER_SLOWEST: u64 = 500;

/// Delay to apply before forwarding chunk number `chunk_count`.
///
/// Counting starts at 1; the first 19 chunks pass undelayed.
pub fn delay_for(chunk_count: u64) -> Duration {
    if chunk_count < TIER_SLOW {
        Duration::ZERO
    } else if chunk_count < TIER_SLOWER {
        Duration::from_millis(10)
    } else if chunk_count < TIER_SLOWEST {
        Duration::from_millis(20)
    } else {
        Duration::from_millis(50)
    }
}
