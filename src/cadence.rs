//! Breath-phase-locked scheduling.
//!
//! The inbound pull cadence is locked to fixed "breath" boundaries computed
//! from the genesis epoch, not from process start, so restarts and reloads
//! never drift the schedule. Ordering of records always uses payload
//! pulse/beat/step; the cadence only decides when to wake up.

use std::time::Duration;

/// Genesis epoch bridging wall-clock to breath boundaries (ms since Unix
/// epoch).
pub const GENESIS_EPOCH_MS: u64 = 1_715_323_541_888;

/// Timer clamps: avoid zero-delay storms and over-long sleeps.
pub const TIMER_MIN_MS: u64 = 25;
pub const TIMER_MAX_MS: u64 = 30_000;

/// One φ-exact breath, `(3 + √5)` seconds, in milliseconds.
pub fn breath_ms() -> f64 {
    (3.0 + 5.0_f64.sqrt()) * 1000.0
}

/// Time until the next breath boundary after `now_ms`, clamped.
pub fn until_next_breath(now_ms: u64) -> Duration {
    let breath = breath_ms();
    let dt = now_ms.saturating_sub(GENESIS_EPOCH_MS) as f64;
    let next_index = (dt / breath).floor() + 1.0;
    let next_at = GENESIS_EPOCH_MS as f64 + next_index * breath;
    let ms = (next_at - now_ms as f64).round();

    let ms = if ms.is_finite() { ms.max(0.0) as u64 } else { 5236 };
    Duration::from_millis(ms.clamp(TIMER_MIN_MS, TIMER_MAX_MS))
}
