//! Default values for runtime configuration
//!
//! This module centralizes the default value functions used by the
//! configuration structures. These functions are used by serde when
//! deserializing configuration files that don't specify certain fields.

/// Interval between timeout sweeps over the waiting-task table, in
/// milliseconds. The sweep is rate-limited to at most once per interval.
pub const TIMEOUT_SWEEP_INTERVAL_MS: u64 = 100;

/// Default timeout applied when a blocking call omits one (30 seconds)
pub fn default_timeout_seconds() -> f64 {
    30.0
}

/// Default minimum gap between two `preempt()` suspensions (50 ms)
pub fn default_preempt_interval_us() -> u64 {
    50_000
}

/// Default ceiling on how long one tick may sleep in the multiplexer (100 ms)
pub fn default_max_sleep_ms() -> u64 {
    100
}
