//! Router Constants
//!
//! Timing and scoring defaults for the gateway scheduling core. Every value
//! here is a default for a field in [`crate::config::RouterConfig`].

/// Gateway counters are 32-bit microsecond values; one wrap is 2^32 µs (~71.6 min)
pub const GATEWAY_TIMESTAMP_WRAP_US: u64 = 1 << 32;

// ----------------------------------------------------------------------------
// Schedule
// ----------------------------------------------------------------------------

/// Delivery loop poll interval
pub const SCHEDULE_POLL_INTERVAL_MS: u64 = 10;

/// Items are handed to the gateway this far ahead of their transmit time
pub const SCHEDULE_DEADLINE_MS: u64 = 50;

/// Conflict points for overlapping a committed item
pub const COMMITTED_CONFLICT_WEIGHT: u32 = 10;

/// Conflict points for overlapping an offered but unclaimed item
pub const HELD_CONFLICT_WEIGHT: u32 = 1;

/// Capacity of a gateway's downlink stream
pub const DOWNLINK_STREAM_BUFFER: usize = 64;

// ----------------------------------------------------------------------------
// Utilization
// ----------------------------------------------------------------------------

/// EWMA tick interval; the moving averages assume this cadence
pub const UTILIZATION_TICK_INTERVAL_SECS: u64 = 5;

/// EWMA window (1-minute load average)
pub const UTILIZATION_WINDOW_SECS: f64 = 60.0;

// ----------------------------------------------------------------------------
// Option scoring
// ----------------------------------------------------------------------------

/// Options scoring at or above this are never offered
pub const INFEASIBLE_SCORE: u32 = 1000;

/// Conflict count treated as a fully blocked slot
pub const BLOCKED_CONFLICT_COUNT: u32 = 100;

/// EU RX2 transmit power in dBm (869.525 MHz, 10% sub-band)
pub const EU_RX2_TX_POWER: i32 = 27;

// ----------------------------------------------------------------------------
// Monitor / rate limiting
// ----------------------------------------------------------------------------

/// Bounded queue per monitor stream
pub const MONITOR_BUFFER_SIZE: usize = 10;

/// Default uplink admission rate per gateway (messages per second, 0 = unlimited)
pub const UPLINK_RATE_PER_SEC: f64 = 0.0;

/// Default status admission rate per gateway (messages per second, 0 = unlimited)
pub const STATUS_RATE_PER_SEC: f64 = 0.0;
