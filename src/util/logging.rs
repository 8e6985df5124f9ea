//! # Throttled Logging
//!
//! Rate limiting for warnings that fire once per message on hot paths (monitor
//! buffer full, gateway rate limited, late downlink commits), plus a hex dump
//! helper for PHY payloads.
//!
//! ```rust
//! use lora_router::util::logging::LogThrottle;
//!
//! let mut throttle = LogThrottle::new(1000, 5); // 5 messages per second
//! if throttle.allow() {
//!     log::warn!("monitor buffer full");
//! }
//! ```

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

/// Throttling structure for rate-limiting log messages
#[derive(Debug)]
pub struct LogThrottle {
    /// Time window for throttling (in milliseconds)
    window_ms: u64,
    /// Maximum messages allowed per window
    cap: u32,
    /// Current message count in window
    count: u32,
    /// Messages suppressed since the window opened
    suppressed: u32,
    /// Start time of current window
    t0: Instant,
}

impl LogThrottle {
    /// Create new throttle with time window and message cap
    pub fn new(window_ms: u64, cap: u32) -> Self {
        Self {
            window_ms,
            cap,
            count: 0,
            suppressed: 0,
            t0: Instant::now(),
        }
    }

    /// Check if logging is allowed (resets counter after window expires)
    pub fn allow(&mut self) -> bool {
        let now = Instant::now();
        let elapsed_ms = now.duration_since(self.t0).as_millis() as u64;

        if elapsed_ms > self.window_ms {
            if self.suppressed > 0 {
                log::debug!("{} log messages suppressed in the last {} ms", self.suppressed, self.window_ms);
            }
            self.t0 = now;
            self.count = 0;
            self.suppressed = 0;
        }

        self.count += 1;
        let allowed = self.count <= self.cap;
        if !allowed {
            self.suppressed += 1;
        }
        allowed
    }

    /// Get current throttle statistics
    pub fn stats(&self) -> ThrottleStats {
        ThrottleStats {
            window_ms: self.window_ms,
            cap: self.cap,
            count: self.count,
            suppressed: self.suppressed,
        }
    }

    /// Reset the throttle (start new window immediately)
    pub fn reset(&mut self) {
        self.t0 = Instant::now();
        self.count = 0;
        self.suppressed = 0;
    }
}

/// Statistics about a log throttle instance
#[derive(Debug, Clone, Copy)]
pub struct ThrottleStats {
    pub window_ms: u64,
    pub cap: u32,
    pub count: u32,
    pub suppressed: u32,
}

/// Independent throttles per key (one per gateway or per stream)
///
/// Shared across tasks, so the map sits behind its own mutex.
#[derive(Debug)]
pub struct ThrottleManager {
    window_ms: u64,
    cap: u32,
    throttles: Mutex<HashMap<String, LogThrottle>>,
}

impl ThrottleManager {
    pub fn new(window_ms: u64, cap: u32) -> Self {
        Self {
            window_ms,
            cap,
            throttles: Mutex::new(HashMap::new()),
        }
    }

    /// Check if logging is allowed for `key`
    pub fn allow(&self, key: &str) -> bool {
        let mut throttles = self.throttles.lock().unwrap_or_else(|e| e.into_inner());
        throttles
            .entry(key.to_string())
            .or_insert_with(|| LogThrottle::new(self.window_ms, self.cap))
            .allow()
    }

    /// Drop the throttle for a key that went away
    pub fn forget(&self, key: &str) {
        let mut throttles = self.throttles.lock().unwrap_or_else(|e| e.into_inner());
        throttles.remove(key);
    }
}

/// Log a PHY payload in hex at debug level
pub fn log_payload_hex(prefix: &str, data: &[u8]) {
    const MAX_LOG_BYTES: usize = 64;

    if !log::log_enabled!(log::Level::Debug) {
        return;
    }
    let shown = &data[..data.len().min(MAX_LOG_BYTES)];
    let suffix = if data.len() > MAX_LOG_BYTES {
        format!(" ... ({} bytes total)", data.len())
    } else {
        String::new()
    };
    log::debug!("{prefix}: {}{suffix}", hex::encode_upper(shown));
}

/// Log a warning with throttling
#[macro_export]
macro_rules! log_warn_throttled {
    ($throttle:expr, $($arg:tt)*) => {
        if $throttle.allow() {
            log::warn!($($arg)*);
        }
    };
}
