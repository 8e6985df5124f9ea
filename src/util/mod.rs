//! # Utility Modules
//!
//! Logging helpers shared by the router's stream and monitor paths.

pub mod logging;

pub use logging::{log_payload_hex, LogThrottle, ThrottleManager};
