//! # Router Configuration
//!
//! JSON configuration for the router. Every field has a default, so an empty
//! object (`{}`) is a valid configuration.
//!
//! ```rust
//! use lora_router::config::RouterConfig;
//!
//! let config = RouterConfig::from_json_str(r#"{ "schedule": { "deadline_ms": 80 } }"#).unwrap();
//! assert_eq!(config.schedule.deadline_ms, 80);
//! assert_eq!(config.schedule.poll_interval_ms, 10);
//! ```

use crate::band::SubBand;
use crate::constants::*;
use crate::radio::toa::DEFAULT_PAYLOAD_SIZE;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level router configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Identifier announced to discovery
    pub router_id: String,

    /// Accept gateways without a valid token (operational override)
    pub skip_verify_gateway_token: bool,

    /// Interval of the global utilization ticker
    pub utilization_tick_interval_ms: u64,

    /// Payload size assumed when an option or message carries no payload
    pub default_payload_size: usize,

    /// Evict gateways idle for longer than this; 0 keeps them forever
    pub gateway_idle_timeout_secs: u64,

    pub schedule: ScheduleConfig,
    pub scoring: ScoringConfig,
    pub rate_limit: RateLimitConfig,
    pub monitor: MonitorConfig,
    pub discovery_cache: DiscoveryCacheConfig,

    /// Replaces the built-in EU duty-cycle sub-band table
    pub eu_sub_bands: Option<Vec<SubBand>>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            router_id: "router".to_string(),
            skip_verify_gateway_token: false,
            utilization_tick_interval_ms: UTILIZATION_TICK_INTERVAL_SECS * 1000,
            default_payload_size: DEFAULT_PAYLOAD_SIZE,
            gateway_idle_timeout_secs: 0,
            schedule: ScheduleConfig::default(),
            scoring: ScoringConfig::default(),
            rate_limit: RateLimitConfig::default(),
            monitor: MonitorConfig::default(),
            discovery_cache: DiscoveryCacheConfig::default(),
            eu_sub_bands: None,
        }
    }
}

impl RouterConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: RouterConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Reject values that would stall loops or zero out the scoring
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.utilization_tick_interval_ms == 0 {
            return invalid("utilization_tick_interval_ms must be positive");
        }
        if self.schedule.poll_interval_ms == 0 {
            return invalid("schedule.poll_interval_ms must be positive");
        }
        if self.schedule.committed_weight == 0 || self.schedule.held_weight == 0 {
            return invalid("schedule conflict weights must be positive");
        }
        if self.schedule.stream_buffer == 0 {
            return invalid("schedule.stream_buffer must be positive");
        }
        if self.scoring.infeasible_score == 0 {
            return invalid("scoring.infeasible_score must be positive");
        }
        if self.monitor.buffer_size == 0 {
            return invalid("monitor.buffer_size must be positive");
        }
        if self.discovery_cache.capacity == 0 {
            return invalid("discovery_cache.capacity must be positive");
        }
        if self.rate_limit.uplink_per_sec < 0.0 || self.rate_limit.status_per_sec < 0.0 {
            return invalid("rate limits must not be negative");
        }
        if let Some(bands) = &self.eu_sub_bands {
            for band in bands {
                if band.min_frequency >= band.max_frequency || !(0.0..=1.0).contains(&band.duty_cycle) {
                    return invalid("eu_sub_bands entries need min < max and a duty cycle in [0, 1]");
                }
            }
        }
        Ok(())
    }

    pub fn utilization_tick_interval(&self) -> Duration {
        Duration::from_millis(self.utilization_tick_interval_ms)
    }

    pub fn gateway_idle_timeout(&self) -> Option<Duration> {
        match self.gateway_idle_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

/// Per-gateway downlink schedule parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub poll_interval_ms: u64,
    pub deadline_ms: u64,
    pub committed_weight: u32,
    pub held_weight: u32,
    pub stream_buffer: usize,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: SCHEDULE_POLL_INTERVAL_MS,
            deadline_ms: SCHEDULE_DEADLINE_MS,
            committed_weight: COMMITTED_CONFLICT_WEIGHT,
            held_weight: HELD_CONFLICT_WEIGHT,
            stream_buffer: DOWNLINK_STREAM_BUFFER,
        }
    }
}

impl ScheduleConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }
}

/// Downlink option scoring weights (lower score is better)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    /// Points per second of airtime
    pub airtime_weight: f64,
    pub airtime_cap: f64,

    /// Uplink SNR below this (dB) adds `low_snr_penalty`
    pub low_snr_threshold: f32,
    pub low_snr_penalty: f64,

    /// Points per dBm of RSSI (negative, weaker signal scores higher)
    pub rssi_weight: f64,
    pub rssi_cap: f64,

    pub gateway_rx_weight: f64,
    pub gateway_rx_cap: f64,
    pub channel_weight: f64,
    pub channel_cap: f64,

    /// Added for EU frequencies outside every sub-band or over their duty cycle
    pub duty_cycle_penalty: f64,

    pub conflict_weight: f64,
    pub conflict_cap: f64,
    pub blocked_conflicts: u32,
    pub blocked_penalty: f64,

    /// Options scoring at or above this are dropped
    pub infeasible_score: u32,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            airtime_weight: 5.0,
            airtime_cap: 10.0,
            low_snr_threshold: 5.0,
            low_snr_penalty: 10.0,
            rssi_weight: -0.1,
            rssi_cap: 10.0,
            gateway_rx_weight: 50.0,
            gateway_rx_cap: 20.0,
            channel_weight: 200.0,
            channel_cap: 20.0,
            duty_cycle_penalty: 100.0,
            conflict_weight: 10.0,
            conflict_cap: 30.0,
            blocked_conflicts: BLOCKED_CONFLICT_COUNT,
            blocked_penalty: 100.0,
            infeasible_score: INFEASIBLE_SCORE,
        }
    }
}

/// Per-gateway admission control; a rate of 0 disables the limiter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub uplink_per_sec: f64,
    pub uplink_burst: u32,
    pub status_per_sec: f64,
    pub status_burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            uplink_per_sec: UPLINK_RATE_PER_SEC,
            uplink_burst: 10,
            status_per_sec: STATUS_RATE_PER_SEC,
            status_burst: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Bounded queue per monitor stream
    pub buffer_size: usize,
    /// Buffer-full warnings allowed per `warn_window_ms`
    pub warn_cap: u32,
    pub warn_window_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            buffer_size: MONITOR_BUFFER_SIZE,
            warn_cap: 5,
            warn_window_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryCacheConfig {
    pub capacity: usize,
    pub ttl_secs: u64,
}

impl Default for DiscoveryCacheConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            ttl_secs: 60,
        }
    }
}

impl DiscoveryCacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}
