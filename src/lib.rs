//! # lora-router - Gateway-Facing Core of a LoRaWAN Router
//!
//! The lora-router crate implements the part of a LoRaWAN network that talks to gateways:
//! it accounts for the airtime each gateway spends, reserves downlink transmission slots
//! on the gateway's 32-bit microsecond counter, and offers brokers scored RX1/RX2 downlink
//! options that respect regional band plans and EU duty-cycle limits.
//!
//! ## Features
//!
//! - Time-on-air calculation for LoRa and FSK transmissions
//! - One-minute EWMA utilization per gateway and per channel
//! - Downlink scheduling with counter wraparound, conflict scoring and ordered delivery
//! - Regional frequency plans (EU, US, AU, AS, KR, CN) with TTN channel overrides
//! - Downlink option building and scoring for uplinks and join-requests
//! - Router integration: uplink forwarding, activations, downlink commits, stream sessions
//! - Pluggable discovery (with TTL cache), broker transport, monitor push and token validation
//! - Support for logging and error handling
//!
//! ## Usage
//!
//! To use the lora-router crate in your Rust project, add the following to your Cargo.toml file:
//!
//! ```toml
//! [dependencies]
//! lora-router = "0.1.0"
//! ```
//!
//! Then, in your Rust code, you can import the necessary modules and functions:
//!
//! ```rust
//! use lora_router::{
//!     Router, RouterConfig, RouterError, GatewayId, UplinkMessage, DownlinkMessage,
//!     StaticDiscovery, MemoryDialer, init_logger, log_info,
//! };
//! ```

pub mod band;
pub mod broker;
pub mod config;
pub mod constants;
pub mod discovery;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod message;
pub mod monitor;
pub mod radio;
pub mod ratelimit;
pub mod router;
pub mod util;

pub use crate::config::RouterConfig;
pub use crate::error::RouterError;
pub use crate::logging::{init_logger, log_info};

// Radio and band model
pub use band::{frequency_plan, frequency_plan_for, BandError, FrequencyPlan, Region};
pub use radio::toa::{self, Airtime, ToaError};
pub use radio::{Bandwidth, CodingRate, DataRate, Modulation, SpreadingFactor};

// Gateway state
pub use gateway::{Gateway, GatewayId, GatewayRegistry, Schedule, ScheduleError, Utilization};

// Wire types
pub use message::{
    DeviceActivationRequest, DeviceActivationResponse, DownlinkMessage, DownlinkOption, GatewayRxMetadata,
    GatewayStatus, GatewayTxConfig, LoRaWanMetadata, LoRaWanTxConfig, RouterUplink, UplinkMessage,
};

// Router and collaborators
pub use broker::{ActivationPolicy, BrokerClient, BrokerDialer, MemoryBroker, MemoryDialer};
pub use discovery::{Announcement, CachedDiscovery, Discovery, StaticDiscovery};
pub use monitor::{MonitorClient, MonitorMessage, MonitorSink};
pub use ratelimit::RateLimiter;
pub use router::{build_options, select_best, GatewayCredentials, Router, StaticTokens, TokenValidator};
