//! # Router Error Handling
//!
//! This module defines the RouterError enum, the crate-level error returned by
//! the router's public operations. Module errors convert into it with `?`.

use crate::band::BandError;
use crate::broker::BrokerError;
use crate::config::ConfigError;
use crate::discovery::DiscoveryError;
use crate::gateway::schedule::ScheduleError;
use crate::monitor::MonitorError;
use crate::radio::toa::ToaError;
use crate::radio::RadioError;
use thiserror::Error;

/// Represents the different error types that can occur in the router.
#[derive(Debug, Error)]
pub enum RouterError {
    /// Time-on-air could not be computed for a message.
    #[error("Time on air: {0}")]
    Toa(#[from] ToaError),

    /// Modulation parameters could not be interpreted.
    #[error("Radio: {0}")]
    Radio(#[from] RadioError),

    /// Regional band lookup failed (unsupported region, unknown channel).
    #[error("Band: {0}")]
    Band(#[from] BandError),

    /// Schedule operation failed (unknown option id, already subscribed).
    #[error("Schedule: {0}")]
    Schedule(#[from] ScheduleError),

    /// Discovery lookup failed.
    #[error("Discovery: {0}")]
    Discovery(#[from] DiscoveryError),

    /// A broker call failed.
    #[error("Broker: {0}")]
    Broker(#[from] BrokerError),

    /// Monitor push failed.
    #[error("Monitor: {0}")]
    Monitor(#[from] MonitorError),

    /// Configuration could not be loaded or is invalid.
    #[error("Configuration: {0}")]
    Config(#[from] ConfigError),

    /// Gateway credentials were missing or rejected.
    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    /// No gateway is registered under this id.
    #[error("Gateway not found: {0}")]
    GatewayNotFound(String),

    /// The message lacks fields the router needs.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// A rate limit or buffer bound was exceeded.
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Every broker rejected the activation.
    #[error("No broker accepted the activation")]
    ActivationRejected,
}

impl RouterError {
    /// Unknown ids, gateways or services; the caller decides whether to retry.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            RouterError::GatewayNotFound(_)
                | RouterError::Schedule(ScheduleError::NotFound(_))
                | RouterError::Discovery(DiscoveryError::NotFound { .. })
        )
    }

    /// Buffer-full and rate-limit conditions; never fatal for a stream.
    pub fn is_capacity(&self) -> bool {
        matches!(
            self,
            RouterError::ResourceExhausted(_) | RouterError::Monitor(MonitorError::BufferFull)
        )
    }

    /// Capability errors that skip a single candidate or message.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            RouterError::Toa(_) | RouterError::Radio(_) | RouterError::Band(_) | RouterError::Config(_)
        )
    }
}
