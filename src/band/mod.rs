//! # Regional Band Model
//!
//! Static LoRaWAN regional parameters used to turn an uplink reception into
//! downlink windows: data-rate tables, uplink and downlink channel lists, RX1
//! channel and data-rate mapping, RX2 defaults, receive delays and, for the
//! EU plan, the duty-cycle sub-bands.
//!
//! Plans are built once on first access. The generic regional tables have the
//! TTN frequency-plan additions layered on top (see [`plans`]).
//!
//! ```rust
//! use lora_router::band::frequency_plan_for;
//!
//! let plan = frequency_plan_for("EU_863_870").unwrap();
//! assert_eq!(plan.rx2_frequency, 869_525_000);
//! assert!(frequency_plan_for("EU_433").is_err());
//! ```

pub mod duty_cycle;
pub mod plans;

pub use duty_cycle::{duty_cycle_for, SubBand, EU_SUB_BANDS};

use crate::radio::DataRate;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BandError {
    #[error("Unknown region: {0}")]
    UnknownRegion(String),

    #[error("Gateway has not reported a region")]
    RegionNotReported,

    #[error("Region {region} is not supported: {reason}")]
    Unsupported { region: String, reason: &'static str },

    #[error("Data rate {0} is not used in this band")]
    UnknownDataRate(String),

    #[error("Data rate index {0} is not defined in this band")]
    InvalidDataRateIndex(usize),

    #[error("No uplink channel at {frequency} Hz for data rate {data_rate}")]
    UnknownChannel { frequency: u64, data_rate: usize },

    #[error("RX1 data rate offset {0} is not defined")]
    InvalidOffset(usize),
}

/// Regions with a frequency plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Region {
    #[serde(rename = "EU_863_870")]
    Eu863_870,
    #[serde(rename = "US_902_928")]
    Us902_928,
    #[serde(rename = "AU_915_928")]
    Au915_928,
    #[serde(rename = "AS_923")]
    As923,
    #[serde(rename = "KR_920_923")]
    Kr920_923,
    #[serde(rename = "CN_470_510")]
    Cn470_510,
}

impl Region {
    pub const ALL: [Region; 6] = [
        Region::Eu863_870,
        Region::Us902_928,
        Region::Au915_928,
        Region::As923,
        Region::Kr920_923,
        Region::Cn470_510,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Region::Eu863_870 => "EU_863_870",
            Region::Us902_928 => "US_902_928",
            Region::Au915_928 => "AU_915_928",
            Region::As923 => "AS_923",
            Region::Kr920_923 => "KR_920_923",
            Region::Cn470_510 => "CN_470_510",
        }
    }
}

impl FromStr for Region {
    type Err = BandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "EU_863_870" => Ok(Region::Eu863_870),
            "US_902_928" => Ok(Region::Us902_928),
            "AU_915_928" => Ok(Region::Au915_928),
            "AS_923" => Ok(Region::As923),
            "KR_920_923" => Ok(Region::Kr920_923),
            "CN_470_510" => Ok(Region::Cn470_510),
            "CN_779_787" => Err(BandError::Unsupported {
                region: s.to_string(),
                reason: "no channel plan is defined for the 779-787 MHz band",
            }),
            "EU_433" => Err(BandError::Unsupported {
                region: s.to_string(),
                reason: "433 MHz gateways are not supported by the router",
            }),
            other => Err(BandError::UnknownRegion(other.to_string())),
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A radio channel and the data-rate index range it allows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Channel {
    pub frequency: u64,
    pub min_dr: usize,
    pub max_dr: usize,
}

impl Channel {
    pub const fn new(frequency: u64, min_dr: usize, max_dr: usize) -> Self {
        Self {
            frequency,
            min_dr,
            max_dr,
        }
    }

    pub fn allows(&self, dr: usize) -> bool {
        dr >= self.min_dr && dr <= self.max_dr
    }
}

/// How an uplink channel maps to its RX1 downlink channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rx1Channel {
    /// RX1 uses the uplink frequency (dynamic-channel plans)
    SameAsUplink,
    /// RX1 uses downlink channel `uplink_index % downlink_channels.len()`
    Modulo,
}

/// Resolved regional band parameters
#[derive(Debug, Clone)]
pub struct FrequencyPlan {
    pub region: Region,
    /// Data rates by index; `None` marks reserved indices
    pub data_rates: Vec<Option<DataRate>>,
    pub uplink_channels: Vec<Channel>,
    pub downlink_channels: Vec<Channel>,
    /// Default downlink TX power in dBm
    pub default_tx_power: i32,
    pub rx1_channel: Rx1Channel,
    /// RX1 data rate by `[uplink_dr][offset]`
    pub rx1_data_rates: Vec<Vec<usize>>,
    pub rx2_frequency: u64,
    pub rx2_data_rate: usize,
    pub receive_delay1: Duration,
    pub receive_delay2: Duration,
    pub join_accept_delay1: Duration,
    pub join_accept_delay2: Duration,
    /// Duty-cycle sub-bands, empty where the band has no duty-cycle rule
    pub duty_cycle_bands: Vec<SubBand>,
}

impl FrequencyPlan {
    pub fn data_rate(&self, index: usize) -> Result<DataRate, BandError> {
        self.data_rates
            .get(index)
            .copied()
            .flatten()
            .ok_or(BandError::InvalidDataRateIndex(index))
    }

    /// Lowest index carrying `data_rate`; uplink data rates precede downlink-only ones
    pub fn data_rate_index(&self, data_rate: &DataRate) -> Result<usize, BandError> {
        self.data_rates
            .iter()
            .position(|dr| dr.as_ref() == Some(data_rate))
            .ok_or_else(|| BandError::UnknownDataRate(data_rate.to_string()))
    }

    pub fn uplink_channel_index(&self, frequency: u64, data_rate: usize) -> Result<usize, BandError> {
        self.uplink_channels
            .iter()
            .position(|ch| ch.frequency == frequency && ch.allows(data_rate))
            .ok_or(BandError::UnknownChannel { frequency, data_rate })
    }

    /// RX1 downlink frequency for the uplink channel at `uplink_index`
    pub fn rx1_frequency(&self, uplink_index: usize) -> Result<u64, BandError> {
        let uplink = self.uplink_channels.get(uplink_index).ok_or(BandError::UnknownChannel {
            frequency: 0,
            data_rate: 0,
        })?;
        match self.rx1_channel {
            Rx1Channel::SameAsUplink => Ok(uplink.frequency),
            Rx1Channel::Modulo => {
                let count = self.downlink_channels.len().max(1);
                self.downlink_channels
                    .get(uplink_index % count)
                    .map(|ch| ch.frequency)
                    .ok_or(BandError::UnknownChannel {
                        frequency: uplink.frequency,
                        data_rate: 0,
                    })
            }
        }
    }

    pub fn rx1_data_rate(&self, uplink_dr: usize, offset: usize) -> Result<usize, BandError> {
        let row = self
            .rx1_data_rates
            .get(uplink_dr)
            .ok_or(BandError::InvalidDataRateIndex(uplink_dr))?;
        row.get(offset).copied().ok_or(BandError::InvalidOffset(offset))
    }

    /// Whether downlinks in this plan are subject to sub-band duty cycles
    pub fn enforces_duty_cycle(&self) -> bool {
        !self.duty_cycle_bands.is_empty()
    }
}

static FREQUENCY_PLANS: Lazy<HashMap<Region, FrequencyPlan>> = Lazy::new(|| {
    Region::ALL
        .iter()
        .map(|&region| (region, plans::build(region)))
        .collect()
});

/// The frequency plan for a region
pub fn frequency_plan(region: Region) -> &'static FrequencyPlan {
    // Every Region variant is built into the table
    &FREQUENCY_PLANS[&region]
}

/// The frequency plan for a region name as reported in gateway status
pub fn frequency_plan_for(name: &str) -> Result<&'static FrequencyPlan, BandError> {
    Ok(frequency_plan(name.parse()?))
}
