//! # LoRa / FSK Modulation Model
//!
//! Modulation, spreading factor, bandwidth, coding rate and data-rate types as
//! they travel on the router's wire contract. LoRa data rates use the
//! packet-forwarder string form (`"SF7BW125"`), coding rates the `"4/5"` form.
//!
//! ```rust
//! use lora_router::radio::{CodingRate, DataRate};
//!
//! let dr: DataRate = "SF9BW125".parse().unwrap();
//! assert_eq!(dr.to_string(), "SF9BW125");
//! let cr: CodingRate = "4/5".parse().unwrap();
//! assert_eq!(cr.numerator(), 1);
//! ```

pub mod toa;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors raised while interpreting modulation parameters
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RadioError {
    /// Data rate string could not be parsed (e.g. not `SFxxBWyyy`)
    #[error("Invalid data rate: {0}")]
    InvalidDataRate(String),

    /// Coding rate string is not one of 4/5, 4/6, 4/7, 4/8
    #[error("Invalid coding rate: {0}")]
    InvalidCodingRate(String),

    /// Modulation is neither LoRa nor FSK
    #[error("Invalid modulation: {0}")]
    InvalidModulation(String),
}

/// Radio modulation used by an uplink or a downlink
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Modulation {
    /// Long Range chirp spread spectrum
    LoRa,
    /// Frequency Shift Keying
    Fsk,
}

impl FromStr for Modulation {
    type Err = RadioError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "LORA" => Ok(Modulation::LoRa),
            "FSK" | "GFSK" => Ok(Modulation::Fsk),
            _ => Err(RadioError::InvalidModulation(s.to_string())),
        }
    }
}

impl fmt::Display for Modulation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Modulation::LoRa => write!(f, "LORA"),
            Modulation::Fsk => write!(f, "FSK"),
        }
    }
}

/// Spreading Factor (SF) for LoRa
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SpreadingFactor {
    SF7 = 7,
    SF8 = 8,
    SF9 = 9,
    SF10 = 10,
    SF11 = 11,
    SF12 = 12,
}

impl SpreadingFactor {
    /// Numeric spreading factor (7-12)
    pub fn value(self) -> u32 {
        self as u32
    }

    fn from_value(value: u32) -> Option<Self> {
        match value {
            7 => Some(SpreadingFactor::SF7),
            8 => Some(SpreadingFactor::SF8),
            9 => Some(SpreadingFactor::SF9),
            10 => Some(SpreadingFactor::SF10),
            11 => Some(SpreadingFactor::SF11),
            12 => Some(SpreadingFactor::SF12),
            _ => None,
        }
    }
}

/// LoRa channel bandwidth
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Bandwidth {
    BW125,
    BW250,
    BW500,
}

impl Bandwidth {
    /// Bandwidth in kHz
    pub fn khz(self) -> u32 {
        match self {
            Bandwidth::BW125 => 125,
            Bandwidth::BW250 => 250,
            Bandwidth::BW500 => 500,
        }
    }

    fn from_khz(khz: u32) -> Option<Self> {
        match khz {
            125 => Some(Bandwidth::BW125),
            250 => Some(Bandwidth::BW250),
            500 => Some(Bandwidth::BW500),
            _ => None,
        }
    }
}

/// Coding Rate (CR) for LoRa
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CodingRate {
    CR4_5 = 1,
    CR4_6 = 2,
    CR4_7 = 3,
    CR4_8 = 4,
}

impl CodingRate {
    /// Coding-rate numerator used in the time-on-air formula (1 for 4/5 ... 4 for 4/8)
    pub fn numerator(self) -> u32 {
        self as u32
    }
}

impl FromStr for CodingRate {
    type Err = RadioError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "4/5" => Ok(CodingRate::CR4_5),
            "4/6" => Ok(CodingRate::CR4_6),
            "4/7" => Ok(CodingRate::CR4_7),
            "4/8" => Ok(CodingRate::CR4_8),
            other => Err(RadioError::InvalidCodingRate(other.to_string())),
        }
    }
}

impl fmt::Display for CodingRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "4/{}", self.numerator() + 4)
    }
}

/// A data rate: LoRa SF/BW pair or FSK bit rate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataRate {
    LoRa { sf: SpreadingFactor, bw: Bandwidth },
    Fsk { bit_rate: u32 },
}

impl DataRate {
    pub const fn lora(sf: SpreadingFactor, bw: Bandwidth) -> Self {
        DataRate::LoRa { sf, bw }
    }

    pub const fn fsk(bit_rate: u32) -> Self {
        DataRate::Fsk { bit_rate }
    }

    pub fn modulation(&self) -> Modulation {
        match self {
            DataRate::LoRa { .. } => Modulation::LoRa,
            DataRate::Fsk { .. } => Modulation::Fsk,
        }
    }
}

impl FromStr for DataRate {
    type Err = RadioError;

    /// Parses the LoRa `SF<n>BW<khz>` form
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || RadioError::InvalidDataRate(s.to_string());
        let upper = s.trim().to_ascii_uppercase();
        let rest = upper.strip_prefix("SF").ok_or_else(invalid)?;
        let (sf, bw) = rest.split_once("BW").ok_or_else(invalid)?;
        let sf = sf.parse::<u32>().ok().and_then(SpreadingFactor::from_value).ok_or_else(invalid)?;
        let bw = bw.parse::<u32>().ok().and_then(Bandwidth::from_khz).ok_or_else(invalid)?;
        Ok(DataRate::LoRa { sf, bw })
    }
}

impl fmt::Display for DataRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataRate::LoRa { sf, bw } => write!(f, "SF{}BW{}", sf.value(), bw.khz()),
            DataRate::Fsk { bit_rate } => write!(f, "{bit_rate}"),
        }
    }
}
