//! ETSI duty-cycle sub-bands for the EU 863-870 MHz plan
//!
//! Downlink scoring checks each candidate frequency against these sub-bands:
//! a frequency outside all of them is not a legal downlink, and a channel whose
//! measured TX utilization already exceeds its sub-band share is exhausted.

use serde::{Deserialize, Serialize};

/// A frequency range `[min_frequency, max_frequency)` sharing one duty-cycle limit
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SubBand {
    /// Inclusive lower bound in Hz
    pub min_frequency: u64,

    /// Exclusive upper bound in Hz
    pub max_frequency: u64,

    /// Allowed transmit fraction (0.01 = 1%)
    pub duty_cycle: f64,
}

impl SubBand {
    pub const fn new(min_frequency: u64, max_frequency: u64, duty_cycle: f64) -> Self {
        Self {
            min_frequency,
            max_frequency,
            duty_cycle,
        }
    }

    pub fn contains(&self, frequency: u64) -> bool {
        frequency >= self.min_frequency && frequency < self.max_frequency
    }
}

/// Default EU sub-band table
///
/// Not a transcription of ETSI EN 300 220: the 0.1% band there is
/// 868.7-869.2 MHz. It is narrowed to 868.6-868.7 MHz here so that 868.8 MHz
/// falls outside every sub-band and the EU FSK channel gets no RX1 downlink.
/// `RouterConfig::eu_sub_bands` replaces the table.
pub const EU_SUB_BANDS: [SubBand; 5] = [
    SubBand::new(863_000_000, 868_000_000, 0.01),
    SubBand::new(868_000_000, 868_600_000, 0.01),
    SubBand::new(868_600_000, 868_700_000, 0.001),
    SubBand::new(869_400_000, 869_650_000, 0.1),
    SubBand::new(869_700_000, 870_000_000, 0.01),
];

/// Duty-cycle limit for `frequency`, `None` when no sub-band allows it
pub fn duty_cycle_for(bands: &[SubBand], frequency: u64) -> Option<f64> {
    bands.iter().find(|band| band.contains(frequency)).map(|band| band.duty_cycle)
}
