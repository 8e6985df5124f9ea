//! # Gateway Airtime Utilization
//!
//! Exponentially-weighted moving averages of RX and TX airtime, overall and
//! per frequency. Samples are airtime in microseconds; [`Utilization::get`]
//! reports the fraction of time the radio was busy.
//!
//! The averages only decay when [`Utilization::tick`] is called on the
//! configured interval (5 s by default). Without ticking the reported rates go
//! stale.

use crate::constants::{UTILIZATION_TICK_INTERVAL_SECS, UTILIZATION_WINDOW_SECS};
use crate::message::{DownlinkMessage, UplinkMessage};
use crate::radio::toa::{self, Airtime, ToaError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Duration;

const MICROS_PER_SECOND: f64 = 1_000_000.0;

/// Moving average of a per-second rate, folded in on every tick
///
/// Samples accumulate lock-free between ticks; only the tick takes the mutex.
#[derive(Debug)]
pub struct Ewma {
    alpha: f64,
    interval_secs: f64,
    uncounted: AtomicU64,
    state: Mutex<EwmaState>,
}

#[derive(Debug, Default)]
struct EwmaState {
    rate: f64,
    initialized: bool,
}

impl Ewma {
    /// Average over `window` when ticked every `interval`
    pub fn new(interval: Duration, window: Duration) -> Self {
        let interval_secs = interval.as_secs_f64();
        Self {
            alpha: 1.0 - (-interval_secs / window.as_secs_f64()).exp(),
            interval_secs,
            uncounted: AtomicU64::new(0),
            state: Mutex::new(EwmaState::default()),
        }
    }

    /// One-minute average ticked every five seconds
    pub fn one_minute() -> Self {
        Self::new(
            Duration::from_secs(UTILIZATION_TICK_INTERVAL_SECS),
            Duration::from_secs_f64(UTILIZATION_WINDOW_SECS),
        )
    }

    pub fn update(&self, n: u64) {
        self.uncounted.fetch_add(n, Ordering::Relaxed);
    }

    pub fn tick(&self) {
        let count = self.uncounted.swap(0, Ordering::Relaxed);
        let instant_rate = count as f64 / self.interval_secs;

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.initialized {
            state.rate += self.alpha * (instant_rate - state.rate);
        } else {
            state.rate = instant_rate;
            state.initialized = true;
        }
    }

    /// Units per second
    pub fn rate(&self) -> f64 {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).rate
    }
}

#[derive(Debug)]
struct Overall {
    rx: Ewma,
    tx: Ewma,
}

/// RX/TX airtime utilization of one gateway
#[derive(Debug)]
pub struct Utilization {
    interval: Duration,
    default_payload_size: usize,
    overall: RwLock<Overall>,
    rx_channels: RwLock<HashMap<u64, Ewma>>,
    tx_channels: RwLock<HashMap<u64, Ewma>>,
}

impl Default for Utilization {
    fn default() -> Self {
        Self::new(
            Duration::from_secs(UTILIZATION_TICK_INTERVAL_SECS),
            toa::DEFAULT_PAYLOAD_SIZE,
        )
    }
}

impl Utilization {
    pub fn new(tick_interval: Duration, default_payload_size: usize) -> Self {
        let ewma = || Ewma::new(tick_interval, Duration::from_secs_f64(UTILIZATION_WINDOW_SECS));
        Self {
            interval: tick_interval,
            default_payload_size,
            overall: RwLock::new(Overall { rx: ewma(), tx: ewma() }),
            rx_channels: RwLock::new(HashMap::new()),
            tx_channels: RwLock::new(HashMap::new()),
        }
    }

    /// Record the airtime of a received uplink
    pub fn add_rx(&self, uplink: &UplinkMessage) -> Result<(), ToaError> {
        let us = self.airtime_us(uplink)?;
        if us == 0 {
            return Ok(());
        }
        self.overall.read().unwrap_or_else(|e| e.into_inner()).rx.update(us);
        if let Some(frequency) = uplink.frequency() {
            self.add_channel(&self.rx_channels, frequency, us);
        }
        Ok(())
    }

    /// Record the airtime of a scheduled downlink
    pub fn add_tx(&self, downlink: &DownlinkMessage) -> Result<(), ToaError> {
        let us = self.airtime_us(downlink)?;
        if us == 0 {
            return Ok(());
        }
        self.overall.read().unwrap_or_else(|e| e.into_inner()).tx.update(us);
        if let Some(frequency) = downlink.frequency() {
            self.add_channel(&self.tx_channels, frequency, us);
        }
        Ok(())
    }

    fn airtime_us<M: Airtime>(&self, message: &M) -> Result<u64, ToaError> {
        let airtime = toa::compute_with_default(message, self.default_payload_size)?;
        Ok(airtime.as_micros() as u64)
    }

    fn add_channel(&self, channels: &RwLock<HashMap<u64, Ewma>>, frequency: u64, us: u64) {
        {
            let map = channels.read().unwrap_or_else(|e| e.into_inner());
            if let Some(ewma) = map.get(&frequency) {
                ewma.update(us);
                return;
            }
        }
        let mut map = channels.write().unwrap_or_else(|e| e.into_inner());
        map.entry(frequency)
            .or_insert_with(|| Ewma::new(self.interval, Duration::from_secs_f64(UTILIZATION_WINDOW_SECS)))
            .update(us);
    }

    /// Advance every average; call on the configured interval
    pub fn tick(&self) {
        {
            let overall = self.overall.write().unwrap_or_else(|e| e.into_inner());
            overall.rx.tick();
            overall.tx.tick();
        }
        for channels in [&self.rx_channels, &self.tx_channels] {
            let map = channels.read().unwrap_or_else(|e| e.into_inner());
            for ewma in map.values() {
                ewma.tick();
            }
        }
    }

    /// Overall `(rx, tx)` busy fraction
    pub fn get(&self) -> (f64, f64) {
        let overall = self.overall.read().unwrap_or_else(|e| e.into_inner());
        (to_fraction(&overall.rx), to_fraction(&overall.tx))
    }

    /// `(rx, tx)` busy fraction on one frequency, zero if never seen
    pub fn get_channel(&self, frequency: u64) -> (f64, f64) {
        let lookup = |channels: &RwLock<HashMap<u64, Ewma>>| {
            channels
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .get(&frequency)
                .map(to_fraction)
                .unwrap_or(0.0)
        };
        (lookup(&self.rx_channels), lookup(&self.tx_channels))
    }
}

fn to_fraction(ewma: &Ewma) -> f64 {
    (ewma.rate() / MICROS_PER_SECOND).max(0.0)
}
