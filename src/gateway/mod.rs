//! # Gateway State
//!
//! One [`Gateway`] per connected gateway: last reported status, airtime
//! utilization, downlink schedule and the resolved frequency plan. Gateways
//! are owned by the [`GatewayRegistry`]; everything else reaches them through
//! an `Arc<Gateway>` and the gateway's own locks.

pub mod registry;
pub mod schedule;
pub mod utilization;

pub use registry::GatewayRegistry;
pub use schedule::{Schedule, ScheduleError, ScheduledItem};
pub use utilization::{Ewma, Utilization};

use crate::band::{frequency_plan_for, BandError, FrequencyPlan};
use crate::config::RouterConfig;
use crate::message::{DownlinkMessage, GatewayStatus};
use log::debug;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Mutex, RwLock};
use std::time::Instant;

const EUI_PREFIX: &str = "eui-";

/// Opaque gateway identifier
///
/// Packet-forwarder gateways are named after their EUI (`eui-b827ebfffe6c279d`).
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GatewayId(String);

impl GatewayId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn from_eui(eui: u64) -> Self {
        Self(format!("{EUI_PREFIX}{}", hex::encode(eui.to_be_bytes())))
    }

    /// The EUI this id was derived from, if any
    pub fn eui(&self) -> Option<u64> {
        let raw = hex::decode(self.0.strip_prefix(EUI_PREFIX)?).ok()?;
        let bytes: [u8; 8] = raw.try_into().ok()?;
        Some(u64::from_be_bytes(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GatewayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for GatewayId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for GatewayId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Per-gateway state
#[derive(Debug)]
pub struct Gateway {
    id: GatewayId,
    status: RwLock<GatewayStatus>,
    utilization: Utilization,
    schedule: Schedule<DownlinkMessage>,
    frequency_plan: Mutex<Option<&'static FrequencyPlan>>,
    last_seen: Mutex<Instant>,
}

impl Gateway {
    pub fn new(id: GatewayId, config: &RouterConfig) -> Self {
        Self {
            id,
            status: RwLock::new(GatewayStatus::default()),
            utilization: Utilization::new(config.utilization_tick_interval(), config.default_payload_size),
            schedule: Schedule::new(config.schedule.clone()),
            frequency_plan: Mutex::new(None),
            last_seen: Mutex::new(Instant::now()),
        }
    }

    pub fn id(&self) -> &GatewayId {
        &self.id
    }

    pub fn status(&self) -> GatewayStatus {
        self.status.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Replace the last known status; a region change drops the resolved plan
    pub fn set_status(&self, status: GatewayStatus) {
        let mut current = self.status.write().unwrap_or_else(|e| e.into_inner());
        if current.band_name() != status.band_name() {
            debug!(
                "Gateway {} region changed from {:?} to {:?}",
                self.id,
                current.band_name(),
                status.band_name()
            );
            *self.frequency_plan.lock().unwrap_or_else(|e| e.into_inner()) = None;
        }
        *current = status;
    }

    pub fn utilization(&self) -> &Utilization {
        &self.utilization
    }

    pub fn schedule(&self) -> &Schedule<DownlinkMessage> {
        &self.schedule
    }

    /// Band parameters for the reported region, resolved once and cached
    pub fn frequency_plan(&self) -> Result<&'static FrequencyPlan, BandError> {
        if let Some(plan) = *self.frequency_plan.lock().unwrap_or_else(|e| e.into_inner()) {
            return Ok(plan);
        }
        // Status lock released before the plan slot is taken again (set_status locks status first)
        let name = {
            let status = self.status.read().unwrap_or_else(|e| e.into_inner());
            status.band_name().map(str::to_string)
        };
        let plan = frequency_plan_for(name.as_deref().ok_or(BandError::RegionNotReported)?)?;
        *self.frequency_plan.lock().unwrap_or_else(|e| e.into_inner()) = Some(plan);
        Ok(plan)
    }

    pub fn touch(&self) {
        *self.last_seen.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    pub fn last_seen(&self) -> Instant {
        *self.last_seen.lock().unwrap_or_else(|e| e.into_inner())
    }
}
