//! # Router Wire Types
//!
//! Messages exchanged with gateways and brokers. Payloads are raw LoRaWAN PHY
//! payloads carried as [`Bytes`]; every type round-trips through `serde`.
//!
//! The PHY helpers at the bottom read just enough of the frame header to
//! route it: the MType, the DevAddr of data frames and the EUIs of a
//! join-request.

use crate::gateway::GatewayId;
use crate::radio::toa::{Airtime, TxSettings};
use crate::radio::Modulation;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// LoRaWAN reception metadata of an uplink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoRaWanMetadata {
    pub modulation: Modulation,
    /// LoRa data rate, e.g. `"SF7BW125"`
    #[serde(default)]
    pub data_rate: String,
    /// FSK bit rate in bits per second
    #[serde(default)]
    pub bit_rate: u32,
    /// e.g. `"4/5"`
    #[serde(default)]
    pub coding_rate: String,
}

/// Gateway reception metadata of an uplink
///
/// `timestamp` is the gateway's 32-bit microsecond counter at reception. Only
/// Semtech packet-forwarder gateways report it, and downlinks are scheduled
/// relative to it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GatewayRxMetadata {
    pub gateway_id: GatewayId,
    #[serde(default)]
    pub timestamp: Option<u32>,
    #[serde(default)]
    pub time: Option<DateTime<Utc>>,
    /// Hz
    pub frequency: u64,
    #[serde(default)]
    pub rf_chain: u32,
    #[serde(default)]
    pub channel: u32,
    /// dBm
    #[serde(default)]
    pub rssi: f32,
    /// dB
    #[serde(default)]
    pub snr: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UplinkMessage {
    #[serde(default)]
    pub payload: Bytes,
    #[serde(default)]
    pub protocol_metadata: Option<LoRaWanMetadata>,
    #[serde(default)]
    pub gateway_metadata: Option<GatewayRxMetadata>,
}

impl UplinkMessage {
    pub fn gateway_timestamp(&self) -> Option<u32> {
        self.gateway_metadata.as_ref().and_then(|md| md.timestamp)
    }

    pub fn frequency(&self) -> Option<u64> {
        self.gateway_metadata.as_ref().map(|md| md.frequency)
    }
}

impl Airtime for UplinkMessage {
    fn tx_settings(&self) -> Option<TxSettings<'_>> {
        self.protocol_metadata.as_ref().map(|md| TxSettings {
            modulation: md.modulation,
            data_rate: &md.data_rate,
            coding_rate: &md.coding_rate,
            bit_rate: md.bit_rate,
        })
    }

    fn payload(&self) -> &[u8] {
        &self.payload
    }
}

/// LoRaWAN transmission settings of a downlink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoRaWanTxConfig {
    pub modulation: Modulation,
    #[serde(default)]
    pub data_rate: String,
    #[serde(default)]
    pub bit_rate: u32,
    #[serde(default)]
    pub coding_rate: String,
    /// Frame counter of the downlink, filled in by the handler
    #[serde(default)]
    pub f_cnt: u32,
}

/// Gateway radio settings of a downlink
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GatewayTxConfig {
    /// Gateway counter value to transmit at
    pub timestamp: u32,
    /// Hz
    pub frequency: u64,
    /// dBm
    pub power: i32,
    #[serde(default)]
    pub rf_chain: u32,
    #[serde(default)]
    pub polarization_inversion: bool,
    /// FSK frequency deviation in Hz
    #[serde(default)]
    pub frequency_deviation: u32,
}

/// A proposed downlink slot offered to brokers
///
/// `identifier` references the held item in the gateway's schedule. Lower
/// `score` is better.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownlinkOption {
    pub identifier: String,
    pub gateway_id: GatewayId,
    pub score: u32,
    /// Wall-clock time the slot opens at
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    pub protocol_config: LoRaWanTxConfig,
    pub gateway_config: GatewayTxConfig,
}

impl Airtime for DownlinkOption {
    fn tx_settings(&self) -> Option<TxSettings<'_>> {
        Some(tx_settings(&self.protocol_config))
    }

    fn payload(&self) -> &[u8] {
        &[]
    }
}

/// A downlink commit from a broker, and what the gateway finally receives
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownlinkMessage {
    #[serde(default)]
    pub payload: Bytes,
    #[serde(default)]
    pub protocol_config: Option<LoRaWanTxConfig>,
    #[serde(default)]
    pub gateway_config: Option<GatewayTxConfig>,
    #[serde(default)]
    pub option: Option<DownlinkOption>,
}

impl DownlinkMessage {
    /// Commit `payload` to a chosen option, copying its radio settings
    pub fn for_option(payload: Bytes, option: DownlinkOption) -> Self {
        Self {
            payload,
            protocol_config: Some(option.protocol_config.clone()),
            gateway_config: Some(option.gateway_config.clone()),
            option: Some(option),
        }
    }

    /// Fill missing radio settings from the attached option
    pub fn resolve_configs(&mut self) {
        if let Some(option) = &self.option {
            if self.protocol_config.is_none() {
                self.protocol_config = Some(option.protocol_config.clone());
            }
            if self.gateway_config.is_none() {
                self.gateway_config = Some(option.gateway_config.clone());
            }
        }
    }

    pub fn frequency(&self) -> Option<u64> {
        self.gateway_config
            .as_ref()
            .or_else(|| self.option.as_ref().map(|o| &o.gateway_config))
            .map(|cfg| cfg.frequency)
    }
}

impl Airtime for DownlinkMessage {
    fn tx_settings(&self) -> Option<TxSettings<'_>> {
        self.protocol_config
            .as_ref()
            .or_else(|| self.option.as_ref().map(|o| &o.protocol_config))
            .map(tx_settings)
    }

    fn payload(&self) -> &[u8] {
        &self.payload
    }
}

fn tx_settings(cfg: &LoRaWanTxConfig) -> TxSettings<'_> {
    TxSettings {
        modulation: cfg.modulation,
        data_rate: &cfg.data_rate,
        coding_rate: &cfg.coding_rate,
        bit_rate: cfg.bit_rate,
    }
}

/// An uplink forwarded to a broker with its downlink options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterUplink {
    pub uplink: UplinkMessage,
    pub downlink_options: Vec<DownlinkOption>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivationMetadata {
    pub app_eui: String,
    pub dev_eui: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceActivationRequest {
    pub payload: Bytes,
    #[serde(default)]
    pub protocol_metadata: Option<LoRaWanMetadata>,
    #[serde(default)]
    pub gateway_metadata: Option<GatewayRxMetadata>,
    #[serde(default)]
    pub activation_metadata: Option<ActivationMetadata>,
    /// Filled in by the router before the request reaches brokers
    #[serde(default)]
    pub downlink_options: Vec<DownlinkOption>,
}

impl DeviceActivationRequest {
    /// The request seen as an uplink reception
    pub fn as_uplink(&self) -> UplinkMessage {
        UplinkMessage {
            payload: self.payload.clone(),
            protocol_metadata: self.protocol_metadata.clone(),
            gateway_metadata: self.gateway_metadata.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceActivationResponse {
    /// Join-accept PHY payload
    pub payload: Bytes,
    /// The option the broker picked for the join-accept
    #[serde(default)]
    pub downlink_option: Option<DownlinkOption>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpsMetadata {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub altitude: i32,
}

/// Self-reported gateway state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayStatus {
    /// Gateway counter at the time of the status
    pub timestamp: Option<u32>,
    pub time: Option<DateTime<Utc>>,
    /// Region name, e.g. `"EU_863_870"`
    pub region: Option<String>,
    /// Frequency plan name, used when no region is reported
    pub frequency_plan: Option<String>,
    pub gps: Option<GpsMetadata>,
    pub trusted: bool,
    pub platform: Option<String>,
    pub description: Option<String>,
    pub rx_in: u32,
    pub rx_ok: u32,
    pub tx_in: u32,
    pub tx_ok: u32,
}

impl GatewayStatus {
    /// Band name the gateway operates in
    pub fn band_name(&self) -> Option<&str> {
        self.region.as_deref().or(self.frequency_plan.as_deref())
    }
}

// ----------------------------------------------------------------------------
// PHY payload helpers
// ----------------------------------------------------------------------------

/// LoRaWAN message type (MHDR bits 7..5)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MType {
    JoinRequest,
    JoinAccept,
    UnconfirmedDataUp,
    UnconfirmedDataDown,
    ConfirmedDataUp,
    ConfirmedDataDown,
    RejoinRequest,
    Proprietary,
}

impl MType {
    pub fn from_mhdr(mhdr: u8) -> Self {
        match mhdr >> 5 {
            0 => MType::JoinRequest,
            1 => MType::JoinAccept,
            2 => MType::UnconfirmedDataUp,
            3 => MType::UnconfirmedDataDown,
            4 => MType::ConfirmedDataUp,
            5 => MType::ConfirmedDataDown,
            6 => MType::RejoinRequest,
            _ => MType::Proprietary,
        }
    }

    pub fn is_data(self) -> bool {
        matches!(
            self,
            MType::UnconfirmedDataUp | MType::UnconfirmedDataDown | MType::ConfirmedDataUp | MType::ConfirmedDataDown
        )
    }
}

/// 32-bit device address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DevAddr(pub u32);

impl DevAddr {
    /// Whether the top `length` bits equal those of `prefix`
    pub fn has_prefix(self, prefix: DevAddr, length: u8) -> bool {
        match length {
            0 => true,
            1..=31 => {
                let mask = u32::MAX << (32 - u32::from(length));
                self.0 & mask == prefix.0 & mask
            }
            _ => self == prefix,
        }
    }
}

impl fmt::Display for DevAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08X}", self.0)
    }
}

/// Message type of a PHY payload, `None` for an empty payload
pub fn mtype(phy: &[u8]) -> Option<MType> {
    phy.first().map(|&mhdr| MType::from_mhdr(mhdr))
}

/// DevAddr of a data frame (little-endian after the MHDR)
pub fn dev_addr(phy: &[u8]) -> Option<DevAddr> {
    if !mtype(phy)?.is_data() || phy.len() < 5 {
        return None;
    }
    let bytes: [u8; 4] = phy[1..5].try_into().ok()?;
    Some(DevAddr(u32::from_le_bytes(bytes)))
}

/// `(AppEUI, DevEUI)` of a join-request as big-endian hex strings
pub fn join_request_euis(phy: &[u8]) -> Option<(String, String)> {
    const JOIN_REQUEST_LEN: usize = 1 + 8 + 8 + 2 + 4;

    if mtype(phy)? != MType::JoinRequest || phy.len() != JOIN_REQUEST_LEN {
        return None;
    }
    let eui = |bytes: &[u8]| {
        let mut be = bytes.to_vec();
        be.reverse();
        hex::encode_upper(be)
    };
    Some((eui(&phy[1..9]), eui(&phy[9..17])))
}
