//! Time-on-Air calculation
//!
//! LoRa airtime follows Semtech AN1200.13 ("LoRa Modem Designer's Guide") with
//! explicit header, CRC on and an 8-symbol preamble. FSK airtime counts the
//! payload plus preamble, sync word, length, and CRC bytes.

use super::{Bandwidth, CodingRate, DataRate, Modulation, RadioError, SpreadingFactor};
use std::time::Duration;
use thiserror::Error;

/// Payload size substituted when a message carries no payload (bytes)
pub const DEFAULT_PAYLOAD_SIZE: usize = 51;

/// FSK framing overhead: preamble (5), sync word (3), length (1), CRC (2)
const FSK_OVERHEAD_BYTES: usize = 5 + 3 + 1 + 2;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ToaError {
    #[error("Message carries no protocol configuration")]
    MissingConfiguration,

    #[error(transparent)]
    Radio(#[from] RadioError),
}

/// Radio settings a message exposes for airtime computation
#[derive(Debug, Clone, Copy)]
pub struct TxSettings<'a> {
    pub modulation: Modulation,
    pub data_rate: &'a str,
    pub coding_rate: &'a str,
    pub bit_rate: u32,
}

/// Anything whose transmission duration can be computed
pub trait Airtime {
    /// Protocol configuration, `None` when the message is not LoRaWAN
    fn tx_settings(&self) -> Option<TxSettings<'_>>;

    /// Payload bytes, empty if not yet known
    fn payload(&self) -> &[u8];
}

/// Compute the airtime of a message, substituting [`DEFAULT_PAYLOAD_SIZE`] for an empty payload
pub fn compute<M: Airtime + ?Sized>(message: &M) -> Result<Duration, ToaError> {
    compute_with_default(message, DEFAULT_PAYLOAD_SIZE)
}

/// Compute the airtime of a message with a caller-chosen default payload size
pub fn compute_with_default<M: Airtime + ?Sized>(
    message: &M,
    default_payload_size: usize,
) -> Result<Duration, ToaError> {
    let settings = message.tx_settings().ok_or(ToaError::MissingConfiguration)?;
    let payload_size = match message.payload().len() {
        0 => default_payload_size,
        n => n,
    };

    match settings.modulation {
        Modulation::LoRa => {
            let data_rate: DataRate = settings.data_rate.parse()?;
            let coding_rate: CodingRate = settings.coding_rate.parse()?;
            lora_data_rate_airtime(payload_size, &data_rate, coding_rate)
        }
        Modulation::Fsk => compute_fsk(payload_size, settings.bit_rate),
    }
}

/// LoRa airtime from the wire string forms (`"SF7BW125"`, `"4/5"`)
pub fn compute_lora(payload_size: usize, data_rate: &str, coding_rate: &str) -> Result<Duration, ToaError> {
    let data_rate: DataRate = data_rate.parse()?;
    let coding_rate: CodingRate = coding_rate.parse()?;
    lora_data_rate_airtime(payload_size, &data_rate, coding_rate)
}

fn lora_data_rate_airtime(
    payload_size: usize,
    data_rate: &DataRate,
    coding_rate: CodingRate,
) -> Result<Duration, ToaError> {
    match *data_rate {
        DataRate::LoRa { sf, bw } => Ok(lora_airtime(payload_size, sf, bw, coding_rate)),
        DataRate::Fsk { .. } => Err(RadioError::InvalidDataRate(data_rate.to_string()).into()),
    }
}

/// LoRa airtime for typed parameters
pub fn lora_airtime(payload_size: usize, sf: SpreadingFactor, bw: Bandwidth, cr: CodingRate) -> Duration {
    let sf_num = sf.value() as f64;
    let bw_khz = bw.khz() as f64;
    let cr_num = cr.numerator() as f64;

    // Low data rate optimization is mandated for SF11/SF12 on 125kHz
    let de = if bw == Bandwidth::BW125 && sf_num >= 11.0 { 1.0 } else { 0.0 };
    let h = 0.0;

    let t_sym_ms = 2f64.powf(sf_num) / bw_khz;
    let numerator = 8.0 * payload_size as f64 - 4.0 * sf_num + 28.0 + 16.0 - 20.0 * h;
    let denominator = 4.0 * (sf_num - 2.0 * de);
    let payload_nb = 8.0 + ((numerator / denominator).ceil() * (cr_num + 4.0)).max(0.0);

    let nanos = (payload_nb + 12.25) * t_sym_ms * 1_000_000.0;
    Duration::from_nanos(nanos.round() as u64)
}

/// FSK airtime for a bit rate in bits per second
pub fn compute_fsk(payload_size: usize, bit_rate: u32) -> Result<Duration, ToaError> {
    if bit_rate == 0 {
        return Err(RadioError::InvalidDataRate("FSK bit rate 0".to_string()).into());
    }
    let bits = ((payload_size + FSK_OVERHEAD_BYTES) * 8) as f64;
    Ok(Duration::from_nanos((bits / bit_rate as f64 * 1e9).round() as u64))
}
