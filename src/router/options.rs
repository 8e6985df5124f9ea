//! # Downlink Option Builder
//!
//! Turns an uplink reception into scored RX1/RX2 downlink candidates for the
//! receiving gateway. Each surviving candidate holds a slot in the gateway's
//! schedule; the slot id travels as [`DownlinkOption::identifier`].
//!
//! Scores are lower-is-better and built from four parts: airtime, uplink
//! signal quality, gateway/channel utilization (with the EU duty-cycle rule)
//! and schedule conflicts. The sum is multiplied by ten and rounded; options
//! at or above [`ScoringConfig::infeasible_score`] are never offered.

use crate::band::{duty_cycle_for, FrequencyPlan, Region};
use crate::config::{RouterConfig, ScoringConfig};
use crate::constants::EU_RX2_TX_POWER;
use crate::error::RouterError;
use crate::gateway::Gateway;
use crate::message::{
    DownlinkOption, GatewayRxMetadata, GatewayTxConfig, LoRaWanMetadata, LoRaWanTxConfig, UplinkMessage,
};
use crate::radio::toa;
use crate::radio::{DataRate, Modulation};
use log::debug;
use std::time::Duration;

/// Coding rate used for RX2 downlinks
const RX2_CODING_RATE: &str = "4/5";

/// Build and score the downlink options for `uplink` received by `gateway`
///
/// Returns nothing unless the uplink carries LoRaWAN metadata and gateway
/// metadata with a counter timestamp, and the gateway reported a supported
/// region. A candidate that cannot be built is skipped on its own.
pub fn build_options(
    uplink: &UplinkMessage,
    is_activation: bool,
    gateway: &Gateway,
    config: &RouterConfig,
) -> Vec<DownlinkOption> {
    let (Some(lorawan), Some(rx)) = (&uplink.protocol_metadata, &uplink.gateway_metadata) else {
        debug!("Gateway {}: uplink without LoRaWAN or gateway metadata", gateway.id());
        return Vec::new();
    };
    let Some(timestamp) = rx.timestamp else {
        debug!("Gateway {}: uplink without counter timestamp", gateway.id());
        return Vec::new();
    };
    let plan = match gateway.frequency_plan() {
        Ok(plan) => plan,
        Err(e) => {
            debug!("Gateway {}: no frequency plan: {e}", gateway.id());
            return Vec::new();
        }
    };

    let mut candidates = Vec::with_capacity(2);
    match rx1_candidate(lorawan, rx, timestamp, is_activation, plan) {
        Ok(candidate) => candidates.push(candidate),
        Err(e) => debug!("Gateway {}: skipping RX1: {e}", gateway.id()),
    }
    match rx2_candidate(timestamp, is_activation, plan) {
        Ok(candidate) => candidates.push(candidate),
        Err(e) => debug!("Gateway {}: skipping RX2: {e}", gateway.id()),
    }

    candidates
        .into_iter()
        .filter_map(|candidate| {
            let mut option = candidate.into_option(gateway);
            match score_option(&mut option, rx, gateway, plan, config) {
                Ok(score) if score < config.scoring.infeasible_score => Some(option),
                Ok(score) => {
                    debug!(
                        "Gateway {}: dropping option at {} Hz, score {score}",
                        gateway.id(),
                        option.gateway_config.frequency
                    );
                    None
                }
                Err(e) => {
                    debug!("Gateway {}: could not score option: {e}", gateway.id());
                    None
                }
            }
        })
        .collect()
}

/// The lowest-scoring option
pub fn select_best(options: &[DownlinkOption]) -> Option<&DownlinkOption> {
    options.iter().min_by_key(|option| option.score)
}

/// An unscored candidate window
#[derive(Debug, Clone)]
struct Candidate {
    timestamp: u32,
    frequency: u64,
    power: i32,
    data_rate: DataRate,
    coding_rate: String,
}

impl Candidate {
    fn into_option(self, gateway: &Gateway) -> DownlinkOption {
        let (protocol_config, frequency_deviation) = match self.data_rate {
            DataRate::LoRa { .. } => (
                LoRaWanTxConfig {
                    modulation: Modulation::LoRa,
                    data_rate: self.data_rate.to_string(),
                    bit_rate: 0,
                    coding_rate: self.coding_rate,
                    f_cnt: 0,
                },
                0,
            ),
            DataRate::Fsk { bit_rate } => (
                LoRaWanTxConfig {
                    modulation: Modulation::Fsk,
                    data_rate: String::new(),
                    bit_rate,
                    coding_rate: String::new(),
                    f_cnt: 0,
                },
                bit_rate / 2,
            ),
        };
        DownlinkOption {
            identifier: String::new(),
            gateway_id: gateway.id().clone(),
            score: 0,
            deadline: None,
            gateway_config: GatewayTxConfig {
                timestamp: self.timestamp,
                frequency: self.frequency,
                power: self.power,
                rf_chain: 0,
                polarization_inversion: protocol_config.modulation == Modulation::LoRa,
                frequency_deviation,
            },
            protocol_config,
        }
    }
}

fn uplink_data_rate(lorawan: &LoRaWanMetadata) -> Result<DataRate, RouterError> {
    match lorawan.modulation {
        Modulation::LoRa => Ok(lorawan.data_rate.parse()?),
        Modulation::Fsk => Ok(DataRate::fsk(lorawan.bit_rate)),
    }
}

fn delay_us(delay: Duration) -> u32 {
    delay.as_micros() as u32
}

fn rx1_candidate(
    lorawan: &LoRaWanMetadata,
    rx: &GatewayRxMetadata,
    timestamp: u32,
    is_activation: bool,
    plan: &FrequencyPlan,
) -> Result<Candidate, RouterError> {
    let uplink_dr = plan.data_rate_index(&uplink_data_rate(lorawan)?)?;
    let channel = plan.uplink_channel_index(rx.frequency, uplink_dr)?;
    let frequency = plan.rx1_frequency(channel)?;
    let data_rate = plan.data_rate(plan.rx1_data_rate(uplink_dr, 0)?)?;
    let delay = if is_activation {
        plan.join_accept_delay1
    } else {
        plan.receive_delay1
    };
    let coding_rate = if lorawan.coding_rate.is_empty() {
        RX2_CODING_RATE.to_string()
    } else {
        lorawan.coding_rate.clone()
    };

    Ok(Candidate {
        timestamp: timestamp.wrapping_add(delay_us(delay)),
        frequency,
        power: plan.default_tx_power,
        data_rate,
        coding_rate,
    })
}

fn rx2_candidate(timestamp: u32, is_activation: bool, plan: &FrequencyPlan) -> Result<Candidate, RouterError> {
    let mut power = plan.default_tx_power;
    let mut data_rate_index = plan.rx2_data_rate;
    if plan.region == Region::Eu863_870 {
        power = EU_RX2_TX_POWER;
        if is_activation {
            data_rate_index = 0;
        }
    }
    let delay = if is_activation {
        plan.join_accept_delay2
    } else {
        plan.receive_delay2
    };

    Ok(Candidate {
        timestamp: timestamp.wrapping_add(delay_us(delay)),
        frequency: plan.rx2_frequency,
        power,
        data_rate: plan.data_rate(data_rate_index)?,
        coding_rate: RX2_CODING_RATE.to_string(),
    })
}

/// Score `option` and, when it stays feasible, hold its slot in the gateway's schedule
///
/// Returns the final score. Infeasible options keep an empty identifier and
/// hold no slot: either the schedule is never consulted, or the hold is
/// released once the schedule term pushes the score over the limit.
pub fn score_option(
    option: &mut DownlinkOption,
    rx: &GatewayRxMetadata,
    gateway: &Gateway,
    plan: &FrequencyPlan,
    config: &RouterConfig,
) -> Result<u32, RouterError> {
    let weights = &config.scoring;
    let frequency = option.gateway_config.frequency;
    let airtime = toa::compute_with_default(option, config.default_payload_size)?;

    let time_score = (airtime.as_secs_f64() * weights.airtime_weight).min(weights.airtime_cap);
    let signal_score = signal_score(rx, weights);
    let utilization_score = utilization_score(gateway, plan, frequency, config);

    let partial = time_score + signal_score + utilization_score;
    if final_score(partial) >= weights.infeasible_score {
        option.score = final_score(partial);
        return Ok(option.score);
    }

    let timestamp = option.gateway_config.timestamp;
    let (identifier, conflicts) = gateway
        .schedule()
        .get_option(timestamp, airtime.as_micros().min(u128::from(u32::MAX)) as u32);
    let schedule_score = if conflicts >= weights.blocked_conflicts {
        weights.blocked_penalty
    } else {
        (f64::from(conflicts) * weights.conflict_weight).min(weights.conflict_cap)
    };

    option.score = final_score(partial + schedule_score);
    if option.score >= weights.infeasible_score {
        gateway.schedule().release(&identifier);
        return Ok(option.score);
    }
    option.identifier = identifier;
    option.deadline = Some(gateway.schedule().realtime(timestamp));
    Ok(option.score)
}

fn signal_score(rx: &GatewayRxMetadata, weights: &ScoringConfig) -> f64 {
    let mut score = 0.0;
    if rx.snr < weights.low_snr_threshold {
        score += weights.low_snr_penalty;
    }
    score + (f64::from(rx.rssi) * weights.rssi_weight).clamp(0.0, weights.rssi_cap)
}

fn utilization_score(gateway: &Gateway, plan: &FrequencyPlan, frequency: u64, config: &RouterConfig) -> f64 {
    let weights = &config.scoring;
    let (gateway_rx, _) = gateway.utilization().get();
    let (channel_rx, channel_tx) = gateway.utilization().get_channel(frequency);

    let mut score = (gateway_rx * weights.gateway_rx_weight).min(weights.gateway_rx_cap)
        + ((channel_tx + channel_rx) * weights.channel_weight).min(weights.channel_cap);

    if plan.enforces_duty_cycle() {
        let bands = config.eu_sub_bands.as_deref().unwrap_or(&plan.duty_cycle_bands);
        match duty_cycle_for(bands, frequency) {
            None => score += weights.duty_cycle_penalty,
            Some(duty_cycle) if channel_tx > duty_cycle => score += weights.duty_cycle_penalty,
            Some(_) => {}
        }
    }
    score
}

fn final_score(total: f64) -> u32 {
    (total * 10.0).round().max(0.0) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::GatewayStatus;
    use crate::radio::{Bandwidth, SpreadingFactor};
    use bytes::Bytes;

    fn eu_gateway(config: &RouterConfig) -> Gateway {
        let gateway = Gateway::new("eui-0102030405060708".into(), config);
        gateway.set_status(GatewayStatus {
            region: Some("EU_863_870".into()),
            ..Default::default()
        });
        gateway.schedule().sync(1_000_000);
        gateway
    }

    fn uplink(frequency: u64, data_rate: &str) -> UplinkMessage {
        UplinkMessage {
            payload: Bytes::from_static(&[0x40, 1, 2, 3, 4, 0, 0, 0, 0, 0]),
            protocol_metadata: Some(LoRaWanMetadata {
                modulation: Modulation::LoRa,
                data_rate: data_rate.into(),
                bit_rate: 0,
                coding_rate: "4/5".into(),
            }),
            gateway_metadata: Some(GatewayRxMetadata {
                gateway_id: "eui-0102030405060708".into(),
                timestamp: Some(1_000_000),
                frequency,
                rssi: -40.0,
                snr: 8.0,
                ..Default::default()
            }),
        }
    }

    #[test]
    fn test_rx1_and_rx2() {
        let config = RouterConfig::default();
        let gateway = eu_gateway(&config);
        let options = build_options(&uplink(868_100_000, "SF7BW125"), false, &gateway, &config);
        assert_eq!(options.len(), 2);

        let rx1 = &options[0];
        assert_eq!(rx1.gateway_config.timestamp, 2_000_000);
        assert_eq!(rx1.gateway_config.frequency, 868_100_000);
        assert_eq!(rx1.protocol_config.data_rate, "SF7BW125");
        assert_eq!(rx1.gateway_config.power, 14);

        let rx2 = &options[1];
        assert_eq!(rx2.gateway_config.timestamp, 3_000_000);
        assert_eq!(rx2.gateway_config.frequency, 869_525_000);
        assert_eq!(rx2.protocol_config.data_rate, "SF9BW125");
        assert_eq!(rx2.gateway_config.power, 27);
        assert_ne!(rx1.identifier, rx2.identifier);
    }

    #[test]
    fn test_activation_windows() {
        let config = RouterConfig::default();
        let gateway = eu_gateway(&config);
        let options = build_options(&uplink(868_100_000, "SF7BW125"), true, &gateway, &config);
        assert_eq!(options.len(), 2);
        assert_eq!(options[0].gateway_config.timestamp, 6_000_000);
        assert_eq!(options[1].gateway_config.timestamp, 7_000_000);
        assert_eq!(options[1].protocol_config.data_rate, "SF12BW125");
    }

    #[test]
    fn test_fsk_channel_outside_sub_bands_is_dropped() {
        let config = RouterConfig::default();
        let gateway = eu_gateway(&config);
        let mut fsk = uplink(868_800_000, "");
        fsk.protocol_metadata = Some(LoRaWanMetadata {
            modulation: Modulation::Fsk,
            data_rate: String::new(),
            bit_rate: 50_000,
            coding_rate: String::new(),
        });

        let options = build_options(&fsk, false, &gateway, &config);
        assert_eq!(options.len(), 1);
        assert_eq!(options[0].gateway_config.frequency, 869_525_000);
    }

    #[test]
    fn test_forbidden_frequency_scores_infeasible() {
        let config = RouterConfig::default();
        let gateway = eu_gateway(&config);
        let plan = gateway.frequency_plan().unwrap();
        let candidate = Candidate {
            timestamp: 2_000_000,
            frequency: 868_800_000,
            power: 14,
            data_rate: DataRate::lora(SpreadingFactor::SF7, Bandwidth::BW125),
            coding_rate: "4/5".into(),
        };
        let mut option = candidate.into_option(&gateway);
        let rx = uplink(868_100_000, "SF7BW125").gateway_metadata.unwrap();
        let score = score_option(&mut option, &rx, &gateway, plan, &config).unwrap();
        assert!(score >= 1000);
        assert!(option.identifier.is_empty());
        assert!(gateway.schedule().is_empty());
    }

    #[test]
    fn test_weak_signal_scores_worse() {
        let config = RouterConfig::default();
        let strong_gw = eu_gateway(&config);
        let weak_gw = eu_gateway(&config);

        let strong = build_options(&uplink(868_100_000, "SF7BW125"), false, &strong_gw, &config);
        let mut weak_uplink = uplink(868_100_000, "SF7BW125");
        if let Some(rx) = weak_uplink.gateway_metadata.as_mut() {
            rx.rssi = -120.0;
            rx.snr = -5.0;
        }
        let weak = build_options(&weak_uplink, false, &weak_gw, &config);
        // +10 for low SNR, +10 (capped) for RSSI, times ten
        assert_eq!(weak[0].score, strong[0].score + 160);
    }

    #[test]
    fn test_conflicts_raise_score() {
        let config = RouterConfig::default();
        let gateway = eu_gateway(&config);
        let first = build_options(&uplink(868_100_000, "SF7BW125"), false, &gateway, &config);
        let second = build_options(&uplink(868_100_000, "SF7BW125"), false, &gateway, &config);
        assert_eq!(second[0].score, first[0].score + 100);

        gateway
            .schedule()
            .schedule(&second[0].identifier, crate::message::DownlinkMessage::for_option(Bytes::new(), second[0].clone()))
            .unwrap();
        let third = build_options(&uplink(868_100_000, "SF7BW125"), false, &gateway, &config);
        // one held and one committed conflict (11 points), capped at 30
        assert_eq!(third[0].score, first[0].score + 300);
        assert_eq!(select_best(&third).unwrap().gateway_config.frequency, 869_525_000);
    }

    #[test]
    fn test_blocked_window_holds_no_slot() {
        let config = RouterConfig::default();
        let gateway = eu_gateway(&config);
        for _ in 0..10 {
            let options = build_options(&uplink(868_100_000, "SF7BW125"), false, &gateway, &config);
            assert_eq!(options.len(), 2);
            for option in options {
                let downlink = crate::message::DownlinkMessage::for_option(Bytes::new(), option.clone());
                gateway.schedule().schedule(&option.identifier, downlink).unwrap();
            }
        }
        assert_eq!(gateway.schedule().len(), 20);

        // 10 committed conflicts in both windows blocks them
        let options = build_options(&uplink(868_100_000, "SF7BW125"), false, &gateway, &config);
        assert!(options.is_empty());
        assert_eq!(gateway.schedule().len(), 20);
    }

    #[test]
    fn test_requires_timestamp_and_region() {
        let config = RouterConfig::default();
        let gateway = Gateway::new("gw".into(), &config);
        assert!(build_options(&uplink(868_100_000, "SF7BW125"), false, &gateway, &config).is_empty());

        let gateway = eu_gateway(&config);
        let mut no_ts = uplink(868_100_000, "SF7BW125");
        if let Some(rx) = no_ts.gateway_metadata.as_mut() {
            rx.timestamp = None;
        }
        assert!(build_options(&no_ts, false, &gateway, &config).is_empty());
    }

    #[test]
    fn test_unknown_uplink_channel_keeps_rx2() {
        let config = RouterConfig::default();
        let gateway = eu_gateway(&config);
        let options = build_options(&uplink(863_500_000, "SF7BW125"), false, &gateway, &config);
        assert_eq!(options.len(), 1);
        assert_eq!(options[0].gateway_config.frequency, 869_525_000);
    }
}
