//! Regional band tables
//!
//! Generic LoRaWAN regional parameters per region, followed by the TTN
//! frequency-plan overrides (extra channels, EU RX2 on SF9).

use super::duty_cycle::EU_SUB_BANDS;
use super::{Channel, FrequencyPlan, Region, Rx1Channel};
use crate::radio::{Bandwidth, DataRate, SpreadingFactor};
use std::time::Duration;

const RECEIVE_DELAY1: Duration = Duration::from_secs(1);
const RECEIVE_DELAY2: Duration = Duration::from_secs(2);
const JOIN_ACCEPT_DELAY1: Duration = Duration::from_secs(5);
const JOIN_ACCEPT_DELAY2: Duration = Duration::from_secs(6);

const MAX_RX1_OFFSET: usize = 5;

/// Build the plan for `region`, TTN overrides included
pub fn build(region: Region) -> FrequencyPlan {
    let mut plan = match region {
        Region::Eu863_870 => eu_863_870(),
        Region::Us902_928 => us_902_928(),
        Region::Au915_928 => au_915_928(),
        Region::As923 => as_923(),
        Region::Kr920_923 => kr_920_923(),
        Region::Cn470_510 => cn_470_510(),
    };
    apply_ttn_overrides(&mut plan);
    plan
}

fn lora(sf: SpreadingFactor, bw: Bandwidth) -> Option<DataRate> {
    Some(DataRate::lora(sf, bw))
}

/// DR0..DR5 = SF12..SF7 on 125kHz
fn bw125_ladder() -> Vec<Option<DataRate>> {
    use SpreadingFactor::*;
    [SF12, SF11, SF10, SF9, SF8, SF7]
        .into_iter()
        .map(|sf| lora(sf, Bandwidth::BW125))
        .collect()
}

/// RX1 data rate decreasing by one step per offset, floored at DR0
fn stepped_rx1_table(max_uplink_dr: usize) -> Vec<Vec<usize>> {
    (0..=max_uplink_dr)
        .map(|dr| (0..=MAX_RX1_OFFSET).map(|offset| dr.saturating_sub(offset)).collect())
        .collect()
}

fn plan(region: Region, data_rates: Vec<Option<DataRate>>) -> FrequencyPlan {
    FrequencyPlan {
        region,
        data_rates,
        uplink_channels: Vec::new(),
        downlink_channels: Vec::new(),
        default_tx_power: 14,
        rx1_channel: Rx1Channel::SameAsUplink,
        rx1_data_rates: Vec::new(),
        rx2_frequency: 0,
        rx2_data_rate: 0,
        receive_delay1: RECEIVE_DELAY1,
        receive_delay2: RECEIVE_DELAY2,
        join_accept_delay1: JOIN_ACCEPT_DELAY1,
        join_accept_delay2: JOIN_ACCEPT_DELAY2,
        duty_cycle_bands: Vec::new(),
    }
}

fn eu_863_870() -> FrequencyPlan {
    let mut data_rates = bw125_ladder();
    data_rates.push(lora(SpreadingFactor::SF7, Bandwidth::BW250));
    data_rates.push(Some(DataRate::fsk(50_000)));

    let mut p = plan(Region::Eu863_870, data_rates);
    p.uplink_channels = vec![
        Channel::new(868_100_000, 0, 5),
        Channel::new(868_300_000, 0, 6),
        Channel::new(868_500_000, 0, 5),
    ];
    p.rx1_data_rates = stepped_rx1_table(7);
    p.rx2_frequency = 869_525_000;
    p.rx2_data_rate = 0;
    p.duty_cycle_bands = EU_SUB_BANDS.to_vec();
    p
}

fn us_902_928() -> FrequencyPlan {
    use SpreadingFactor::*;
    let mut data_rates = vec![
        lora(SF10, Bandwidth::BW125),
        lora(SF9, Bandwidth::BW125),
        lora(SF8, Bandwidth::BW125),
        lora(SF7, Bandwidth::BW125),
        lora(SF8, Bandwidth::BW500),
        None,
        None,
        None,
    ];
    data_rates.extend([SF12, SF11, SF10, SF9, SF8, SF7].map(|sf| lora(sf, Bandwidth::BW500)));

    let mut p = plan(Region::Us902_928, data_rates);
    p.default_tx_power = 20;
    p.uplink_channels = (0..64)
        .map(|i| Channel::new(902_300_000 + 200_000 * i, 0, 3))
        .chain((0..8).map(|i| Channel::new(903_000_000 + 1_600_000 * i, 4, 4)))
        .collect();
    p.downlink_channels = (0..8)
        .map(|i| Channel::new(923_300_000 + 600_000 * i, 8, 13))
        .collect();
    p.rx1_channel = Rx1Channel::Modulo;
    p.rx1_data_rates = vec![
        vec![10, 9, 8, 8],
        vec![11, 10, 9, 8],
        vec![12, 11, 10, 9],
        vec![13, 12, 11, 10],
        vec![13, 13, 12, 11],
    ];
    p.rx2_frequency = 923_300_000;
    p.rx2_data_rate = 8;
    p
}

fn au_915_928() -> FrequencyPlan {
    use SpreadingFactor::*;
    let mut data_rates = bw125_ladder();
    data_rates.push(lora(SF8, Bandwidth::BW500));
    data_rates.push(None);
    data_rates.extend([SF12, SF11, SF10, SF9, SF8, SF7].map(|sf| lora(sf, Bandwidth::BW500)));

    let mut p = plan(Region::Au915_928, data_rates);
    p.default_tx_power = 20;
    p.uplink_channels = (0..64)
        .map(|i| Channel::new(915_200_000 + 200_000 * i, 0, 5))
        .chain((0..8).map(|i| Channel::new(915_900_000 + 1_600_000 * i, 6, 6)))
        .collect();
    p.downlink_channels = (0..8)
        .map(|i| Channel::new(923_300_000 + 600_000 * i, 8, 13))
        .collect();
    p.rx1_channel = Rx1Channel::Modulo;
    p.rx1_data_rates = vec![
        vec![8, 8, 8, 8, 8, 8],
        vec![9, 8, 8, 8, 8, 8],
        vec![10, 9, 8, 8, 8, 8],
        vec![11, 10, 9, 8, 8, 8],
        vec![12, 11, 10, 9, 8, 8],
        vec![13, 12, 11, 10, 9, 8],
        vec![13, 13, 12, 11, 10, 9],
    ];
    p.rx2_frequency = 923_300_000;
    p.rx2_data_rate = 8;
    p
}

fn as_923() -> FrequencyPlan {
    let mut data_rates = bw125_ladder();
    data_rates.push(lora(SpreadingFactor::SF7, Bandwidth::BW250));
    data_rates.push(Some(DataRate::fsk(50_000)));

    let mut p = plan(Region::As923, data_rates);
    p.uplink_channels = vec![Channel::new(923_200_000, 0, 5), Channel::new(923_400_000, 0, 5)];
    p.rx1_data_rates = stepped_rx1_table(7);
    p.rx2_frequency = 923_200_000;
    p.rx2_data_rate = 2;
    p
}

fn kr_920_923() -> FrequencyPlan {
    let mut p = plan(Region::Kr920_923, bw125_ladder());
    p.uplink_channels = vec![
        Channel::new(922_100_000, 0, 5),
        Channel::new(922_300_000, 0, 5),
        Channel::new(922_500_000, 0, 5),
    ];
    p.rx1_data_rates = stepped_rx1_table(5);
    p.rx2_frequency = 921_900_000;
    p.rx2_data_rate = 0;
    p
}

fn cn_470_510() -> FrequencyPlan {
    let mut p = plan(Region::Cn470_510, bw125_ladder());
    p.default_tx_power = 17;
    p.uplink_channels = (0..96).map(|i| Channel::new(470_300_000 + 200_000 * i, 0, 5)).collect();
    p.downlink_channels = (0..48).map(|i| Channel::new(500_300_000 + 200_000 * i, 0, 5)).collect();
    p.rx1_channel = Rx1Channel::Modulo;
    p.rx1_data_rates = stepped_rx1_table(5);
    p.rx2_frequency = 505_300_000;
    p.rx2_data_rate = 0;
    p
}

/// TTN frequency-plan additions on top of the regional defaults
fn apply_ttn_overrides(plan: &mut FrequencyPlan) {
    match plan.region {
        Region::Eu863_870 => {
            for freq in [867_100_000, 867_300_000, 867_500_000, 867_700_000, 867_900_000] {
                plan.uplink_channels.push(Channel::new(freq, 0, 5));
            }
            plan.uplink_channels.push(Channel::new(868_800_000, 7, 7));
            plan.rx2_data_rate = 3;
        }
        Region::As923 => {
            for freq in [922_000_000, 922_200_000, 922_400_000, 922_600_000, 922_800_000, 923_000_000] {
                plan.uplink_channels.push(Channel::new(freq, 0, 5));
            }
        }
        Region::Kr920_923 => {
            for freq in [922_700_000, 922_900_000, 923_100_000, 923_300_000] {
                plan.uplink_channels.push(Channel::new(freq, 0, 5));
            }
        }
        Region::Us902_928 | Region::Au915_928 | Region::Cn470_510 => {}
    }

    // Dynamic-channel plans transmit RX1 on the uplink channel
    if plan.rx1_channel == Rx1Channel::SameAsUplink {
        plan.downlink_channels = plan.uplink_channels.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eu_ttn_channels() {
        let plan = build(Region::Eu863_870);
        assert_eq!(plan.uplink_channels.len(), 9);
        assert_eq!(plan.downlink_channels, plan.uplink_channels);
        assert_eq!(plan.rx2_data_rate, 3);
        assert_eq!(
            plan.data_rate(plan.rx2_data_rate).unwrap(),
            DataRate::lora(SpreadingFactor::SF9, Bandwidth::BW125)
        );
        assert_eq!(plan.data_rate(7).unwrap(), DataRate::fsk(50_000));
    }

    #[test]
    fn test_fixed_plans_channel_counts() {
        let us = build(Region::Us902_928);
        assert_eq!(us.uplink_channels.len(), 72);
        assert_eq!(us.downlink_channels.len(), 8);
        assert_eq!(us.uplink_channels[64].frequency, 903_000_000);
        assert!(us.data_rate(5).is_err());

        let cn = build(Region::Cn470_510);
        assert_eq!(cn.uplink_channels.len(), 96);
        assert_eq!(cn.rx1_frequency(50).unwrap(), 500_300_000 + 200_000 * 2);
    }

    #[test]
    fn test_stepped_rx1_table() {
        let table = stepped_rx1_table(7);
        assert_eq!(table[0], vec![0, 0, 0, 0, 0, 0]);
        assert_eq!(table[5], vec![5, 4, 3, 2, 1, 0]);
        assert_eq!(table[7], vec![7, 6, 5, 4, 3, 2]);
    }
}
