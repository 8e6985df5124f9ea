use anyhow::Context;
use bytes::Bytes;
use clap::{Parser, Subcommand};
use log::LevelFilter;
use lora_router::discovery::{Metadata, BROKER_SERVICE};
use lora_router::logging::init_logger_with_level;
use lora_router::message::{DevAddr, GatewayRxMetadata};
use lora_router::{
    log_info, toa, ActivationPolicy, Announcement, DownlinkMessage, FrequencyPlan, GatewayId, GatewayStatus,
    LoRaWanMetadata, MemoryBroker, MemoryDialer, Modulation, Region, Router, RouterConfig, StaticDiscovery,
    UplinkMessage,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "lora-router")]
#[command(about = "CLI tool for the LoRaWAN router core")]
struct Cli {
    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: LevelFilter,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Time on air of a transmission
    Toa {
        /// LoRa data rate, e.g. SF7BW125
        #[arg(short, long, default_value = "SF7BW125")]
        data_rate: String,
        #[arg(short, long, default_value = "4/5")]
        coding_rate: String,
        /// FSK bit rate; selects FSK instead of LoRa
        #[arg(long)]
        bit_rate: Option<u32>,
        #[arg(short, long, default_value_t = toa::DEFAULT_PAYLOAD_SIZE)]
        payload_size: usize,
    },
    /// List the supported frequency plans
    Bands,
    /// Drive a router with synthetic uplinks from one gateway
    Simulate {
        /// Router configuration (JSON)
        #[arg(short, long)]
        config: Option<String>,
        #[arg(short, long, default_value = "EU_863_870")]
        region: String,
        #[arg(short, long, default_value = "10")]
        uplinks: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logger_with_level(cli.log_level);

    match cli.command {
        Commands::Toa {
            data_rate,
            coding_rate,
            bit_rate,
            payload_size,
        } => {
            let airtime = match bit_rate {
                Some(bit_rate) => toa::compute_fsk(payload_size, bit_rate)?,
                None => toa::compute_lora(payload_size, &data_rate, &coding_rate)?,
            };
            println!("{} µs", airtime.as_micros());
        }
        Commands::Bands => {
            for region in Region::ALL {
                print_plan(lora_router::frequency_plan(region));
            }
        }
        Commands::Simulate {
            config,
            region,
            uplinks,
        } => {
            let config = match config {
                Some(path) => RouterConfig::from_json_file(&path).with_context(|| format!("loading {path}"))?,
                None => RouterConfig::default(),
            };
            config.validate()?;
            simulate(config, &region, uplinks).await?;
        }
    }

    Ok(())
}

fn print_plan(plan: &FrequencyPlan) {
    println!(
        "{:<12} {:>3} uplink / {:>2} downlink channels, RX2 {} Hz DR{}, {} dBm",
        plan.region.name(),
        plan.uplink_channels.len(),
        plan.downlink_channels.len(),
        plan.rx2_frequency,
        plan.rx2_data_rate,
        plan.default_tx_power
    );
}

async fn simulate(config: RouterConfig, region: &str, count: u32) -> anyhow::Result<()> {
    let plan = lora_router::frequency_plan_for(region)?;
    let broker = Arc::new(MemoryBroker::new(ActivationPolicy::Reject));
    let dialer = Arc::new(MemoryDialer::new());
    dialer.register("sim-broker", broker.clone());
    let discovery = Arc::new(StaticDiscovery::new(vec![Announcement::new(
        BROKER_SERVICE,
        "sim-broker",
        "memory",
    )
    .with_metadata(Metadata::DevAddrPrefix {
        addr: DevAddr(0),
        length: 0,
    })]));
    let router = Arc::new(Router::new(config, discovery, dialer));

    let cancel = CancellationToken::new();
    let ticker = router.spawn_utilization_ticker(cancel.clone());

    let gateway_id = GatewayId::from_eui(0x0000_0000_0000_0001);
    router.handle_gateway_status(
        &gateway_id,
        GatewayStatus {
            region: Some(plan.region.name().to_string()),
            timestamp: Some(0),
            ..Default::default()
        },
    )?;
    let mut downlinks = router.subscribe_gateway(&gateway_id)?;

    let channel = plan
        .uplink_channels
        .first()
        .context("frequency plan without uplink channels")?;
    let data_rate = plan.data_rate(channel.max_dr)?;
    for n in 0..count {
        let mut payload = vec![0x40, 0x01, 0x00, 0x00, 0x26, 0x00];
        payload.extend_from_slice(&(n as u16).to_le_bytes());
        let uplink = UplinkMessage {
            payload: Bytes::from(payload),
            protocol_metadata: Some(LoRaWanMetadata {
                modulation: Modulation::LoRa,
                data_rate: data_rate.to_string(),
                bit_rate: 0,
                coding_rate: "4/5".to_string(),
            }),
            gateway_metadata: Some(GatewayRxMetadata {
                gateway_id: gateway_id.clone(),
                timestamp: Some(n * 100_000),
                frequency: channel.frequency,
                rssi: -60.0,
                snr: 8.0,
                ..Default::default()
            }),
        };
        router.handle_uplink(&gateway_id, uplink).await?;
    }

    let forwarded = broker.uplinks();
    log_info(&format!("Broker received {} uplinks", forwarded.len()));
    if let Some(last) = forwarded.last() {
        for option in &last.downlink_options {
            println!(
                "option {} at {} Hz ts {} score {}",
                option.identifier, option.gateway_config.frequency, option.gateway_config.timestamp, option.score
            );
        }
        if let Some(best) = lora_router::select_best(&last.downlink_options) {
            router.handle_downlink(DownlinkMessage::for_option(Bytes::from_static(b"\x60"), best.clone()))?;
            match tokio::time::timeout(Duration::from_secs(3), downlinks.recv()).await {
                Ok(Some(downlink)) => println!("delivered downlink at {:?} Hz", downlink.frequency()),
                _ => println!("downlink not delivered"),
            }
        }
    }

    let gateway = router.gateways().get_or_create(&gateway_id);
    let (rx, tx) = gateway.utilization().get();
    println!("utilization rx {rx:.5} tx {tx:.5}");

    router.unsubscribe_gateway(&gateway_id);
    cancel.cancel();
    ticker.await?;
    Ok(())
}
