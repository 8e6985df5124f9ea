//! End-to-end router scenarios on an EU 863-870 gateway.

use async_trait::async_trait;
use bytes::Bytes;
use lora_router::band::BandError;
use lora_router::discovery::{Metadata, BROKER_SERVICE};
use lora_router::message::{DevAddr, GatewayRxMetadata};
use lora_router::monitor::MonitorError;
use lora_router::router::stream::run_downlink_stream;
use lora_router::{
    ActivationPolicy, Announcement, DeviceActivationRequest, DownlinkMessage, GatewayId, GatewayStatus,
    LoRaWanMetadata, MemoryBroker, MemoryDialer, Modulation, MonitorClient, MonitorSink, Router, RouterConfig,
    RouterError, StaticDiscovery, UplinkMessage,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const JOIN_ACCEPT: &[u8] = &[0x20, 0xAA, 0xBB, 0xCC];

struct Fixture {
    router: Arc<Router>,
    broker: Arc<MemoryBroker>,
    gateway: GatewayId,
}

fn fixture_with(config: RouterConfig, policies: &[ActivationPolicy]) -> (Fixture, Vec<Arc<MemoryBroker>>) {
    let dialer = Arc::new(MemoryDialer::new());
    let discovery = Arc::new(StaticDiscovery::default());
    let mut brokers = Vec::new();
    for (n, policy) in policies.iter().enumerate() {
        let id = format!("broker-{n}");
        let broker = Arc::new(MemoryBroker::new(policy.clone()));
        dialer.register(&id, broker.clone());
        discovery.add(
            Announcement::new(BROKER_SERVICE, &id, "memory").with_metadata(Metadata::DevAddrPrefix {
                addr: DevAddr(0x2600_0000),
                length: 7,
            }),
        );
        brokers.push(broker);
    }

    let router = Arc::new(Router::new(config, discovery, dialer));
    let gateway = GatewayId::from("eui-b827ebfffe6c279d");
    router
        .handle_gateway_status(
            &gateway,
            GatewayStatus {
                region: Some("EU_863_870".to_string()),
                ..Default::default()
            },
        )
        .unwrap();

    let fixture = Fixture {
        router,
        broker: brokers[0].clone(),
        gateway,
    };
    (fixture, brokers)
}

fn fixture() -> Fixture {
    fixture_with(
        RouterConfig::default(),
        &[ActivationPolicy::Accept(Bytes::from_static(JOIN_ACCEPT))],
    )
    .0
}

fn rx_metadata(gateway: &GatewayId, frequency: u64, timestamp: u32) -> GatewayRxMetadata {
    GatewayRxMetadata {
        gateway_id: gateway.clone(),
        timestamp: Some(timestamp),
        frequency,
        rssi: -40.0,
        snr: 8.0,
        ..Default::default()
    }
}

fn lora(data_rate: &str) -> LoRaWanMetadata {
    LoRaWanMetadata {
        modulation: Modulation::LoRa,
        data_rate: data_rate.to_string(),
        bit_rate: 0,
        coding_rate: "4/5".to_string(),
    }
}

/// Unconfirmed data up from DevAddr 26011BDA
fn data_uplink(gateway: &GatewayId, frequency: u64, timestamp: u32) -> UplinkMessage {
    UplinkMessage {
        payload: Bytes::from_static(&[
            0x40, 0xDA, 0x1B, 0x01, 0x26, 0x00, 0x01, 0x00, 0x01, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66,
        ]),
        protocol_metadata: Some(lora("SF7BW125")),
        gateway_metadata: Some(rx_metadata(gateway, frequency, timestamp)),
    }
}

fn join_request_payload() -> Bytes {
    let mut phy = vec![0x00];
    phy.extend((1..=8u8).rev()); // AppEUI 0102030405060708, little-endian
    phy.extend((0x11..=0x18u8).rev()); // DevEUI 1112131415161718
    phy.extend([0x34, 0x12]);
    phy.extend([0xDE, 0xAD, 0xBE, 0xEF]);
    Bytes::from(phy)
}

fn activation_request(gateway: &GatewayId, timestamp: u32) -> DeviceActivationRequest {
    DeviceActivationRequest {
        payload: join_request_payload(),
        protocol_metadata: Some(lora("SF7BW125")),
        gateway_metadata: Some(rx_metadata(gateway, 868_100_000, timestamp)),
        activation_metadata: None,
        downlink_options: Vec::new(),
    }
}

/// Tests that an uplink reaches the broker with RX1 and RX2 options held in the schedule.
#[tokio::test]
async fn test_uplink_forwarded_with_two_options() {
    let f = fixture();
    f.router
        .handle_uplink(&f.gateway, data_uplink(&f.gateway, 868_100_000, 1_000_000))
        .await
        .unwrap();

    let uplinks = f.broker.uplinks();
    assert_eq!(uplinks.len(), 1);
    let options = &uplinks[0].downlink_options;
    assert_eq!(options.len(), 2);

    let rx1 = &options[0];
    assert_eq!(rx1.gateway_config.timestamp, 2_000_000);
    assert_eq!(rx1.gateway_config.frequency, 868_100_000);
    assert_eq!(rx1.gateway_id, f.gateway);
    assert!(rx1.deadline.is_some());
    assert_eq!(options[1].gateway_config.frequency, 869_525_000);
    assert_eq!(options[1].gateway_config.timestamp, 3_000_000);

    let gateway = f.router.gateways().get(&f.gateway).unwrap();
    assert_eq!(gateway.schedule().len(), 2);
    assert!(options.iter().all(|o| !o.identifier.is_empty() && o.score < 1000));
}

/// Tests that both offered options accept a downlink, RX2 first.
#[tokio::test]
async fn test_both_offered_options_commit() {
    let f = fixture();
    f.router
        .handle_uplink(&f.gateway, data_uplink(&f.gateway, 868_100_000, 1_000_000))
        .await
        .unwrap();
    let options = f.broker.uplinks()[0].downlink_options.clone();
    assert_eq!(options.len(), 2);

    let payload = Bytes::from_static(&[0x60, 0xDA, 0x1B, 0x01, 0x26]);
    f.router
        .handle_downlink(DownlinkMessage::for_option(payload.clone(), options[1].clone()))
        .unwrap();
    f.router
        .handle_downlink(DownlinkMessage::for_option(payload, options[0].clone()))
        .unwrap();

    let gateway = f.router.gateways().get(&f.gateway).unwrap();
    assert_eq!(gateway.schedule().len(), 2);
    gateway.utilization().tick();
    let (_, rx2_tx) = gateway.utilization().get_channel(869_525_000);
    let (_, rx1_tx) = gateway.utilization().get_channel(868_100_000);
    assert!(rx2_tx > 0.0);
    assert!(rx1_tx > 0.0);
}

/// Tests that uplinks for DevAddrs no broker claims are not forwarded.
#[tokio::test]
async fn test_uplink_without_broker() {
    let f = fixture();
    let mut uplink = data_uplink(&f.gateway, 868_100_000, 1_000_000);
    uplink.payload = Bytes::from_static(&[0x40, 0x01, 0x00, 0x00, 0x01, 0x00, 0x01, 0x00]);
    f.router.handle_uplink(&f.gateway, uplink).await.unwrap();
    assert!(f.broker.uplinks().is_empty());

    let proprietary = UplinkMessage {
        payload: Bytes::from_static(&[0xE0, 0x00]),
        ..data_uplink(&f.gateway, 868_100_000, 1_000_000)
    };
    assert!(matches!(
        f.router.handle_uplink(&f.gateway, proprietary).await,
        Err(RouterError::InvalidMessage(_))
    ));
}

/// Tests that an FSK uplink on 868.8 MHz only gets the RX2 option.
#[tokio::test]
async fn test_fsk_uplink_only_offers_rx2() {
    let f = fixture();
    let mut uplink = data_uplink(&f.gateway, 868_800_000, 1_000_000);
    uplink.protocol_metadata = Some(LoRaWanMetadata {
        modulation: Modulation::Fsk,
        data_rate: String::new(),
        bit_rate: 50_000,
        coding_rate: String::new(),
    });
    f.router.handle_uplink(&f.gateway, uplink).await.unwrap();

    let options = &f.broker.uplinks()[0].downlink_options;
    assert_eq!(options.len(), 1);
    assert_eq!(options[0].gateway_config.frequency, 869_525_000);
}

/// Tests committing a downlink to an offered option and receiving it on the downlink stream.
#[tokio::test]
async fn test_downlink_commit_and_delivery() {
    let f = fixture();
    let (tx, mut rx) = mpsc::channel::<DownlinkMessage>(4);
    let cancel = CancellationToken::new();
    let session = {
        let router = Arc::clone(&f.router);
        let gateway = f.gateway.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { run_downlink_stream(&router, gateway, tx, cancel).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    f.router
        .handle_uplink(&f.gateway, data_uplink(&f.gateway, 868_100_000, 1_000_000))
        .await
        .unwrap();
    let rx1 = f.broker.uplinks()[0].downlink_options[0].clone();

    let downlink = DownlinkMessage {
        payload: Bytes::from_static(&[0x60, 0xDA, 0x1B, 0x01, 0x26]),
        protocol_config: None,
        gateway_config: None,
        option: Some(rx1.clone()),
    };
    f.router.handle_downlink(downlink).unwrap();

    // Committing an unknown option fails without side effects
    let mut bogus = rx1.clone();
    bogus.identifier = "00".repeat(16);
    let err = f
        .router
        .handle_downlink(DownlinkMessage::for_option(Bytes::from_static(b"x"), bogus))
        .unwrap_err();
    assert!(err.is_not_found());

    let delivered = timeout(Duration::from_secs(3), rx.recv()).await.unwrap().unwrap();
    assert_eq!(delivered.frequency(), Some(868_100_000));
    assert_eq!(delivered.gateway_config.as_ref().map(|c| c.timestamp), Some(2_000_000));
    assert!(delivered.protocol_config.is_some());

    // Delivered options are gone
    assert!(f
        .router
        .handle_downlink(DownlinkMessage::for_option(Bytes::new(), rx1))
        .unwrap_err()
        .is_not_found());

    cancel.cancel();
    assert_eq!(session.await.unwrap().unwrap(), 1);
}

/// Tests that a downlink cannot target a gateway the router never saw.
#[tokio::test]
async fn test_downlink_for_unknown_gateway() {
    let f = fixture();
    f.router
        .handle_uplink(&f.gateway, data_uplink(&f.gateway, 868_100_000, 1_000_000))
        .await
        .unwrap();
    let mut option = f.broker.uplinks()[0].downlink_options[0].clone();
    option.gateway_id = GatewayId::from("eui-0000000000000000");

    let err = f
        .router
        .handle_downlink(DownlinkMessage::for_option(Bytes::new(), option))
        .unwrap_err();
    assert!(matches!(err, RouterError::GatewayNotFound(_)));
}

/// Tests the device activation round trip up to the committed join-accept.
#[tokio::test]
async fn test_activation_accepted() {
    let f = fixture();
    let response = f
        .router
        .handle_activation(&f.gateway, activation_request(&f.gateway, 1_000_000))
        .await
        .unwrap();
    assert_eq!(response.payload, Bytes::from_static(JOIN_ACCEPT));

    let requests = f.broker.activations();
    assert_eq!(requests.len(), 1);
    let metadata = requests[0].activation_metadata.clone().unwrap();
    assert_eq!(metadata.app_eui, "0102030405060708");
    assert_eq!(metadata.dev_eui, "1112131415161718");

    let options = &requests[0].downlink_options;
    assert_eq!(options.len(), 2);
    assert_eq!(options[0].gateway_config.timestamp, 6_000_000);
    assert_eq!(options[1].gateway_config.timestamp, 7_000_000);
    assert_eq!(options[1].protocol_config.data_rate, "SF12BW125");

    let chosen = response.downlink_option.unwrap();
    assert!(options.iter().any(|o| o.identifier == chosen.identifier));
    let gateway = f.router.gateways().get(&f.gateway).unwrap();
    assert_eq!(gateway.schedule().len(), 2);
}

/// Tests that a join-request arriving as an uplink goes through activation.
#[tokio::test]
async fn test_join_request_uplink_activates() {
    let f = fixture();
    let request = activation_request(&f.gateway, 1_000_000);
    let uplink = UplinkMessage {
        payload: request.payload,
        protocol_metadata: request.protocol_metadata,
        gateway_metadata: request.gateway_metadata,
    };
    f.router.handle_uplink(&f.gateway, uplink).await.unwrap();
    assert_eq!(f.broker.activations().len(), 1);
    assert!(f.broker.uplinks().is_empty());
}

/// Tests that activation fails when every broker rejects and succeeds when any accepts.
#[tokio::test]
async fn test_activation_fan_out() {
    let (rejecting, _) = fixture_with(
        RouterConfig::default(),
        &[ActivationPolicy::Reject, ActivationPolicy::Reject],
    );
    let err = rejecting
        .router
        .handle_activation(&rejecting.gateway, activation_request(&rejecting.gateway, 1_000_000))
        .await
        .unwrap_err();
    assert!(matches!(err, RouterError::ActivationRejected));

    let (mixed, brokers) = fixture_with(
        RouterConfig::default(),
        &[
            ActivationPolicy::Reject,
            ActivationPolicy::Accept(Bytes::from_static(JOIN_ACCEPT)),
        ],
    );
    let response = mixed
        .router
        .handle_activation(&mixed.gateway, activation_request(&mixed.gateway, 1_000_000))
        .await
        .unwrap();
    assert_eq!(response.payload, Bytes::from_static(JOIN_ACCEPT));
    assert!(brokers.iter().all(|b| b.activations().len() == 1));
}

/// Tests that activation without a reported region is refused as a configuration error.
#[tokio::test]
async fn test_activation_without_region() {
    let f = fixture();
    let unknown = GatewayId::from("eui-0000000000000001");
    let err = f
        .router
        .handle_activation(&unknown, activation_request(&unknown, 1_000_000))
        .await
        .unwrap_err();
    assert!(matches!(err, RouterError::Band(BandError::RegionNotReported)));
    assert!(err.is_configuration());
    assert!(!err.is_capacity());
}

/// Tests that activation without a gateway timestamp is an invalid message.
#[tokio::test]
async fn test_activation_without_timestamp() {
    let f = fixture();
    let mut request = activation_request(&f.gateway, 1_000_000);
    if let Some(rx) = request.gateway_metadata.as_mut() {
        rx.timestamp = None;
    }
    let err = f.router.handle_activation(&f.gateway, request).await.unwrap_err();
    assert!(matches!(err, RouterError::InvalidMessage(_)));
    assert!(!err.is_capacity());
}

#[derive(Default)]
struct RecordingSink {
    kinds: Mutex<Vec<&'static str>>,
}

impl RecordingSink {
    fn push(&self, kind: &'static str) -> Result<(), MonitorError> {
        self.kinds.lock().unwrap().push(kind);
        Ok(())
    }
}

#[async_trait]
impl MonitorSink for RecordingSink {
    async fn uplink(&self, _: &GatewayId, _: &UplinkMessage) -> Result<(), MonitorError> {
        self.push("uplink")
    }

    async fn downlink(&self, _: &GatewayId, _: &DownlinkMessage) -> Result<(), MonitorError> {
        self.push("downlink")
    }

    async fn status(&self, _: &GatewayId, _: &GatewayStatus) -> Result<(), MonitorError> {
        self.push("status")
    }

    async fn activation(&self, _: &GatewayId, _: &DeviceActivationRequest) -> Result<(), MonitorError> {
        self.push("activation")
    }
}

/// Tests that gateway traffic is copied to the monitor.
#[tokio::test]
async fn test_monitor_receives_traffic() {
    let sink = Arc::new(RecordingSink::default());
    let monitor = Arc::new(MonitorClient::new(sink.clone(), Default::default()));
    monitor.open().await.unwrap();

    let broker = Arc::new(MemoryBroker::new(ActivationPolicy::Reject));
    let dialer = Arc::new(MemoryDialer::new());
    dialer.register("b", broker);
    let discovery = Arc::new(StaticDiscovery::new(vec![Announcement::new(BROKER_SERVICE, "b", "memory")]));
    let router = Router::new(RouterConfig::default(), discovery, dialer).with_monitor(monitor.clone());

    let gateway = GatewayId::from("gw");
    router
        .handle_gateway_status(
            &gateway,
            GatewayStatus {
                region: Some("EU_863_870".to_string()),
                ..Default::default()
            },
        )
        .unwrap();
    router
        .handle_uplink(&gateway, data_uplink(&gateway, 868_100_000, 1_000_000))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    let kinds = sink.kinds.lock().unwrap().clone();
    assert_eq!(kinds, ["status", "uplink"]);
    monitor.close();
}

/// Tests that the utilization ticker folds received airtime into the averages.
#[tokio::test]
async fn test_utilization_ticker() {
    let config = RouterConfig {
        utilization_tick_interval_ms: 20,
        ..Default::default()
    };
    let (f, _) = fixture_with(config, &[ActivationPolicy::Reject]);
    let cancel = CancellationToken::new();
    let ticker = f.router.spawn_utilization_ticker(cancel.clone());

    f.router
        .handle_uplink(&f.gateway, data_uplink(&f.gateway, 868_100_000, 1_000_000))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let gateway = f.router.gateways().get(&f.gateway).unwrap();
    let (rx, tx) = gateway.utilization().get();
    assert!(rx > 0.0);
    assert_eq!(tx, 0.0);
    assert!(gateway.utilization().get_channel(868_100_000).0 > 0.0);

    cancel.cancel();
    timeout(Duration::from_secs(1), ticker).await.unwrap().unwrap();
}
