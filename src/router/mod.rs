//! # LoRaWAN Router
//!
//! This module provides the [`Router`] struct, the entry point that connects
//! gateways to brokers. It keeps per-gateway state in a [`GatewayRegistry`],
//! offers scored downlink options with every uplink, forwards uplinks to the
//! brokers responsible for the device address, and delivers committed
//! downlinks back to the gateway in transmit order.
//!
//! Collaborators (discovery, broker transport, monitor, token validation) are
//! injected as trait objects.

pub mod auth;
pub mod options;
pub mod stream;

pub use auth::{GatewayCredentials, StaticTokens, TokenValidator};
pub use options::{build_options, select_best};

use crate::broker::{BrokerClient, BrokerDialer};
use crate::config::RouterConfig;
use crate::discovery::{Announcement, Discovery, BROKER_SERVICE};
use crate::error::RouterError;
use crate::gateway::{Gateway, GatewayId, GatewayRegistry};
use crate::message::{
    dev_addr, join_request_euis, mtype, ActivationMetadata, DeviceActivationRequest, DeviceActivationResponse,
    DownlinkMessage, GatewayStatus, MType, RouterUplink, UplinkMessage,
};
use crate::monitor::{MonitorClient, MonitorMessage};
use crate::ratelimit::RateLimiter;
use crate::util::{log_payload_hex, ThrottleManager};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Routes traffic between gateways and brokers.
pub struct Router {
    config: Arc<RouterConfig>,
    gateways: GatewayRegistry,
    discovery: Arc<dyn Discovery>,
    dialer: Arc<dyn BrokerDialer>,
    /// Dialed broker clients by announcement id
    brokers: RwLock<HashMap<String, Arc<dyn BrokerClient>>>,
    monitor: Option<Arc<MonitorClient>>,
    validator: Option<Arc<dyn TokenValidator>>,
    uplink_limiter: RateLimiter,
    status_limiter: RateLimiter,
    throttles: ThrottleManager,
}

impl Router {
    /// Creates a router without monitor or token validator.
    pub fn new(config: RouterConfig, discovery: Arc<dyn Discovery>, dialer: Arc<dyn BrokerDialer>) -> Self {
        let config = Arc::new(config);
        let limits = &config.rate_limit;
        Self {
            gateways: GatewayRegistry::new(Arc::clone(&config)),
            discovery,
            dialer,
            brokers: RwLock::new(HashMap::new()),
            monitor: None,
            validator: None,
            uplink_limiter: RateLimiter::new(limits.uplink_per_sec, limits.uplink_burst),
            status_limiter: RateLimiter::new(limits.status_per_sec, limits.status_burst),
            throttles: ThrottleManager::new(config.monitor.warn_window_ms, config.monitor.warn_cap),
            config,
        }
    }

    /// Copies gateway traffic to `monitor`.
    pub fn with_monitor(mut self, monitor: Arc<MonitorClient>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Validates gateway tokens with `validator`.
    pub fn with_token_validator(mut self, validator: Arc<dyn TokenValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn gateways(&self) -> &GatewayRegistry {
        &self.gateways
    }

    pub fn uplink_limiter(&self) -> &RateLimiter {
        &self.uplink_limiter
    }

    pub fn status_limiter(&self) -> &RateLimiter {
        &self.status_limiter
    }

    /// Announce this router to discovery.
    pub async fn announce(&self, token: &str) -> Result<(), RouterError> {
        self.discovery.announce(token).await?;
        info!("Router {} announced", self.config.router_id);
        Ok(())
    }

    /// Checks gateway credentials and returns the authenticated id.
    ///
    /// With `skip_verify_gateway_token` set, missing or invalid tokens are
    /// logged and accepted.
    pub async fn authenticate(&self, credentials: &GatewayCredentials) -> Result<GatewayId, RouterError> {
        if credentials.id.as_str().is_empty() {
            return Err(RouterError::Unauthenticated("empty gateway id".to_string()));
        }

        let valid = match (&credentials.token, &self.validator) {
            (Some(token), Some(validator)) => validator.validate(&credentials.id, token).await,
            _ => false,
        };
        if valid {
            return Ok(credentials.id.clone());
        }
        if self.config.skip_verify_gateway_token {
            debug!("Gateway {}: accepting unverified token", credentials.id);
            return Ok(credentials.id.clone());
        }
        match credentials.token {
            None => Err(RouterError::Unauthenticated(format!("no token for {}", credentials.id))),
            Some(_) => Err(RouterError::Unauthenticated(format!("invalid token for {}", credentials.id))),
        }
    }

    /// Stores a gateway status report.
    pub fn handle_gateway_status(&self, id: &GatewayId, status: GatewayStatus) -> Result<(), RouterError> {
        let gateway = self.gateways.get_or_create(id);
        if let Some(timestamp) = status.timestamp {
            gateway.schedule().sync(timestamp);
        }
        gateway.set_status(status.clone());
        gateway.touch();
        if let Err(e) = gateway.frequency_plan() {
            debug!("Gateway {id}: {e}");
        }

        self.push_monitor(MonitorMessage::Status {
            gateway_id: id.clone(),
            status,
        });
        Ok(())
    }

    /// Handles an uplink received by gateway `id`.
    ///
    /// Data frames are forwarded to every broker claiming the DevAddr, each
    /// with the same downlink options. Join-requests go through activation.
    pub async fn handle_uplink(&self, id: &GatewayId, uplink: UplinkMessage) -> Result<(), RouterError> {
        let gateway = self.gateways.get_or_create(id);
        log_payload_hex("Uplink PHY", &uplink.payload);
        self.record_reception(&gateway, &uplink)?;

        self.push_monitor(MonitorMessage::Uplink {
            gateway_id: id.clone(),
            message: uplink.clone(),
        });

        match mtype(&uplink.payload) {
            Some(MType::JoinRequest) => {
                let request = DeviceActivationRequest {
                    payload: uplink.payload.clone(),
                    protocol_metadata: uplink.protocol_metadata.clone(),
                    gateway_metadata: uplink.gateway_metadata.clone(),
                    activation_metadata: None,
                    downlink_options: Vec::new(),
                };
                self.activate(&gateway, request).await.map(|_| ())
            }
            Some(m) if m.is_data() => self.forward_uplink(&gateway, uplink).await,
            other => Err(RouterError::InvalidMessage(format!("unsupported uplink type {other:?}"))),
        }
    }

    /// Utilization, clock sync and status bookkeeping for a reception
    fn record_reception(&self, gateway: &Gateway, uplink: &UplinkMessage) -> Result<(), RouterError> {
        gateway.utilization().add_rx(uplink)?;
        if let Some(timestamp) = uplink.gateway_timestamp() {
            gateway.schedule().sync(timestamp);
        }
        if let Err(e) = gateway.frequency_plan() {
            debug!("Gateway {}: {e}", gateway.id());
        }
        gateway.touch();
        Ok(())
    }

    async fn forward_uplink(&self, gateway: &Gateway, uplink: UplinkMessage) -> Result<(), RouterError> {
        let addr = dev_addr(&uplink.payload)
            .ok_or_else(|| RouterError::InvalidMessage("data frame too short for DevAddr".to_string()))?;

        let downlink_options = options::build_options(&uplink, false, gateway, &self.config);
        let announcements = self.discovery.get_all_brokers_for_dev_addr(addr).await?;
        if announcements.is_empty() {
            debug!("No broker for DevAddr {addr}");
            return Ok(());
        }
        debug!(
            "Gateway {}: forwarding {addr} to {} brokers with {} options",
            gateway.id(),
            announcements.len(),
            downlink_options.len()
        );

        let message = RouterUplink {
            uplink,
            downlink_options,
        };
        let mut forwards = JoinSet::new();
        for announcement in &announcements {
            let client = match self.broker_client(announcement).await {
                Ok(client) => client,
                Err(e) => {
                    warn!("Broker {}: {e}", announcement.id);
                    continue;
                }
            };
            let broker_id = announcement.id.clone();
            let message = message.clone();
            forwards.spawn(async move { (broker_id, client.uplink(message).await) });
        }

        while let Some(result) = forwards.join_next().await {
            match result {
                Ok((_, Ok(()))) => {}
                Ok((broker_id, Err(e))) => warn!("Broker {broker_id} did not accept uplink: {e}"),
                Err(e) => warn!("Uplink forward task failed: {e}"),
            }
        }
        Ok(())
    }

    /// The client for `announcement`, dialed on first use
    async fn broker_client(&self, announcement: &Announcement) -> Result<Arc<dyn BrokerClient>, RouterError> {
        let cached = self
            .brokers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&announcement.id)
            .cloned();
        if let Some(client) = cached {
            return Ok(client);
        }

        let client = self.dialer.dial(announcement).await?;
        info!("Connected to broker {} at {}", announcement.id, announcement.net_address);
        self.brokers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(announcement.id.clone(), Arc::clone(&client));
        Ok(client)
    }

    /// Commits a broker's downlink to the option it references.
    ///
    /// Unknown, delivered or expired options are logged and returned as
    /// not-found; nothing is scheduled.
    pub fn handle_downlink(&self, mut downlink: DownlinkMessage) -> Result<(), RouterError> {
        downlink.resolve_configs();
        let option = downlink
            .option
            .as_ref()
            .ok_or_else(|| RouterError::InvalidMessage("downlink without option".to_string()))?;
        let gateway_id = option.gateway_id.clone();
        let identifier = option.identifier.clone();

        let gateway = self
            .gateways
            .get(&gateway_id)
            .ok_or_else(|| RouterError::GatewayNotFound(gateway_id.to_string()))?;

        if let Err(e) = gateway.schedule().schedule(&identifier, downlink.clone()) {
            if self.throttles.allow(gateway_id.as_str()) {
                warn!("Gateway {gateway_id}: could not schedule downlink: {e}");
            }
            return Err(e.into());
        }

        log_payload_hex("Downlink PHY", &downlink.payload);
        if let Err(e) = gateway.utilization().add_tx(&downlink) {
            debug!("Gateway {gateway_id}: no airtime for downlink: {e}");
        }
        self.push_monitor(MonitorMessage::Downlink {
            gateway_id,
            message: downlink,
        });
        Ok(())
    }

    /// Starts delivering committed downlinks for gateway `id`.
    pub fn subscribe_gateway(&self, id: &GatewayId) -> Result<tokio::sync::mpsc::Receiver<DownlinkMessage>, RouterError> {
        let gateway = self.gateways.get_or_create(id);
        let downlinks = gateway.schedule().subscribe()?;
        info!("Gateway {id} subscribed to downlinks");
        Ok(downlinks)
    }

    /// Stops delivering downlinks for gateway `id`.
    pub fn unsubscribe_gateway(&self, id: &GatewayId) {
        if let Some(gateway) = self.gateways.get(id) {
            gateway.schedule().stop();
            info!("Gateway {id} unsubscribed from downlinks");
        }
    }

    /// Handles a device activation received by gateway `id`.
    ///
    /// Every broker sees the request; the first to accept wins and its
    /// join-accept is committed to the option it picked.
    pub async fn handle_activation(
        &self,
        id: &GatewayId,
        request: DeviceActivationRequest,
    ) -> Result<DeviceActivationResponse, RouterError> {
        if self.uplink_limiter.limit(id) {
            if self.throttles.allow(id.as_str()) {
                warn!("Gateway {id} rate limited, dropping activation");
            }
            return Err(RouterError::ResourceExhausted(format!("gateway {id} rate limited")));
        }

        let gateway = self.gateways.get_or_create(id);
        self.record_reception(&gateway, &request.as_uplink())?;
        self.push_monitor(MonitorMessage::Activation {
            gateway_id: id.clone(),
            request: request.clone(),
        });

        self.activate(&gateway, request).await
    }

    async fn activate(
        &self,
        gateway: &Gateway,
        mut request: DeviceActivationRequest,
    ) -> Result<DeviceActivationResponse, RouterError> {
        if request.activation_metadata.is_none() {
            request.activation_metadata =
                join_request_euis(&request.payload).map(|(app_eui, dev_eui)| ActivationMetadata { app_eui, dev_eui });
        }

        request.downlink_options = options::build_options(&request.as_uplink(), true, gateway, &self.config);
        if request.downlink_options.is_empty() {
            gateway.frequency_plan()?;
            let timestamp = request.gateway_metadata.as_ref().and_then(|rx| rx.timestamp);
            if timestamp.is_none() || request.protocol_metadata.is_none() {
                return Err(RouterError::InvalidMessage(
                    "activation without LoRaWAN metadata or gateway timestamp".to_string(),
                ));
            }
            // Every window was infeasible or blocked
            return Err(RouterError::ResourceExhausted(format!(
                "no downlink window for activation on {}",
                gateway.id()
            )));
        }

        let announcements = self.discovery.get_all(BROKER_SERVICE).await?;
        let mut activations = JoinSet::new();
        for announcement in &announcements {
            let client = match self.broker_client(announcement).await {
                Ok(client) => client,
                Err(e) => {
                    warn!("Broker {}: {e}", announcement.id);
                    continue;
                }
            };
            let request = request.clone();
            activations.spawn(async move { client.activate(request).await });
        }

        let mut accepted = None;
        while let Some(result) = activations.join_next().await {
            match result {
                Ok(Ok(response)) => {
                    accepted = Some(response);
                    break;
                }
                Ok(Err(e)) => debug!("Broker did not accept activation: {e}"),
                Err(e) => warn!("Activation task failed: {e}"),
            }
        }
        let response = accepted.ok_or(RouterError::ActivationRejected)?;

        if !activations.is_empty() {
            let gateway_id = gateway.id().clone();
            tokio::spawn(async move {
                while let Some(result) = activations.join_next().await {
                    if matches!(result, Ok(Ok(_))) {
                        warn!("Gateway {gateway_id}: duplicate activation response ignored");
                    }
                }
            });
        }

        let option = response
            .downlink_option
            .clone()
            .ok_or_else(|| RouterError::InvalidMessage("activation response without downlink option".to_string()))?;
        self.handle_downlink(DownlinkMessage::for_option(response.payload.clone(), option))?;
        Ok(response)
    }

    /// Ticks every gateway's utilization until `cancel` fires.
    ///
    /// Also evicts idle gateways when `gateway_idle_timeout_secs` is set.
    pub fn spawn_utilization_ticker(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let router = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(router.config.utilization_tick_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                router.gateways.tick_utilization();

                if let Some(max_idle) = router.config.gateway_idle_timeout() {
                    for id in router.gateways.evict_idle(max_idle) {
                        router.throttles.forget(id.as_str());
                        router.uplink_limiter.forget(&id);
                        router.status_limiter.forget(&id);
                    }
                }
            }
            debug!("Utilization ticker stopped");
        })
    }

    fn push_monitor(&self, message: MonitorMessage) {
        if let Some(monitor) = &self.monitor {
            // Drops are logged by the client
            let _ = monitor.send(message);
        }
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("router_id", &self.config.router_id)
            .field("gateways", &self.gateways.len())
            .field("monitor", &self.monitor.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{ActivationPolicy, MemoryBroker, MemoryDialer};
    use crate::discovery::StaticDiscovery;

    fn router(config: RouterConfig) -> Router {
        Router::new(
            config,
            Arc::new(StaticDiscovery::default()),
            Arc::new(MemoryDialer::new()),
        )
    }

    #[tokio::test]
    async fn test_authenticate() {
        let tokens = Arc::new(StaticTokens::new());
        tokens.insert("gw", "secret");
        let strict = router(RouterConfig::default()).with_token_validator(tokens.clone());

        let ok = GatewayCredentials::new("gw", Some("secret"));
        assert_eq!(strict.authenticate(&ok).await.unwrap(), GatewayId::from("gw"));
        for bad in [
            GatewayCredentials::new("gw", Some("guess")),
            GatewayCredentials::new("gw", None),
            GatewayCredentials::new("", Some("secret")),
        ] {
            assert!(matches!(
                strict.authenticate(&bad).await,
                Err(RouterError::Unauthenticated(_))
            ));
        }

        let lenient = router(RouterConfig {
            skip_verify_gateway_token: true,
            ..Default::default()
        })
        .with_token_validator(tokens);
        assert!(lenient.authenticate(&GatewayCredentials::new("gw", Some("guess"))).await.is_ok());
    }

    #[tokio::test]
    async fn test_downlink_for_unknown_gateway() {
        let router = router(RouterConfig::default());
        let err = router.handle_downlink(DownlinkMessage {
            payload: Default::default(),
            protocol_config: None,
            gateway_config: None,
            option: None,
        });
        assert!(matches!(err, Err(RouterError::InvalidMessage(_))));
    }

    #[tokio::test]
    async fn test_activation_rate_limited() {
        let config = RouterConfig {
            rate_limit: crate::config::RateLimitConfig {
                uplink_per_sec: 0.001,
                uplink_burst: 1,
                ..Default::default()
            },
            ..Default::default()
        };
        let router = router(config);
        let id = GatewayId::from("gw");
        let request = DeviceActivationRequest {
            payload: Default::default(),
            protocol_metadata: None,
            gateway_metadata: None,
            activation_metadata: None,
            downlink_options: Vec::new(),
        };

        // First one passes the limiter but has no options
        let first = router.handle_activation(&id, request.clone()).await;
        assert!(first.is_err());
        let second = router.handle_activation(&id, request).await;
        assert!(matches!(second, Err(RouterError::ResourceExhausted(msg)) if msg.contains("rate limited")));
    }

    #[tokio::test]
    async fn test_broker_clients_are_cached() {
        let dialer = Arc::new(MemoryDialer::new());
        dialer.register("b", Arc::new(MemoryBroker::new(ActivationPolicy::Reject)));
        let router = Router::new(RouterConfig::default(), Arc::new(StaticDiscovery::default()), dialer);

        let announcement = Announcement::new(BROKER_SERVICE, "b", "mem");
        let first = router.broker_client(&announcement).await.unwrap();
        let second = router.broker_client(&announcement).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }
}
