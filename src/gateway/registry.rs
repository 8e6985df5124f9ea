//! Gateway registry
//!
//! The registry lock only guards lookup and creation; per-gateway work runs
//! under the gateway's own locks so unrelated gateways never serialize.

use super::{Gateway, GatewayId};
use crate::config::RouterConfig;
use log::{debug, info};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct GatewayRegistry {
    config: Arc<RouterConfig>,
    gateways: RwLock<HashMap<GatewayId, Arc<Gateway>>>,
}

impl GatewayRegistry {
    pub fn new(config: Arc<RouterConfig>) -> Self {
        Self {
            config,
            gateways: RwLock::new(HashMap::new()),
        }
    }

    /// The gateway for `id`, created on first use
    pub fn get_or_create(&self, id: &GatewayId) -> Arc<Gateway> {
        if let Some(gateway) = self.get(id) {
            return gateway;
        }
        let mut gateways = self.gateways.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(gateways.entry(id.clone()).or_insert_with(|| {
            debug!("Registering gateway {id}");
            Arc::new(Gateway::new(id.clone(), &self.config))
        }))
    }

    pub fn get(&self, id: &GatewayId) -> Option<Arc<Gateway>> {
        self.gateways
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.gateways.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Point-in-time list of all gateways
    pub fn snapshot(&self) -> Vec<Arc<Gateway>> {
        self.gateways
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Advance the utilization averages of every gateway
    pub fn tick_utilization(&self) {
        for gateway in self.snapshot() {
            gateway.utilization().tick();
        }
    }

    /// Drop gateways idle for longer than `max_idle` that have no downlink subscriber
    pub fn evict_idle(&self, max_idle: Duration) -> Vec<GatewayId> {
        let now = Instant::now();
        let mut gateways = self.gateways.write().unwrap_or_else(|e| e.into_inner());
        let idle: Vec<GatewayId> = gateways
            .iter()
            .filter(|(_, gw)| !gw.schedule().is_active() && now.duration_since(gw.last_seen()) > max_idle)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &idle {
            gateways.remove(id);
        }
        if !idle.is_empty() {
            info!("Evicted {} idle gateways", idle.len());
        }
        idle
    }
}
