//! # Broker Collaborator
//!
//! The router forwards uplinks to brokers and asks them to accept device
//! activations. Transport is behind [`BrokerClient`]; a [`BrokerDialer`]
//! opens a client for a discovered announcement.
//!
//! [`MemoryBroker`] keeps everything in process: it records uplinks and
//! answers activations according to an [`ActivationPolicy`].

use crate::discovery::Announcement;
use crate::message::{DeviceActivationRequest, DeviceActivationResponse, RouterUplink};
use crate::router::options::select_best;
use async_trait::async_trait;
use bytes::Bytes;
use log::debug;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BrokerError {
    #[error("Broker rejected the request: {0}")]
    Rejected(String),

    #[error("Broker transport error: {0}")]
    Transport(String),

    #[error("Could not dial broker at {address}: {reason}")]
    Dial { address: String, reason: String },
}

#[async_trait]
pub trait BrokerClient: Send + Sync {
    async fn uplink(&self, uplink: RouterUplink) -> Result<(), BrokerError>;

    async fn activate(&self, request: DeviceActivationRequest) -> Result<DeviceActivationResponse, BrokerError>;
}

#[async_trait]
pub trait BrokerDialer: Send + Sync {
    async fn dial(&self, announcement: &Announcement) -> Result<Arc<dyn BrokerClient>, BrokerError>;
}

/// How a [`MemoryBroker`] answers activations
#[derive(Debug, Clone)]
pub enum ActivationPolicy {
    /// Reply with this join-accept on the best option
    Accept(Bytes),
    Reject,
}

/// In-process broker recording everything it receives
#[derive(Debug)]
pub struct MemoryBroker {
    policy: ActivationPolicy,
    uplinks: Mutex<Vec<RouterUplink>>,
    activations: Mutex<Vec<DeviceActivationRequest>>,
}

impl MemoryBroker {
    pub fn new(policy: ActivationPolicy) -> Self {
        Self {
            policy,
            uplinks: Mutex::new(Vec::new()),
            activations: Mutex::new(Vec::new()),
        }
    }

    pub fn uplinks(&self) -> Vec<RouterUplink> {
        self.uplinks.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn activations(&self) -> Vec<DeviceActivationRequest> {
        self.activations.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl BrokerClient for MemoryBroker {
    async fn uplink(&self, uplink: RouterUplink) -> Result<(), BrokerError> {
        debug!("Broker received uplink with {} options", uplink.downlink_options.len());
        self.uplinks.lock().unwrap_or_else(|e| e.into_inner()).push(uplink);
        Ok(())
    }

    async fn activate(&self, request: DeviceActivationRequest) -> Result<DeviceActivationResponse, BrokerError> {
        let best = select_best(&request.downlink_options).cloned();
        self.activations.lock().unwrap_or_else(|e| e.into_inner()).push(request);

        match &self.policy {
            ActivationPolicy::Reject => Err(BrokerError::Rejected("device not registered".to_string())),
            ActivationPolicy::Accept(join_accept) => {
                let option = best.ok_or_else(|| BrokerError::Rejected("no downlink option".to_string()))?;
                Ok(DeviceActivationResponse {
                    payload: join_accept.clone(),
                    downlink_option: Some(option),
                })
            }
        }
    }
}

/// Dials pre-registered clients by announcement id
#[derive(Default)]
pub struct MemoryDialer {
    clients: RwLock<HashMap<String, Arc<dyn BrokerClient>>>,
}

impl MemoryDialer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: &str, client: Arc<dyn BrokerClient>) {
        self.clients
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.to_string(), client);
    }
}

#[async_trait]
impl BrokerDialer for MemoryDialer {
    async fn dial(&self, announcement: &Announcement) -> Result<Arc<dyn BrokerClient>, BrokerError> {
        self.clients
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&announcement.id)
            .cloned()
            .ok_or_else(|| BrokerError::Dial {
                address: announcement.net_address.clone(),
                reason: format!("no broker registered as {}", announcement.id),
            })
    }
}
