//! # Service Discovery
//!
//! The router finds brokers through a [`Discovery`] implementation.
//! Announcements carry the service's network address, an optional TLS
//! certificate, and the routing metadata (DevAddr prefixes, AppIDs) brokers
//! and handlers claim.
//!
//! [`CachedDiscovery`] puts TTL caches in front of any implementation;
//! [`StaticDiscovery`] is an in-memory registry.

pub mod cache;
pub mod static_discovery;

pub use cache::{CacheStats, TtlCache};
pub use static_discovery::StaticDiscovery;

use crate::config::DiscoveryCacheConfig;
use crate::message::DevAddr;
use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const ROUTER_SERVICE: &str = "router";
pub const BROKER_SERVICE: &str = "broker";
pub const HANDLER_SERVICE: &str = "handler";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DiscoveryError {
    #[error("Service {service_name}/{id} not found")]
    NotFound { service_name: String, id: String },

    #[error("Discovery unavailable: {0}")]
    Unavailable(String),

    #[error("Announcement rejected: {0}")]
    Unauthorized(String),
}

/// Routing metadata claimed by an announced service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metadata {
    DevAddrPrefix { addr: DevAddr, length: u8 },
    AppId(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Announcement {
    pub service_name: String,
    pub id: String,
    pub net_address: String,
    #[serde(default)]
    pub certificate: Option<String>,
    #[serde(default)]
    pub metadata: Vec<Metadata>,
}

impl Announcement {
    pub fn new(service_name: &str, id: &str, net_address: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
            id: id.to_string(),
            net_address: net_address.to_string(),
            certificate: None,
            metadata: Vec::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata.push(metadata);
        self
    }

    pub fn handles_dev_addr(&self, addr: DevAddr) -> bool {
        self.metadata.iter().any(|md| match md {
            Metadata::DevAddrPrefix { addr: prefix, length } => addr.has_prefix(*prefix, *length),
            Metadata::AppId(_) => false,
        })
    }

    pub fn handles_app_id(&self, app_id: &str) -> bool {
        self.metadata
            .iter()
            .any(|md| matches!(md, Metadata::AppId(id) if id == app_id))
    }
}

#[async_trait]
pub trait Discovery: Send + Sync {
    async fn get(&self, service_name: &str, id: &str) -> Result<Announcement, DiscoveryError>;

    async fn get_all(&self, service_name: &str) -> Result<Vec<Announcement>, DiscoveryError>;

    async fn get_all_brokers_for_dev_addr(&self, addr: DevAddr) -> Result<Vec<Announcement>, DiscoveryError> {
        let brokers = self.get_all(BROKER_SERVICE).await?;
        Ok(brokers.into_iter().filter(|a| a.handles_dev_addr(addr)).collect())
    }

    async fn get_all_handlers_for_app_id(&self, app_id: &str) -> Result<Vec<Announcement>, DiscoveryError> {
        let handlers = self.get_all(HANDLER_SERVICE).await?;
        Ok(handlers.into_iter().filter(|a| a.handles_app_id(app_id)).collect())
    }

    /// Announce this component, authorized by `token`
    async fn announce(&self, token: &str) -> Result<(), DiscoveryError>;
}

/// [`Discovery`] with TTL caches in front of the lookups
pub struct CachedDiscovery<D> {
    inner: D,
    announcements: TtlCache<(String, String), Announcement>,
    services: TtlCache<String, Vec<Announcement>>,
}

impl<D: Discovery> CachedDiscovery<D> {
    pub fn new(inner: D, config: &DiscoveryCacheConfig) -> Self {
        Self::with_caches(
            inner,
            TtlCache::new(config.capacity, config.ttl()),
            TtlCache::new(config.capacity, config.ttl()),
        )
    }

    pub fn with_caches(
        inner: D,
        announcements: TtlCache<(String, String), Announcement>,
        services: TtlCache<String, Vec<Announcement>>,
    ) -> Self {
        Self {
            inner,
            announcements,
            services,
        }
    }

    /// Forget everything cached for `service_name`
    pub fn invalidate(&self, service_name: &str) {
        self.services.invalidate(&service_name.to_string());
        self.announcements.retain(|(service, _), _| service != service_name);
    }

    pub fn stats(&self) -> (CacheStats, CacheStats) {
        (self.announcements.stats(), self.services.stats())
    }

    pub fn inner(&self) -> &D {
        &self.inner
    }
}

#[async_trait]
impl<D: Discovery> Discovery for CachedDiscovery<D> {
    async fn get(&self, service_name: &str, id: &str) -> Result<Announcement, DiscoveryError> {
        let key = (service_name.to_string(), id.to_string());
        if let Some(announcement) = self.announcements.get(&key) {
            return Ok(announcement);
        }
        let announcement = self.inner.get(service_name, id).await?;
        self.announcements.insert(key, announcement.clone());
        Ok(announcement)
    }

    async fn get_all(&self, service_name: &str) -> Result<Vec<Announcement>, DiscoveryError> {
        let key = service_name.to_string();
        if let Some(announcements) = self.services.get(&key) {
            return Ok(announcements);
        }
        let announcements = self.inner.get_all(service_name).await?;
        debug!("Cached {} {service_name} announcements", announcements.len());
        self.services.insert(key, announcements.clone());
        Ok(announcements)
    }

    async fn announce(&self, token: &str) -> Result<(), DiscoveryError> {
        self.inner.announce(token).await
    }
}
