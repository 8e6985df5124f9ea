//! In-memory discovery
//!
//! A fixed set of announcements, editable at runtime. Used by the CLI
//! simulator and the integration tests.

use super::{Announcement, Discovery, DiscoveryError};
use async_trait::async_trait;
use log::info;
use std::sync::RwLock;

#[derive(Debug, Default)]
pub struct StaticDiscovery {
    announcements: RwLock<Vec<Announcement>>,
}

impl StaticDiscovery {
    pub fn new(announcements: Vec<Announcement>) -> Self {
        Self {
            announcements: RwLock::new(announcements),
        }
    }

    /// Add or replace the announcement with the same service and id
    pub fn add(&self, announcement: Announcement) {
        let mut announcements = self.announcements.write().unwrap_or_else(|e| e.into_inner());
        announcements.retain(|a| !(a.service_name == announcement.service_name && a.id == announcement.id));
        announcements.push(announcement);
    }

    pub fn remove(&self, service_name: &str, id: &str) -> bool {
        let mut announcements = self.announcements.write().unwrap_or_else(|e| e.into_inner());
        let before = announcements.len();
        announcements.retain(|a| !(a.service_name == service_name && a.id == id));
        announcements.len() != before
    }
}

#[async_trait]
impl Discovery for StaticDiscovery {
    async fn get(&self, service_name: &str, id: &str) -> Result<Announcement, DiscoveryError> {
        self.announcements
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|a| a.service_name == service_name && a.id == id)
            .cloned()
            .ok_or_else(|| DiscoveryError::NotFound {
                service_name: service_name.to_string(),
                id: id.to_string(),
            })
    }

    async fn get_all(&self, service_name: &str) -> Result<Vec<Announcement>, DiscoveryError> {
        Ok(self
            .announcements
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|a| a.service_name == service_name)
            .cloned()
            .collect())
    }

    async fn announce(&self, token: &str) -> Result<(), DiscoveryError> {
        if token.is_empty() {
            return Err(DiscoveryError::Unauthorized("empty token".to_string()));
        }
        info!("Announced to static discovery");
        Ok(())
    }
}
