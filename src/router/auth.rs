//! Gateway authentication
//!
//! Gateways present their id and an access token when opening a stream.
//! Validation is pluggable; [`StaticTokens`] checks against a fixed table.

use crate::gateway::GatewayId;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;

/// Identity claimed by a connecting gateway
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayCredentials {
    pub id: GatewayId,
    pub token: Option<String>,
}

impl GatewayCredentials {
    pub fn new(id: impl Into<GatewayId>, token: Option<&str>) -> Self {
        Self {
            id: id.into(),
            token: token.map(str::to_string),
        }
    }
}

#[async_trait]
pub trait TokenValidator: Send + Sync {
    async fn validate(&self, id: &GatewayId, token: &str) -> bool;
}

/// Tokens registered per gateway
#[derive(Debug, Default)]
pub struct StaticTokens {
    tokens: RwLock<HashMap<GatewayId, String>>,
}

impl StaticTokens {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: impl Into<GatewayId>, token: &str) {
        self.tokens
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.into(), token.to_string());
    }

    pub fn revoke(&self, id: &GatewayId) -> bool {
        self.tokens
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)
            .is_some()
    }
}

#[async_trait]
impl TokenValidator for StaticTokens {
    async fn validate(&self, id: &GatewayId, token: &str) -> bool {
        self.tokens
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .is_some_and(|expected| expected == token)
    }
}
