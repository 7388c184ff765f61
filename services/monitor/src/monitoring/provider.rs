//! Cloud provider registry
//!
//! Providers are implemented per vendor outside this crate; the monitor only
//! needs their current resource listing.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

use super::types::Resource;

/// Trait for cloud-specific resource discovery
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Return the provider's full current resource listing
    async fn discover_resources(&self) -> Result<Vec<Resource>>;
}

/// Named providers polled by the monitor.
///
/// Read on every poll cycle, written only on registration.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: RwLock<BTreeMap<String, Arc<dyn CloudProvider>>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a provider under `name`
    pub async fn register(&self, name: impl Into<String>, provider: Arc<dyn CloudProvider>) {
        let name = name.into();
        let replaced = self
            .providers
            .write()
            .await
            .insert(name.clone(), provider)
            .is_some();

        info!(provider = %name, replaced, "Registered cloud provider");
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn CloudProvider>> {
        self.providers.read().await.get(name).cloned()
    }

    /// Copy of the current registrations, ordered by name.
    ///
    /// The lock is released before any provider is called.
    pub async fn snapshot(&self) -> Vec<(String, Arc<dyn CloudProvider>)> {
        self.providers
            .read()
            .await
            .iter()
            .map(|(name, provider)| (name.clone(), Arc::clone(provider)))
            .collect()
    }

    pub async fn names(&self) -> Vec<String> {
        self.providers.read().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.providers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.providers.read().await.is_empty()
    }
}
