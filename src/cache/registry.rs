//! Layer Registry and Tenant Keyspace
//!
//! Owns every layer for the lifetime of the engine plus the per-tenant
//! index of resident physical keys. All entry writes and removals go
//! through the registry so the index never drifts from layer contents.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use dashmap::DashMap;

use super::entry::CacheEntry;
use super::layer::{CacheLayer, WriteGuard};
use crate::error::{Error, Result};

/// Physical keys held per tenant, with the layers holding each key
#[derive(Debug, Default)]
pub struct TenantKeyspace {
    tenants: DashMap<String, BTreeMap<String, BTreeSet<String>>>,
}

impl TenantKeyspace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `layer` holds `key`
    pub fn add(&self, tenant: &str, key: &str, layer: &str) {
        self.tenants
            .entry(tenant.to_string())
            .or_default()
            .entry(key.to_string())
            .or_default()
            .insert(layer.to_string());
    }

    /// Record that `layer` no longer holds `key`
    pub fn remove(&self, tenant: &str, key: &str, layer: &str) {
        let mut drop_tenant = false;
        if let Some(mut keys) = self.tenants.get_mut(tenant) {
            if let Some(layers) = keys.get_mut(key) {
                layers.remove(layer);
                if layers.is_empty() {
                    keys.remove(key);
                }
            }
            drop_tenant = keys.is_empty();
        }
        if drop_tenant {
            self.tenants.remove_if(tenant, |_, keys| keys.is_empty());
        }
    }

    /// Physical keys of a tenant resident in `layer`
    pub fn keys_in_layer(&self, tenant: &str, layer: &str) -> Vec<String> {
        self.tenants
            .get(tenant)
            .map(|keys| {
                keys.iter()
                    .filter(|(_, layers)| layers.contains(layer))
                    .map(|(key, _)| key.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Distinct physical keys of a tenant across all layers
    pub fn key_count(&self, tenant: &str) -> usize {
        self.tenants.get(tenant).map(|k| k.len()).unwrap_or(0)
    }

    /// Key counts for every tenant with resident keys
    pub fn key_counts(&self) -> HashMap<String, usize> {
        self.tenants
            .iter()
            .map(|e| (e.key().clone(), e.value().len()))
            .collect()
    }

    /// Forget everything
    pub fn clear(&self) {
        self.tenants.clear();
    }
}

/// Holds the layers, in configuration order
#[derive(Debug)]
pub struct CacheLayerRegistry {
    layers: Vec<Arc<CacheLayer>>,
    index: HashMap<String, usize>,
    keyspace: TenantKeyspace,
}

impl CacheLayerRegistry {
    /// Create a registry; layer ids must be unique
    pub fn new(layers: Vec<CacheLayer>) -> Result<Self> {
        let mut index = HashMap::with_capacity(layers.len());
        for (i, layer) in layers.iter().enumerate() {
            if index.insert(layer.id().to_string(), i).is_some() {
                return Err(Error::Config(format!("duplicate layer id: {}", layer.id())));
            }
        }

        Ok(Self {
            layers: layers.into_iter().map(Arc::new).collect(),
            index,
            keyspace: TenantKeyspace::new(),
        })
    }

    /// Look up a layer
    pub fn get(&self, id: &str) -> Option<&Arc<CacheLayer>> {
        self.index.get(id).map(|&i| &self.layers[i])
    }

    /// Look up a layer, failing on unknown ids
    pub fn require(&self, id: &str) -> Result<&Arc<CacheLayer>> {
        self.get(id).ok_or_else(|| Error::LayerNotFound(id.to_string()))
    }

    /// All layers
    pub fn layers(&self) -> &[Arc<CacheLayer>] {
        &self.layers
    }

    /// Tenant keyspace index
    pub fn keyspace(&self) -> &TenantKeyspace {
        &self.keyspace
    }

    /// Store an entry in a layer and index it under its tenant
    pub async fn write_entry(
        &self,
        layer: &CacheLayer,
        guard: &WriteGuard<'_>,
        entry: Arc<CacheEntry>,
    ) -> Result<()> {
        let physical = entry.physical_key();
        let tenant = entry.tenant_id().to_string();
        layer.store_locked(guard, &physical, entry).await?;
        self.keyspace.add(&tenant, &physical, layer.id());
        Ok(())
    }

    /// Remove an entry from a layer and drop it from the tenant index
    pub async fn remove_entry(
        &self,
        layer: &CacheLayer,
        guard: &WriteGuard<'_>,
        physical: &str,
    ) -> Result<Option<Arc<CacheEntry>>> {
        let removed = layer.remove_locked(guard, physical).await?;
        if let Some(entry) = &removed {
            self.keyspace.remove(entry.tenant_id(), physical, layer.id());
        }
        Ok(removed)
    }
}

// =============================================================================
// Tests
// =============================================================================
