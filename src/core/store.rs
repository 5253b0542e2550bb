//! Configuration store - Where user-adjusted service configuration lives

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::Result;

use super::service::{ServiceConfig, ServiceId};

/// Persistence for per-service configuration
pub trait ConfigStore: Send + Sync {
    /// `None` when the service was never configured
    fn load_config(&self, service_id: &ServiceId) -> Result<Option<ServiceConfig>>;

    fn save_config(&self, service_id: &ServiceId, config: &ServiceConfig) -> Result<()>;

    fn delete_config(&self, service_id: &ServiceId) -> Result<()>;
}

/// Process-local store, used by tests and dry runs
#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    configs: RwLock<HashMap<ServiceId, ServiceConfig>>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConfigStore for MemoryConfigStore {
    fn load_config(&self, service_id: &ServiceId) -> Result<Option<ServiceConfig>> {
        Ok(self
            .configs
            .read()
            .map_err(|e| anyhow::anyhow!("Config lock poisoned: {}", e))?
            .get(service_id)
            .cloned())
    }

    fn save_config(&self, service_id: &ServiceId, config: &ServiceConfig) -> Result<()> {
        self.configs
            .write()
            .map_err(|e| anyhow::anyhow!("Config lock poisoned: {}", e))?
            .insert(service_id.clone(), config.clone());
        Ok(())
    }

    fn delete_config(&self, service_id: &ServiceId) -> Result<()> {
        self.configs
            .write()
            .map_err(|e| anyhow::anyhow!("Config lock poisoned: {}", e))?
            .remove(service_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_roundtrip() {
        let store = MemoryConfigStore::new();
        let redis = ServiceId::from("redis");
        assert!(store.load_config(&redis).unwrap().is_none());

        let config = ServiceConfig::default().with_port(16379, 6379);
        store.save_config(&redis, &config).unwrap();
        assert_eq!(store.load_config(&redis).unwrap(), Some(config));

        store.delete_config(&redis).unwrap();
        assert!(store.load_config(&redis).unwrap().is_none());
    }
}
