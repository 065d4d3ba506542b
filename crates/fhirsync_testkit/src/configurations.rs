//! Fixed configuration store.

use fhirsync_engine::{ConfigurationStore, SyncConfiguration, SyncResult};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Configurations held in a list. Counts lookups so tests can observe
/// caching in front of it.
#[derive(Default)]
pub struct StaticConfigurationStore {
    configurations: RwLock<Vec<Arc<SyncConfiguration>>>,
    lookups: AtomicU64,
}

impl StaticConfigurationStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `config` and returns it shared.
    pub fn add(&self, config: SyncConfiguration) -> Arc<SyncConfiguration> {
        let config = Arc::new(config);
        self.configurations.write().push(Arc::clone(&config));
        config
    }

    /// Removes the configuration with `id`. Returns true if it existed.
    pub fn remove(&self, id: Uuid) -> bool {
        let mut configurations = self.configurations.write();
        let before = configurations.len();
        configurations.retain(|c| c.id != id);
        configurations.len() != before
    }

    /// Number of lookups served.
    pub fn lookups(&self) -> u64 {
        self.lookups.load(Ordering::SeqCst)
    }
}

impl ConfigurationStore for StaticConfigurationStore {
    fn find_by_id(&self, id: Uuid) -> SyncResult<Option<Arc<SyncConfiguration>>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self.configurations.read().iter().find(|c| c.id == id).cloned())
    }

    fn find_by_resource_type(
        &self,
        client_id: Uuid,
        resource_type: &str,
    ) -> SyncResult<Option<Arc<SyncConfiguration>>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .configurations
            .read()
            .iter()
            .find(|c| c.client_id == client_id && c.resource_type == resource_type)
            .cloned())
    }
}
