//! Lookups memoized for the duration of one message.

use fhirsync_protocol::{CacheNamespace, ExternalResource, ResourceEndpointKey};
use parking_lot::Mutex;
use std::collections::HashMap;

/// A cache private to one in-flight message.
///
/// Repeated lookups of the same key while processing one message hit this
/// cache before the shared one. It is never shared between messages and goes
/// away with its [`SyncContext`](crate::SyncContext).
#[derive(Debug, Default)]
pub struct RequestCache {
    entries: Mutex<HashMap<(CacheNamespace, String), ExternalResource>>,
}

impl RequestCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the entry for `key`.
    pub fn get(&self, key: &ResourceEndpointKey) -> Option<ExternalResource> {
        self.entries
            .lock()
            .get(&(key.namespace(), key.cache_key()))
            .cloned()
    }

    /// Stores `resource` under `key`.
    pub fn put(&self, key: &ResourceEndpointKey, resource: ExternalResource) {
        self.entries
            .lock()
            .insert((key.namespace(), key.cache_key()), resource);
    }

    /// Removes the entry for `key`.
    pub fn evict(&self, key: &ResourceEndpointKey) {
        self.entries.lock().remove(&(key.namespace(), key.cache_key()));
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every entry.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fhirsync_protocol::FhirVersion;
    use serde_json::json;
    use uuid::Uuid;

    #[test]
    fn refresh_flag_shares_the_entry() {
        let cache = RequestCache::new();
        let key = ResourceEndpointKey::by_id(Uuid::nil(), FhirVersion::R4, "Patient", "7", false);
        cache.put(&key, ExternalResource::new("Patient", json!({})).with_id("7"));

        assert!(cache.get(&key.clone().with_refresh(true)).is_some());
        cache.evict(&key);
        assert!(cache.is_empty());
    }
}
