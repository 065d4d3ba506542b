//! Shared resource cache.
//!
//! Entries are partitioned by [`CacheNamespace`] and addressed within a
//! namespace by [`ResourceEndpointKey::cache_key`]. Two stores are provided:
//! an in-process map, and a codec store that keeps encoded payloads in any
//! [`ByteStore`], which is the shape of an out-of-process cache.

use crate::error::SyncResult;
use fhirsync_protocol::{
    decode_payload, encode_payload, CacheNamespace, ExternalResource, ResourceEndpointKey,
};
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// A cache of transformed resources.
pub trait CacheStore: Send + Sync {
    /// Returns the entry for `key`.
    fn get(&self, key: &ResourceEndpointKey) -> SyncResult<Option<ExternalResource>>;

    /// Stores `resource` under `key`, replacing any entry.
    fn put(&self, key: &ResourceEndpointKey, resource: &ExternalResource) -> SyncResult<()>;

    /// Removes the entry for `key`. Returns true if there was one.
    fn evict(&self, key: &ResourceEndpointKey) -> SyncResult<bool>;

    /// Removes every entry of `namespace`.
    fn clear(&self, namespace: &CacheNamespace) -> SyncResult<()>;

    /// Returns counters.
    fn stats(&self) -> CacheStats;
}

/// Cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups answered from the cache.
    pub hits: u64,
    /// Lookups not answered from the cache.
    pub misses: u64,
    /// Entries written.
    pub puts: u64,
    /// Entries removed by eviction or capacity.
    pub evictions: u64,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    puts: AtomicU64,
    evictions: AtomicU64,
}

impl Counters {
    fn hit(&self, hit: bool) {
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            puts: self.puts.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Default)]
struct Partition {
    entries: HashMap<String, ExternalResource>,
    order: VecDeque<String>,
}

/// Bounded in-process cache.
///
/// Each namespace holds at most `capacity` entries; the oldest insertion is
/// dropped first.
#[derive(Debug)]
pub struct MemoryCacheStore {
    capacity: usize,
    partitions: RwLock<HashMap<CacheNamespace, Partition>>,
    counters: Counters,
}

impl MemoryCacheStore {
    /// Creates a cache holding up to `capacity` entries per namespace.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            partitions: RwLock::new(HashMap::new()),
            counters: Counters::default(),
        }
    }

    /// Number of entries in `namespace`.
    pub fn len(&self, namespace: &CacheNamespace) -> usize {
        self.partitions
            .read()
            .get(namespace)
            .map_or(0, |p| p.entries.len())
    }
}

impl Default for MemoryCacheStore {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl CacheStore for MemoryCacheStore {
    fn get(&self, key: &ResourceEndpointKey) -> SyncResult<Option<ExternalResource>> {
        let found = self
            .partitions
            .read()
            .get(&key.namespace())
            .and_then(|p| p.entries.get(&key.cache_key()).cloned());
        self.counters.hit(found.is_some());
        Ok(found)
    }

    fn put(&self, key: &ResourceEndpointKey, resource: &ExternalResource) -> SyncResult<()> {
        let cache_key = key.cache_key();
        let mut partitions = self.partitions.write();
        let partition = partitions.entry(key.namespace()).or_default();
        if partition
            .entries
            .insert(cache_key.clone(), resource.clone())
            .is_none()
        {
            partition.order.push_back(cache_key);
        }
        while partition.entries.len() > self.capacity {
            let Some(oldest) = partition.order.pop_front() else {
                break;
            };
            if partition.entries.remove(&oldest).is_some() {
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.counters.puts.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn evict(&self, key: &ResourceEndpointKey) -> SyncResult<bool> {
        let cache_key = key.cache_key();
        let mut partitions = self.partitions.write();
        let Some(partition) = partitions.get_mut(&key.namespace()) else {
            return Ok(false);
        };
        let removed = partition.entries.remove(&cache_key).is_some();
        if removed {
            partition.order.retain(|k| k != &cache_key);
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
        }
        Ok(removed)
    }

    fn clear(&self, namespace: &CacheNamespace) -> SyncResult<()> {
        if let Some(partition) = self.partitions.write().remove(namespace) {
            self.counters
                .evictions
                .fetch_add(partition.entries.len() as u64, Ordering::Relaxed);
        }
        Ok(())
    }

    fn stats(&self) -> CacheStats {
        self.counters.snapshot()
    }
}

/// Byte-oriented key/value store, such as a remote cache server.
pub trait ByteStore: Send + Sync {
    /// Returns the bytes stored under `key`.
    fn get(&self, key: &str) -> SyncResult<Option<Vec<u8>>>;
    /// Stores `value` under `key`.
    fn set(&self, key: &str, value: Vec<u8>) -> SyncResult<()>;
    /// Removes `key`. Returns true if it existed.
    fn remove(&self, key: &str) -> SyncResult<bool>;
    /// Removes every key starting with `prefix`.
    fn remove_prefix(&self, prefix: &str) -> SyncResult<usize>;
}

/// In-memory [`ByteStore`].
#[derive(Debug, Default)]
pub struct MemoryByteStore {
    data: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryByteStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every key, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.data.read().keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl ByteStore for MemoryByteStore {
    fn get(&self, key: &str) -> SyncResult<Option<Vec<u8>>> {
        Ok(self.data.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: Vec<u8>) -> SyncResult<()> {
        self.data.write().insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> SyncResult<bool> {
        Ok(self.data.write().remove(key).is_some())
    }

    fn remove_prefix(&self, prefix: &str) -> SyncResult<usize> {
        let mut data = self.data.write();
        let before = data.len();
        data.retain(|k, _| !k.starts_with(prefix));
        Ok(before - data.len())
    }
}

/// Cache that stores codec-encoded payloads in a [`ByteStore`].
///
/// A payload that fails to decode, or was written for another FHIR version,
/// is treated as a miss and removed.
pub struct CodecCacheStore<B: ByteStore> {
    bytes: B,
    counters: Counters,
}

impl<B: ByteStore> CodecCacheStore<B> {
    /// Wraps `bytes`.
    pub fn new(bytes: B) -> Self {
        Self {
            bytes,
            counters: Counters::default(),
        }
    }

    /// Returns the byte store.
    pub fn bytes(&self) -> &B {
        &self.bytes
    }

    /// Key under which `key` is stored.
    pub fn storage_key(key: &ResourceEndpointKey) -> String {
        format!("{}::{}", key.namespace(), key.cache_key())
    }
}

impl<B: ByteStore> CacheStore for CodecCacheStore<B> {
    fn get(&self, key: &ResourceEndpointKey) -> SyncResult<Option<ExternalResource>> {
        let storage_key = Self::storage_key(key);
        let Some(raw) = self.bytes.get(&storage_key)? else {
            self.counters.hit(false);
            return Ok(None);
        };

        let found = match decode_payload(&raw) {
            Ok(Some((version, resource))) if version == key.version() => Some(resource),
            Ok(Some((version, _))) => {
                debug!(key = %storage_key, %version, "cached payload has another version");
                None
            }
            Ok(None) => None,
            Err(e) => {
                warn!(key = %storage_key, error = %e, "dropping undecodable cache payload");
                self.bytes.remove(&storage_key)?;
                None
            }
        };
        self.counters.hit(found.is_some());
        Ok(found)
    }

    fn put(&self, key: &ResourceEndpointKey, resource: &ExternalResource) -> SyncResult<()> {
        let payload = encode_payload(key.version(), resource)?;
        self.bytes.set(&Self::storage_key(key), payload)?;
        self.counters.puts.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn evict(&self, key: &ResourceEndpointKey) -> SyncResult<bool> {
        let removed = self.bytes.remove(&Self::storage_key(key))?;
        if removed {
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
        }
        Ok(removed)
    }

    fn clear(&self, namespace: &CacheNamespace) -> SyncResult<()> {
        let removed = self.bytes.remove_prefix(&format!("{namespace}::"))?;
        self.counters
            .evictions
            .fetch_add(removed as u64, Ordering::Relaxed);
        Ok(())
    }

    fn stats(&self) -> CacheStats {
        self.counters.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fhirsync_protocol::{FhirVersion, ResourceLookup, SystemCodeValue};
    use serde_json::json;
    use uuid::Uuid;

    fn key(id: &str) -> ResourceEndpointKey {
        ResourceEndpointKey::by_id(Uuid::nil(), FhirVersion::R4, "Patient", id, false)
    }

    fn patient(id: &str) -> ExternalResource {
        ExternalResource::new("Patient", json!({"active": true})).with_id(id)
    }

    fn exercise(store: &dyn CacheStore) {
        assert!(store.get(&key("7")).unwrap().is_none());
        store.put(&key("7"), &patient("7")).unwrap();
        assert_eq!(store.get(&key("7")).unwrap(), Some(patient("7")));
        // Refresh flag is not part of the identity.
        assert!(store.get(&key("7").with_refresh(true)).unwrap().is_some());

        let by_identifier = ResourceEndpointKey::new(
            Uuid::nil(),
            FhirVersion::R4,
            "Patient",
            ResourceLookup::Identifier(SystemCodeValue::new(None, "7")),
            false,
        );
        store.put(&by_identifier, &patient("7")).unwrap();
        store.clear(&CacheNamespace::Identifier).unwrap();
        assert!(store.get(&by_identifier).unwrap().is_none());
        assert!(store.get(&key("7")).unwrap().is_some());

        assert!(store.evict(&key("7")).unwrap());
        assert!(!store.evict(&key("7")).unwrap());
        assert!(store.get(&key("7")).unwrap().is_none());

        let stats = store.stats();
        assert_eq!(stats.hits, 3);
        assert_eq!(stats.puts, 2);
    }

    #[test]
    fn memory_store_contract() {
        exercise(&MemoryCacheStore::default());
    }

    #[test]
    fn codec_store_contract() {
        exercise(&CodecCacheStore::new(MemoryByteStore::new()));
    }

    #[test]
    fn memory_store_drops_oldest_over_capacity() {
        let store = MemoryCacheStore::new(2);
        for id in ["1", "2", "3"] {
            store.put(&key(id), &patient(id)).unwrap();
        }
        assert_eq!(store.len(&CacheNamespace::Resource), 2);
        assert!(store.get(&key("1")).unwrap().is_none());
        assert!(store.get(&key("3")).unwrap().is_some());
        assert_eq!(store.stats().evictions, 1);
    }

    #[test]
    fn codec_store_treats_garbage_as_miss() {
        let store = CodecCacheStore::new(MemoryByteStore::new());
        let storage_key = CodecCacheStore::<MemoryByteStore>::storage_key(&key("7"));
        store.bytes().set(&storage_key, vec![0, 9, b'x']).unwrap();

        assert!(store.get(&key("7")).unwrap().is_none());
        assert!(store.bytes().keys().is_empty());
    }

    #[test]
    fn codec_store_ignores_other_versions() {
        let store = CodecCacheStore::new(MemoryByteStore::new());
        let r4 = key("7");
        let storage_key = CodecCacheStore::<MemoryByteStore>::storage_key(&r4);
        store
            .bytes()
            .set(&storage_key, encode_payload(FhirVersion::Dstu3, &patient("7")).unwrap())
            .unwrap();
        assert!(store.get(&r4).unwrap().is_none());
    }
}
