//! The cache registry: one cache instance per UUID, shared by every
//! connection and both proxy directions.
//!
//! Local caches are created from configuration at listener startup; peer
//! caches are created on demand when a `HELLO` announces an identity we
//! have not seen. Caches survive reconfiguration — a reload never drops a
//! warmed dictionary.

use std::path::Path;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use uuid::Uuid;

use wanproxy_core::cache::{load_or_create_uuid, CacheResolver};
use wanproxy_core::config::{CacheKind, CodecStanza};
use wanproxy_core::coss::CossCache;
use wanproxy_core::{MemoryCache, SharedCache};

pub struct CacheRegistry {
    caches: DashMap<Uuid, SharedCache>,
}

impl CacheRegistry {
    pub fn new() -> Self {
        Self {
            caches: DashMap::new(),
        }
    }

    pub fn find_cache(&self, uuid: Uuid) -> Option<SharedCache> {
        self.caches.get(&uuid).map(|c| c.clone())
    }

    /// Create (or return) the memory cache for a peer announced in HELLO.
    pub fn add_cache(&self, uuid: Uuid, size_mb: u64) -> SharedCache {
        self.caches
            .entry(uuid)
            .or_insert_with(|| {
                tracing::info!(%uuid, size_mb, "creating cache for peer");
                Arc::new(Mutex::new(MemoryCache::new(uuid, size_mb))) as SharedCache
            })
            .clone()
    }

    /// Resolve the cache configured for one leg of a proxy, creating it on
    /// first use. COSS caches read their identity from the `UUID` file in
    /// the cache directory; memory caches get a fresh identity per run.
    pub fn open_configured(&self, stanza: &CodecStanza) -> anyhow::Result<SharedCache> {
        match stanza.cache {
            CacheKind::Memory => {
                let uuid = Uuid::new_v4();
                Ok(self.add_cache(uuid, stanza.size_mb))
            }
            CacheKind::Coss => {
                let uuid = load_or_create_uuid(&stanza.cache_path)?;
                if let Some(cache) = self.find_cache(uuid) {
                    return Ok(cache);
                }
                let cache = open_coss(uuid, &stanza.cache_path, stanza.size_mb)?;
                self.caches.insert(uuid, cache.clone());
                Ok(cache)
            }
        }
    }
}

impl Default for CacheRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn open_coss(uuid: Uuid, dir: &Path, size_mb: u64) -> anyhow::Result<SharedCache> {
    let cache = CossCache::open(uuid, dir, size_mb)?;
    Ok(Arc::new(Mutex::new(cache)) as SharedCache)
}

impl CacheResolver for CacheRegistry {
    fn find_or_add(&self, uuid: Uuid, size_mb: u64) -> Option<SharedCache> {
        Some(
            self.find_cache(uuid)
                .unwrap_or_else(|| self.add_cache(uuid, size_mb)),
        )
    }
}
