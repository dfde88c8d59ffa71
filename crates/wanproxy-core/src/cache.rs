//! Dictionary caches: the `SegmentCache` trait, the in-memory backend and
//! the recency window every backend keeps in front of its main index.
//!
//! A cache maps 64-bit rolling-hash values to fixed-size segments. The
//! memory backend grows without bound; the file-backed COSS backend (see
//! [`crate::coss`]) is bounded and evicting. One cache instance is shared
//! by every connection using the same cache UUID, serialised by a mutex —
//! critical sections are short and never touch the network.

use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::wire::{Segment, SEGMENT_LENGTH, UUID_STRING_SIZE};

/// Identity a cache announces in its `HELLO`: its UUID and the nominal
/// size in megabytes it was configured with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheIdentity {
    pub uuid: Uuid,
    pub size_mb: u64,
}

/// A dictionary of segments keyed by rolling hash.
///
/// `lookup` takes `&mut self` because every backend updates recency state
/// on a hit. Implementations must never block on I/O for data that is
/// already resident.
pub trait SegmentCache: Send {
    fn identity(&self) -> &CacheIdentity;

    /// Insert a segment. The caller has already established the hash is
    /// absent (encoders and decoders only insert after a missed lookup).
    fn insert(&mut self, hash: u64, segment: &Segment);

    /// Look a hash up, returning a copy of the stored segment.
    fn lookup(&mut self, hash: u64) -> Option<Segment>;
}

/// A cache shared across connections. Filters lock it per operation.
pub type SharedCache = Arc<Mutex<dyn SegmentCache>>;

/// Resolves peer cache identities announced in `HELLO` to cache instances,
/// creating them on first contact. Implemented by the daemon's registry.
pub trait CacheResolver: Send + Sync {
    fn find_or_add(&self, uuid: Uuid, size_mb: u64) -> Option<SharedCache>;
}

// ── Recency window ───────────────────────────────────────────────────────────

/// Number of entries in the recency window. Must be a power of two.
pub const RECENT_WINDOW_COUNT: usize = 64;

/// Fixed ring of recently touched `(hash, segment)` pairs, consulted
/// before the main index to short-circuit repeated lookups. Entries are
/// invalidated when the backing segment is evicted.
pub struct RecentWindow {
    slots: Box<[(u64, Segment)]>,
    cursor: usize,
}

impl RecentWindow {
    pub fn new() -> Self {
        Self {
            slots: vec![(0u64, [0u8; SEGMENT_LENGTH]); RECENT_WINDOW_COUNT].into_boxed_slice(),
            cursor: 0,
        }
    }

    pub fn remember(&mut self, hash: u64, segment: &Segment) {
        self.slots[self.cursor] = (hash, *segment);
        self.cursor = (self.cursor + 1) & (RECENT_WINDOW_COUNT - 1);
    }

    pub fn find(&self, hash: u64) -> Option<Segment> {
        if hash == 0 {
            return None;
        }
        self.slots
            .iter()
            .find(|(h, _)| *h == hash)
            .map(|(_, seg)| *seg)
    }

    /// Drop any entry for `hash`. Called when the backing slot is evicted.
    pub fn forget(&mut self, hash: u64) {
        for slot in self.slots.iter_mut() {
            if slot.0 == hash {
                slot.0 = 0;
            }
        }
    }
}

impl Default for RecentWindow {
    fn default() -> Self {
        Self::new()
    }
}

// ── Memory cache ─────────────────────────────────────────────────────────────

/// Unbounded in-memory dictionary. Insertion is monotonic: nothing is ever
/// evicted, so a hash once entered stays resolvable for the process
/// lifetime. The rolling hash is already high quality, so it keys the map
/// directly.
pub struct MemoryCache {
    identity: CacheIdentity,
    recent: RecentWindow,
    segments: HashMap<u64, Box<Segment>>,
}

impl MemoryCache {
    pub fn new(uuid: Uuid, size_mb: u64) -> Self {
        Self {
            identity: CacheIdentity { uuid, size_mb },
            recent: RecentWindow::new(),
            segments: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

impl SegmentCache for MemoryCache {
    fn identity(&self) -> &CacheIdentity {
        &self.identity
    }

    fn insert(&mut self, hash: u64, segment: &Segment) {
        // Two connections can race to declare the same segment; first
        // writer wins and the bytes are identical either way.
        self.segments.entry(hash).or_insert_with(|| Box::new(*segment));
    }

    fn lookup(&mut self, hash: u64) -> Option<Segment> {
        if let Some(seg) = self.recent.find(hash) {
            return Some(seg);
        }
        let seg = self.segments.get(&hash).map(|s| **s)?;
        self.recent.remember(hash, &seg);
        Some(seg)
    }
}

// ── Cache directory identity ─────────────────────────────────────────────────

/// Read the `UUID` file in a cache directory, generating one on first run.
///
/// The file holds the canonical 36-byte string; it names the `.wpc` file
/// next to it and is what the instance announces in `HELLO`.
pub fn load_or_create_uuid(dir: &Path) -> std::io::Result<Uuid> {
    let path = dir.join("UUID");
    if path.exists() {
        let text = std::fs::read_to_string(&path)?;
        let trimmed = text.trim();
        if trimmed.len() == UUID_STRING_SIZE {
            if let Ok(uuid) = trimmed.parse::<Uuid>() {
                return Ok(uuid);
            }
        }
        tracing::warn!(path = %path.display(), "invalid UUID file, regenerating");
    }
    std::fs::create_dir_all(dir)?;
    let uuid = Uuid::new_v4();
    let mut file = std::fs::File::create(&path)?;
    writeln!(file, "{uuid}")?;
    Ok(uuid)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(fill: u8) -> Segment {
        [fill; SEGMENT_LENGTH]
    }

    #[test]
    fn memory_cache_round_trip() {
        let mut cache = MemoryCache::new(Uuid::new_v4(), 0);
        let seg = segment(0xab);
        cache.insert(42, &seg);
        assert_eq!(cache.lookup(42), Some(seg));
        assert_eq!(cache.lookup(43), None);
    }

    #[test]
    fn recent_window_hits_before_map() {
        let mut window = RecentWindow::new();
        let seg = segment(0x11);
        window.remember(7, &seg);
        assert_eq!(window.find(7), Some(seg));
        window.forget(7);
        assert_eq!(window.find(7), None);
    }

    #[test]
    fn recent_window_wraps() {
        let mut window = RecentWindow::new();
        for i in 0..RECENT_WINDOW_COUNT as u64 + 8 {
            window.remember(i + 1, &segment(i as u8));
        }
        // The first entries have been overwritten by the wrap.
        assert_eq!(window.find(1), None);
        assert!(window.find(RECENT_WINDOW_COUNT as u64 + 8).is_some());
    }

    #[test]
    fn uuid_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let first = load_or_create_uuid(dir.path()).unwrap();
        let second = load_or_create_uuid(dir.path()).unwrap();
        assert_eq!(first, second, "UUID must survive reopen");
        let text = std::fs::read_to_string(dir.path().join("UUID")).unwrap();
        assert_eq!(text.trim().len(), UUID_STRING_SIZE);
    }
}
