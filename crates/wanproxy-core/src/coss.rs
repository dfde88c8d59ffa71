//! COSS: the cyclic, stripe-structured persistent cache.
//!
//! One file per cache UUID (`<UUID>.wpc`), laid out as an array of
//! equal-sized stripes. Each stripe is a page-aligned header (metadata,
//! per-slot flag bytes, per-slot hashes) followed by a fixed array of
//! segments. Exactly one resident stripe is *active* and receives new
//! insertions; up to [`LOADED_STRIPE_COUNT`] stripes are held in memory to
//! serve reads without disk I/O. When the active stripe fills, the least
//! recently useful on-disk stripe is recycled: slots untouched since the
//! previous cycle are purged and the stripe becomes the new active one.
//!
//! Every header field is serialised explicitly in little-endian order; the
//! padding to the 4096-byte alignment is computed, never implied by struct
//! layout. Any validation failure on read degrades to a cache miss — disk
//! corruption must never surface as a dictionary collision.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use static_assertions::const_assert;
use uuid::Uuid;

use crate::cache::{CacheIdentity, RecentWindow, SegmentCache};
use crate::wire::{Segment, SEGMENT_LENGTH};

pub const CACHE_SIGNATURE: u32 = 0xf150_e964;
pub const CACHE_VERSION: u32 = 2;

/// Segments per stripe. Must fit in 16 bits.
pub const STRIPE_SEGMENT_COUNT: usize = 512;

/// Stripes held in memory. Must be greater than 1: one active plus at
/// least one read slot.
pub const LOADED_STRIPE_COUNT: usize = 16;

/// Nominal size used when the configuration passes zero megabytes.
pub const CACHE_BASIC_SIZE_MB: u64 = 1024;

const CACHE_ALIGNMENT: usize = 4096;
const METADATA_SIZE: usize = 64;
const FLAGS_SIZE: usize = STRIPE_SEGMENT_COUNT;
const HASHES_SIZE: usize = STRIPE_SEGMENT_COUNT * 8;
const HEADER_CONTENT_SIZE: usize = METADATA_SIZE + FLAGS_SIZE + HASHES_SIZE;
const HEADER_SIZE: usize =
    (HEADER_CONTENT_SIZE + CACHE_ALIGNMENT - 1) / CACHE_ALIGNMENT * CACHE_ALIGNMENT;
const METADATA_PADDING: usize = HEADER_SIZE - HEADER_CONTENT_SIZE;
const SEGMENTS_SIZE: usize = STRIPE_SEGMENT_COUNT * SEGMENT_LENGTH;
pub const STRIPE_SIZE: usize = HEADER_SIZE + SEGMENTS_SIZE;

/// Slot flag bits: bit 0 = segment copy may sit in the recency window,
/// bit 1 = used since the last purge cycle.
const FLAG_RECENT: u8 = 1 << 0;
const FLAG_USED: u8 = 1 << 1;

const_assert!(STRIPE_SEGMENT_COUNT <= u16::MAX as usize);
const_assert!(LOADED_STRIPE_COUNT > 1);
const_assert!(HEADER_SIZE % CACHE_ALIGNMENT == 0);
const_assert!(METADATA_PADDING < CACHE_ALIGNMENT);

#[derive(Debug, thiserror::Error)]
pub enum CossError {
    #[error("cache i/o on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Stripe residency, kept both in the in-memory directory and in each
/// loaded stripe's metadata.
const STATE_ABSENT: u32 = 0;
const STATE_RESIDENT: u32 = 1;
const STATE_DETACHED: u32 = 2;

/// Fixed-width stripe metadata, serialised field by field.
#[derive(Debug, Clone, Copy, Default)]
struct Metadata {
    signature: u32,
    version: u32,
    /// Strictly increasing across stripe writes; recovery picks the stripe
    /// with the highest serial as active.
    serial: u64,
    /// Index of this stripe within the file.
    stripe: u64,
    /// Next free slot in the segment array.
    segment_index: u32,
    segment_count: u32,
    /// Strictly increasing counter shared by the whole cache; doubles as
    /// the LRU key for eviction.
    freshness: u64,
    uses: u64,
    credits: u64,
    load_uses: u32,
    state: u32,
}

impl Metadata {
    fn encode(&self, out: &mut [u8]) {
        debug_assert!(out.len() >= METADATA_SIZE);
        out[0..4].copy_from_slice(&self.signature.to_le_bytes());
        out[4..8].copy_from_slice(&self.version.to_le_bytes());
        out[8..16].copy_from_slice(&self.serial.to_le_bytes());
        out[16..24].copy_from_slice(&self.stripe.to_le_bytes());
        out[24..28].copy_from_slice(&self.segment_index.to_le_bytes());
        out[28..32].copy_from_slice(&self.segment_count.to_le_bytes());
        out[32..40].copy_from_slice(&self.freshness.to_le_bytes());
        out[40..48].copy_from_slice(&self.uses.to_le_bytes());
        out[48..56].copy_from_slice(&self.credits.to_le_bytes());
        out[56..60].copy_from_slice(&self.load_uses.to_le_bytes());
        out[60..64].copy_from_slice(&self.state.to_le_bytes());
    }

    fn decode(raw: &[u8]) -> Self {
        debug_assert!(raw.len() >= METADATA_SIZE);
        let u32_at = |o: usize| u32::from_le_bytes(raw[o..o + 4].try_into().expect("fixed offset"));
        let u64_at = |o: usize| u64::from_le_bytes(raw[o..o + 8].try_into().expect("fixed offset"));
        Self {
            signature: u32_at(0),
            version: u32_at(4),
            serial: u64_at(8),
            stripe: u64_at(16),
            segment_index: u32_at(24),
            segment_count: u32_at(28),
            freshness: u64_at(32),
            uses: u64_at(40),
            credits: u64_at(48),
            load_uses: u32_at(56),
            state: u32_at(60),
        }
    }

    /// A header is only trusted if its fixed fields make sense; anything
    /// else is treated as garbage from a torn write.
    fn valid(&self) -> bool {
        self.signature == CACHE_SIGNATURE
            && self.version == CACHE_VERSION
            && self.segment_count as usize <= STRIPE_SEGMENT_COUNT
            && self.segment_index as usize <= STRIPE_SEGMENT_COUNT
    }
}

/// A fully materialised stripe.
struct Stripe {
    meta: Metadata,
    flags: [u8; STRIPE_SEGMENT_COUNT],
    hashes: [u64; STRIPE_SEGMENT_COUNT],
    segments: Box<[u8]>,
}

impl Stripe {
    fn empty() -> Self {
        Self {
            meta: Metadata::default(),
            flags: [0; STRIPE_SEGMENT_COUNT],
            hashes: [0; STRIPE_SEGMENT_COUNT],
            segments: vec![0u8; SEGMENTS_SIZE].into_boxed_slice(),
        }
    }

    fn header_bytes(&self) -> Vec<u8> {
        let mut out = vec![0u8; HEADER_SIZE];
        self.meta.encode(&mut out[..METADATA_SIZE]);
        out[METADATA_SIZE..METADATA_SIZE + FLAGS_SIZE].copy_from_slice(&self.flags);
        let hashes_off = METADATA_SIZE + FLAGS_SIZE;
        for (i, h) in self.hashes.iter().enumerate() {
            out[hashes_off + i * 8..hashes_off + (i + 1) * 8].copy_from_slice(&h.to_le_bytes());
        }
        out
    }

    fn load_header(&mut self, raw: &[u8]) {
        debug_assert!(raw.len() >= HEADER_SIZE);
        self.meta = Metadata::decode(raw);
        self.flags
            .copy_from_slice(&raw[METADATA_SIZE..METADATA_SIZE + FLAGS_SIZE]);
        let hashes_off = METADATA_SIZE + FLAGS_SIZE;
        for i in 0..STRIPE_SEGMENT_COUNT {
            self.hashes[i] = u64::from_le_bytes(
                raw[hashes_off + i * 8..hashes_off + (i + 1) * 8]
                    .try_into()
                    .expect("fixed offset"),
            );
        }
    }

    fn segment(&self, slot: usize) -> &[u8] {
        &self.segments[slot * SEGMENT_LENGTH..(slot + 1) * SEGMENT_LENGTH]
    }

    fn segment_mut(&mut self, slot: usize) -> &mut [u8] {
        &mut self.segments[slot * SEGMENT_LENGTH..(slot + 1) * SEGMENT_LENGTH]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct IndexEntry {
    stripe: u64,
    slot: u16,
}

/// The persistent cache itself.
pub struct CossCache {
    identity: CacheIdentity,
    recent: RecentWindow,

    path: PathBuf,
    file: File,
    file_len: u64,

    serial: u64,
    stripe_limit: u64,
    freshness: u64,

    resident: Vec<Stripe>,
    active: usize,

    /// Metadata-only copy of every stripe's header.
    directory: Vec<Metadata>,
    /// hash -> (stripe, slot), rebuilt from the headers at open.
    index: HashMap<u64, IndexEntry>,
}

impl CossCache {
    /// Open (or create) the cache file for `uuid` inside `dir`.
    ///
    /// The configured size is rounded up to a stripe multiple. Recovery
    /// tolerates truncated files and trailing garbage: scanning stops at
    /// the first invalid header and whatever follows is overwritten as the
    /// cycle reaches it.
    pub fn open(uuid: Uuid, dir: &Path, size_mb: u64) -> Result<Self, CossError> {
        let size_mb = if size_mb == 0 { CACHE_BASIC_SIZE_MB } else { size_mb };
        let path = dir.join(format!("{uuid}.wpc"));

        std::fs::create_dir_all(dir).map_err(|source| CossError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .map_err(|source| CossError::Io {
                path: path.clone(),
                source,
            })?;
        let file_len = file
            .metadata()
            .map_err(|source| CossError::Io {
                path: path.clone(),
                source,
            })?
            .len();

        let bytes = size_mb * 1024 * 1024;
        let stripe_limit = (bytes + STRIPE_SIZE as u64 - 1) / STRIPE_SIZE as u64;

        // Never hold more slots than there are stripes: a tiny cache with
        // every stripe resident must still be able to detach one before
        // recycling it.
        let resident_count = LOADED_STRIPE_COUNT.min(stripe_limit as usize);

        let mut cache = Self {
            identity: CacheIdentity { uuid, size_mb },
            recent: RecentWindow::new(),
            path,
            file,
            file_len,
            serial: 0,
            stripe_limit,
            freshness: 0,
            resident: (0..resident_count).map(|_| Stripe::empty()).collect(),
            active: 0,
            directory: vec![Metadata::default(); stripe_limit as usize],
            index: HashMap::new(),
        };

        cache.read_file()?;

        tracing::debug!(
            path = %cache.path.display(),
            stripes = cache.stripe_limit,
            stripe_size = STRIPE_SIZE,
            serial = cache.serial,
            indexed = cache.index.len(),
            "opened cache file"
        );

        Ok(cache)
    }

    /// Scan every stripe header, rebuild directory and hash index, and
    /// pick the stripe with the highest valid serial as active.
    fn read_file(&mut self) -> Result<(), CossError> {
        let mut best_serial = 0u64;
        let mut best_stripe = 0u64;
        let mut top_freshness = 0u64;

        if self.file_len as usize >= HEADER_SIZE {
            let mmap = unsafe { Mmap::map(&self.file) }.map_err(|source| CossError::Io {
                path: self.path.clone(),
                source,
            })?;

            let full_stripes = (self.file_len / STRIPE_SIZE as u64).min(self.stripe_limit);
            let mut scratch = Stripe::empty();
            for n in 0..full_stripes {
                let off = (n as usize) * STRIPE_SIZE;
                scratch.load_header(&mmap[off..off + HEADER_SIZE]);
                if !scratch.meta.valid() {
                    // Torn write or trailing garbage: ignore this stripe
                    // and everything after it. The cycle will overwrite it.
                    tracing::warn!(stripe = n, "invalid stripe header, ignoring tail");
                    break;
                }

                if scratch.meta.serial > best_serial {
                    best_serial = scratch.meta.serial;
                    best_stripe = n;
                }
                if scratch.meta.freshness > top_freshness {
                    top_freshness = scratch.meta.freshness;
                }

                self.directory[n as usize] = scratch.meta;
                self.directory[n as usize].stripe = n;
                self.directory[n as usize].state = STATE_ABSENT;

                for (slot, &hash) in scratch.hashes.iter().enumerate() {
                    if hash != 0 {
                        self.index.insert(
                            hash,
                            IndexEntry {
                                stripe: n,
                                slot: slot as u16,
                            },
                        );
                    }
                }
            }
        }

        if best_serial > 0 {
            self.serial = best_serial;
            self.freshness = top_freshness;
            self.active = 0;
            if !self.load_stripe(best_stripe, 0) {
                self.initialize_stripe(best_stripe, 0);
            }
        } else {
            self.initialize_stripe(0, 0);
        }

        Ok(())
    }

    fn initialize_stripe(&mut self, stripe: u64, slot: usize) {
        let s = &mut self.resident[slot];
        s.meta = Metadata {
            signature: CACHE_SIGNATURE,
            version: CACHE_VERSION,
            serial: {
                self.serial += 1;
                self.serial
            },
            stripe,
            state: STATE_RESIDENT,
            ..Metadata::default()
        };
        s.flags = [0; STRIPE_SEGMENT_COUNT];
        s.hashes = [0; STRIPE_SEGMENT_COUNT];
        self.directory[stripe as usize] = s.meta;
    }

    /// Load a whole stripe from disk into the given resident slot.
    fn load_stripe(&mut self, stripe: u64, slot: usize) -> bool {
        let pos = stripe * STRIPE_SIZE as u64;
        if pos + STRIPE_SIZE as u64 > self.file_len {
            return false;
        }

        let mut raw = vec![0u8; STRIPE_SIZE];
        let ok = self
            .file
            .seek(SeekFrom::Start(pos))
            .and_then(|_| self.file.read_exact(&mut raw))
            .is_ok();
        if !ok {
            tracing::warn!(stripe, "stripe read failed, treating as empty");
            return false;
        }

        let s = &mut self.resident[slot];
        s.load_header(&raw[..HEADER_SIZE]);
        if !s.meta.valid() {
            return false;
        }
        s.segments.copy_from_slice(&raw[HEADER_SIZE..]);
        // The on-disk position is authoritative over whatever was stored.
        s.meta.stripe = stripe;
        s.meta.load_uses = 0;
        s.meta.state = STATE_RESIDENT;
        self.directory[stripe as usize].state = STATE_RESIDENT;
        true
    }

    /// Write a resident stripe back to its file offset; `header_only`
    /// skips the segment array (used when detaching a read slot whose
    /// segments are unchanged).
    fn store_stripe(&mut self, slot: usize, header_only: bool) {
        let s = &self.resident[slot];
        let pos = s.meta.stripe * STRIPE_SIZE as u64;

        let mut image = s.header_bytes();
        if !header_only {
            image.extend_from_slice(&s.segments);
        }

        let ok = self
            .file
            .seek(SeekFrom::Start(pos))
            .and_then(|_| self.file.write_all(&image))
            .is_ok();
        if !ok {
            tracing::error!(stripe = s.meta.stripe, "stripe write failed");
            return;
        }
        if pos + STRIPE_SIZE as u64 > self.file_len {
            self.file_len = pos + STRIPE_SIZE as u64;
        }
    }

    /// Rotate to a fresh active stripe: persist the current one, free the
    /// least useful resident slot and recycle the least useful on-disk
    /// stripe into it.
    fn new_active(&mut self) {
        self.store_stripe(self.active, false);

        self.active = self.best_unloadable_slot();
        self.detach_stripe(self.active);

        let next = self.best_erasable_stripe();
        if self.load_stripe(next, self.active) {
            self.purge_stripe(self.active);
        } else {
            self.initialize_stripe(next, self.active);
        }
    }

    /// Non-active resident slot with the smallest freshness + load_uses;
    /// never-used slots win outright. With a single slot the active one
    /// is the only candidate.
    fn best_unloadable_slot(&self) -> usize {
        let mut best = u64::MAX;
        let mut chosen = self.active;
        for (i, s) in self.resident.iter().enumerate() {
            if i == self.active && self.resident.len() > 1 {
                continue;
            }
            if s.meta.signature == 0 {
                return i;
            }
            let score = s.meta.freshness.saturating_add(s.meta.load_uses as u64);
            if score < best {
                best = score;
                chosen = i;
            }
        }
        chosen
    }

    /// Non-resident on-disk stripe with the smallest freshness + uses;
    /// never-written stripes win outright.
    fn best_erasable_stripe(&self) -> u64 {
        let mut best = u64::MAX;
        let mut chosen = 0u64;
        for (i, m) in self.directory.iter().enumerate() {
            if m.state == STATE_RESIDENT {
                continue;
            }
            if m.signature == 0 {
                return i as u64;
            }
            let score = m.freshness.saturating_add(m.uses);
            if score < best {
                best = score;
                chosen = i as u64;
            }
        }
        chosen
    }

    /// Release a resident slot: purge its recency-window entries, record
    /// its header in the directory as dirty-detached and flush the header.
    fn detach_stripe(&mut self, slot: usize) {
        if self.resident[slot].meta.state != STATE_RESIDENT {
            return;
        }

        let stripe = self.resident[slot].meta.stripe;
        self.directory[stripe as usize] = self.resident[slot].meta;
        self.directory[stripe as usize].state = STATE_DETACHED;

        for i in 0..STRIPE_SEGMENT_COUNT {
            if self.resident[slot].flags[i] & FLAG_RECENT != 0 {
                let hash = self.resident[slot].hashes[i];
                self.recent.forget(hash);
                self.resident[slot].flags[i] &= !FLAG_RECENT;
            }
        }

        self.resident[slot].meta.state = STATE_ABSENT;
        self.store_stripe(slot, true);
    }

    /// Erase every slot not used since the previous cycle, compact the
    /// next-free index and restamp the stripe with a new serial.
    fn purge_stripe(&mut self, slot: usize) {
        let stripe_idx = self.resident[slot].meta.stripe;

        for i in (0..STRIPE_SEGMENT_COUNT).rev() {
            let hash = self.resident[slot].hashes[i];
            if hash != 0 && self.resident[slot].flags[i] & FLAG_USED == 0 {
                // Only drop the index entry if it still points here; the
                // hash may have been re-entered in a younger stripe.
                if self.index.get(&hash)
                    == Some(&IndexEntry {
                        stripe: stripe_idx,
                        slot: i as u16,
                    })
                {
                    self.index.remove(&hash);
                }
                self.resident[slot].hashes[i] = 0;
                self.resident[slot].flags[i] = 0;
                self.resident[slot].meta.segment_count =
                    self.resident[slot].meta.segment_count.saturating_sub(1);
            }

            self.resident[slot].flags[i] &= !FLAG_USED;
            if self.resident[slot].hashes[i] == 0 {
                self.resident[slot].meta.segment_index = i as u32;
            }
        }

        self.serial += 1;
        let meta = &mut self.resident[slot].meta;
        meta.serial = self.serial;
        meta.uses = meta.credits;
        meta.credits = 0;

        if meta.segment_count as usize >= STRIPE_SEGMENT_COUNT {
            tracing::info!("no reclaimable space in recycled stripe");
        }
    }

    fn resident_slot_for(&self, stripe: u64) -> Option<usize> {
        self.resident
            .iter()
            .position(|s| s.meta.state == STATE_RESIDENT && s.meta.stripe == stripe)
    }
}

impl SegmentCache for CossCache {
    fn identity(&self) -> &CacheIdentity {
        &self.identity
    }

    fn insert(&mut self, hash: u64, segment: &Segment) {
        // Two connections can race to declare the same segment; the copy
        // already indexed wins.
        if self.index.contains_key(&hash) {
            return;
        }

        while self.resident[self.active].meta.segment_index as usize >= STRIPE_SEGMENT_COUNT {
            self.new_active();
        }

        let active = self.active;
        let slot = self.resident[active].meta.segment_index as usize;
        let stripe_idx = self.resident[active].meta.stripe;

        self.resident[active].hashes[slot] = hash;
        self.resident[active].segment_mut(slot).copy_from_slice(segment);

        self.index.insert(
            hash,
            IndexEntry {
                stripe: stripe_idx,
                slot: slot as u16,
            },
        );

        // Advance past any slot that survived the last purge.
        self.resident[active].meta.segment_index += 1;
        loop {
            let next = self.resident[active].meta.segment_index as usize;
            if next >= STRIPE_SEGMENT_COUNT || self.resident[active].hashes[next] == 0 {
                break;
            }
            self.resident[active].meta.segment_index += 1;
        }
        self.resident[active].meta.segment_count += 1;
        self.freshness += 1;
        self.resident[active].meta.freshness = self.freshness;
    }

    fn lookup(&mut self, hash: u64) -> Option<Segment> {
        if let Some(seg) = self.recent.find(hash) {
            return Some(seg);
        }

        let entry = *self.index.get(&hash)?;

        let slot = match self.resident_slot_for(entry.stripe) {
            Some(slot) => slot,
            None => {
                let slot = self.best_unloadable_slot();
                self.detach_stripe(slot);
                if !self.load_stripe(entry.stripe, slot) {
                    // Disk said no: drop the stale entry and miss.
                    self.index.remove(&hash);
                    return None;
                }
                slot
            }
        };

        let pos = entry.slot as usize;
        if self.resident[slot].hashes[pos] != hash {
            // Header and index disagree; trust the header, degrade to miss.
            self.index.remove(&hash);
            return None;
        }

        self.freshness += 1;
        let meta = &mut self.resident[slot].meta;
        meta.freshness = self.freshness;
        meta.uses += 1;
        meta.credits += 1;
        meta.load_uses += 1;
        self.resident[slot].flags[pos] |= FLAG_RECENT | FLAG_USED;

        let segment: Segment = self.resident[slot].segment(pos).try_into().expect("slot is segment sized");
        self.recent.remember(hash, &segment);
        Some(segment)
    }
}

impl Drop for CossCache {
    fn drop(&mut self) {
        for slot in 0..self.resident.len() {
            if self.resident[slot].meta.state == STATE_RESIDENT {
                self.store_stripe(slot, slot != self.active);
            }
        }
        tracing::debug!(
            path = %self.path.display(),
            serial = self.serial,
            indexed = self.index.len(),
            "closed cache file"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};

    fn random_segment(rng: &mut impl Rng) -> Segment {
        let mut seg = [0u8; SEGMENT_LENGTH];
        rng.fill(&mut seg[..]);
        seg
    }

    #[test]
    fn header_layout_is_page_aligned() {
        assert_eq!(HEADER_SIZE, 8192);
        assert_eq!(STRIPE_SIZE, 8192 + 512 * SEGMENT_LENGTH);
    }

    #[test]
    fn metadata_encode_decode() {
        let meta = Metadata {
            signature: CACHE_SIGNATURE,
            version: CACHE_VERSION,
            serial: 7,
            stripe: 3,
            segment_index: 12,
            segment_count: 11,
            freshness: 99,
            uses: 5,
            credits: 2,
            load_uses: 1,
            state: STATE_RESIDENT,
        };
        let mut raw = [0u8; METADATA_SIZE];
        meta.encode(&mut raw);
        let back = Metadata::decode(&raw);
        assert_eq!(back.serial, 7);
        assert_eq!(back.stripe, 3);
        assert_eq!(back.segment_index, 12);
        assert_eq!(back.freshness, 99);
        assert!(back.valid());
    }

    #[test]
    fn insert_then_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = CossCache::open(Uuid::new_v4(), dir.path(), 1).unwrap();
        let mut rng = rand::rngs::StdRng::seed_from_u64(1);

        let seg = random_segment(&mut rng);
        cache.insert(1234, &seg);
        assert_eq!(cache.lookup(1234), Some(seg));
        assert_eq!(cache.lookup(9999), None);
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let uuid = Uuid::new_v4();
        let mut rng = rand::rngs::StdRng::seed_from_u64(2);

        let entries: Vec<(u64, Segment)> =
            (1..200u64).map(|h| (h, random_segment(&mut rng))).collect();

        {
            let mut cache = CossCache::open(uuid, dir.path(), 1).unwrap();
            for (hash, seg) in &entries {
                cache.insert(*hash, seg);
            }
        }

        let mut cache = CossCache::open(uuid, dir.path(), 1).unwrap();
        for (hash, seg) in &entries {
            assert_eq!(cache.lookup(*hash), Some(*seg), "hash {hash} lost on reopen");
        }
    }

    #[test]
    fn eviction_stays_within_bound_and_keeps_recent() {
        let dir = tempfile::tempdir().unwrap();
        let uuid = Uuid::new_v4();
        let mut rng = rand::rngs::StdRng::seed_from_u64(3);

        // A cache sized for very few stripes, filled well past capacity.
        let size_mb = 1; // rounds up to a handful of stripes
        let mut cache = CossCache::open(uuid, dir.path(), size_mb).unwrap();
        let limit = cache.stripe_limit;

        let total = STRIPE_SEGMENT_COUNT as u64 * limit * 3;
        let mut last: Vec<(u64, Segment)> = Vec::new();
        for h in 1..=total {
            let seg = random_segment(&mut rng);
            cache.insert(h, &seg);
            if h > total - 64 {
                last.push((h, seg));
            }
        }

        // Recently inserted segments are still resolvable.
        for (hash, seg) in &last {
            assert_eq!(cache.lookup(*hash), Some(*seg));
        }

        // The oldest generation has been cycled out.
        assert_eq!(cache.lookup(1), None, "oldest segment should be evicted");

        drop(cache);
        let file_len = std::fs::metadata(dir.path().join(format!("{uuid}.wpc")))
            .unwrap()
            .len();
        assert!(
            file_len <= limit * STRIPE_SIZE as u64,
            "file grew past the configured bound"
        );
    }

    #[test]
    fn truncated_file_recovers() {
        let dir = tempfile::tempdir().unwrap();
        let uuid = Uuid::new_v4();
        let mut rng = rand::rngs::StdRng::seed_from_u64(4);

        let entries: Vec<(u64, Segment)> = (1..=(STRIPE_SEGMENT_COUNT as u64 * 2))
            .map(|h| (h, random_segment(&mut rng)))
            .collect();

        {
            let mut cache = CossCache::open(uuid, dir.path(), 1).unwrap();
            for (hash, seg) in &entries {
                cache.insert(*hash, seg);
            }
        }

        // Simulate a crash mid-write: chop the file at an arbitrary offset.
        let path = dir.path().join(format!("{uuid}.wpc"));
        let len = std::fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - STRIPE_SIZE as u64 / 3).unwrap();

        // The cache must come back up, and everything still indexed must
        // read back with identical bytes.
        let mut cache = CossCache::open(uuid, dir.path(), 1).unwrap();
        let mut surviving = 0usize;
        for (hash, seg) in &entries {
            if let Some(stored) = cache.lookup(*hash) {
                assert_eq!(&stored, seg, "hash {hash} corrupted by recovery");
                surviving += 1;
            }
        }
        assert!(surviving > 0, "recovery lost every stripe");

        // And it accepts new insertions.
        let seg = random_segment(&mut rng);
        cache.insert(0xdead_beef, &seg);
        assert_eq!(cache.lookup(0xdead_beef), Some(seg));
    }

    #[test]
    fn garbage_file_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let uuid = Uuid::new_v4();
        let path = dir.path().join(format!("{uuid}.wpc"));
        std::fs::write(&path, vec![0xa5u8; STRIPE_SIZE * 2]).unwrap();

        let mut cache = CossCache::open(uuid, dir.path(), 1).unwrap();
        assert_eq!(cache.lookup(1), None);
        let seg = [7u8; SEGMENT_LENGTH];
        cache.insert(1, &seg);
        assert_eq!(cache.lookup(1), Some(seg));
    }
}
