//! Two-level translation cache.
//!
//! L1 is a bounded in-memory map of [`TranslationEntry`] records with LRU
//! ordering and hotness-aware eviction. L2 is one cache file per guest
//! binary (layout in [`file`]), loaded into an in-memory [`CacheImage`] when
//! the binary is attached and kept durable through the persistence queue.
//!
//! Lookup composition: L1 first; on an L1 miss the attached image is
//! searched, a hit is promoted back into L1 by the caller and the image's
//! per-entry counters stream back to disk in place. Everything keys on
//! `(guest_address, guest_hash)` so a stale translation of mutated guest
//! bytes can never be returned.
//!
//! The cache holds no reference to the persistence manager; callers pass a
//! borrowed handle to the operations that queue writes.

#![forbid(unsafe_code)]

mod entry;
mod error;
pub mod file;

use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use lru::LruCache;
use tracing::{debug, warn};
use volans_hash::xxh64;
use volans_persist::PersistenceManager;

pub use entry::{flags, TranslationEntry, HOT_ACCESS_THRESHOLD};
pub use error::{CacheError, Result};
pub use file::{CacheFileEntry, CacheFileHeader, CacheImage};

/// Default L1 capacity in entries.
pub const DEFAULT_L1_ENTRIES: usize = 1024;

/// Nanoseconds since the Unix epoch; the timestamp domain of every
/// `last_access`/`last_execution` field in the cache.
pub fn unix_now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos().min(u128::from(u64::MAX)) as u64)
        .unwrap_or(0)
}

/// Identifier of a loaded guest binary: `<hex-hash>_<creation-epoch-ns>`.
///
/// The hash component is stable across runs for identical bytes; the suffix
/// keeps identifiers unique when distinct binaries collide on the hash or a
/// cache has to be regenerated.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BinaryId(Arc<str>);

impl BinaryId {
    pub fn new(content_hash: u64, created_ns: u64) -> Self {
        Self(format!("{content_hash:016x}_{created_ns}").into())
    }

    /// Parse an identifier produced by [`BinaryId::new`], e.g. from a cache
    /// file name. Returns `None` when the shape does not match.
    pub fn parse(text: &str) -> Option<Self> {
        let (hash, suffix) = text.split_once('_')?;
        if hash.len() != 16 || u64::from_str_radix(hash, 16).is_err() {
            return None;
        }
        if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        Some(Self(text.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The stable content-hash component.
    pub fn content_hash(&self) -> u64 {
        let hex = self.0.split('_').next().expect("validated shape");
        u64::from_str_radix(hex, 16).expect("validated shape")
    }

    /// The creation-timestamp component (nanoseconds since the epoch).
    pub fn created_ns(&self) -> u64 {
        let suffix = self.0.split('_').nth(1).expect("validated shape");
        suffix.parse().expect("validated shape")
    }
}

impl fmt::Display for BinaryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which tier produced a hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheLevel {
    L1,
    L2,
}

/// Result of [`TranslationCache::lookup`].
#[derive(Debug, Clone, PartialEq)]
pub enum LookupOutcome {
    /// Served from memory; `host_addr` is valid.
    L1(TranslationEntry),
    /// Served from the attached cache image. The host code still has to be
    /// placed into executable memory; the caller then promotes the entry
    /// with its final `host_addr` via [`TranslationCache::promote`].
    L2 {
        entry: TranslationEntry,
        host_bytes: Vec<u8>,
    },
    Miss,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub l1_hits: u64,
    pub l2_hits: u64,
    pub misses: u64,
}

type L1Key = (BinaryId, u64);

#[derive(Debug)]
struct AttachedBinary {
    path: PathBuf,
    image: Option<CacheImage>,
}

#[derive(Debug)]
struct CacheInner {
    l1: LruCache<L1Key, TranslationEntry>,
    binaries: HashMap<BinaryId, AttachedBinary>,
    stats: CacheStats,
}

/// The translation cache. All operations synchronise on one internal mutex;
/// hit counters are monotonic.
#[derive(Debug)]
pub struct TranslationCache {
    inner: Mutex<CacheInner>,
    capacity: NonZeroUsize,
}

impl Default for TranslationCache {
    fn default() -> Self {
        Self::new()
    }
}

impl TranslationCache {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_L1_ENTRIES)
    }

    /// `capacity` is clamped to at least one entry.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                l1: LruCache::unbounded(),
                binaries: HashMap::new(),
                stats: CacheStats::default(),
            }),
            capacity: NonZeroUsize::new(capacity.max(1)).expect("non-zero"),
        }
    }

    /// Register `id` and synchronously load its cache file, if one exists
    /// and is intact. Returns whether an image was loaded. Corruption is
    /// demoted to "no image": logged, never propagated.
    pub fn attach_binary(
        &self,
        persist: &PersistenceManager,
        id: &BinaryId,
        expected_guest_hash: u64,
    ) -> bool {
        let path = persist.cache_file_path(id.as_str());

        let image = match CacheImage::load(&path) {
            Ok(image) => {
                if image.header.guest_hash == expected_guest_hash {
                    debug!(
                        binary = %id,
                        entries = image.entries.len(),
                        "loaded persistent cache image"
                    );
                    Some(image)
                } else {
                    warn!(binary = %id, "cache file belongs to a different binary; ignoring");
                    None
                }
            }
            Err(CacheError::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(error) => {
                warn!(binary = %id, %error, "cache file rejected; treating as absent");
                None
            }
        };

        let loaded = image.is_some();
        let mut inner = self.lock();
        inner.binaries.insert(id.clone(), AttachedBinary { path, image });
        loaded
    }

    /// Look up the translation of the block at `guest_addr` whose current
    /// bytes are `guest_bytes`.
    pub fn lookup(
        &self,
        persist: &PersistenceManager,
        id: &BinaryId,
        guest_addr: u64,
        guest_bytes: &[u8],
    ) -> LookupOutcome {
        let guest_hash = xxh64(guest_bytes, 0);
        let now = unix_now_ns();
        let mut inner = self.lock();

        let key = (id.clone(), guest_addr);
        if let Some(entry) = inner.l1.get_mut(&key) {
            if entry.guest_hash == guest_hash {
                entry.touch(now);
                let entry = entry.clone();
                inner.stats.l1_hits += 1;
                return LookupOutcome::L1(entry);
            }
            // Address matches but the guest bytes changed underneath us:
            // the stale entry must not be served.
            debug!(binary = %id, guest_addr, "guest hash mismatch, stale entry ignored");
        }

        if let Some(found) = inner
            .binaries
            .get_mut(id)
            .and_then(|attached| {
                let image = attached.image.as_mut()?;
                let index = image.find_index(guest_addr, guest_hash)?;
                Some((attached.path.clone(), image, index))
            })
            .map(|(path, image, index)| {
                image.entries[index].execution_count =
                    image.entries[index].execution_count.saturating_add(1);
                image.entries[index].last_execution_ns = now;
                image.header.hit_count = image.header.hit_count.saturating_add(1);
                image.header.last_access_ns = now;

                let record = image.entries[index];
                let host_bytes = image.host_bytes(&record).to_vec();
                let header_bytes = image.header.encode().to_vec();
                (path, record, index, host_bytes, header_bytes)
            })
        {
            let (path, record, index, host_bytes, header_bytes) = found;

            // Stream the in-place counter updates back to disk.
            persist.queue_write(path.clone(), header_bytes, 0);
            persist.queue_write(
                path,
                record.encode().to_vec(),
                file::entry_record_offset(index),
            );

            inner.stats.l2_hits += 1;
            let entry = TranslationEntry {
                guest_addr: record.guest_addr,
                host_addr: 0,
                guest_len: record.guest_size,
                host_len: record.host_size,
                guest_hash: record.guest_hash,
                last_access_ns: now,
                access_count: record.execution_count,
                hot: record.execution_count > HOT_ACCESS_THRESHOLD,
                flags: record.flags,
            };
            return LookupOutcome::L2 { entry, host_bytes };
        }

        inner.stats.misses += 1;
        LookupOutcome::Miss
    }

    /// Insert a freshly translated block and return its entry.
    pub fn store(
        &self,
        id: &BinaryId,
        guest_addr: u64,
        guest_bytes: &[u8],
        host_addr: u64,
        host_bytes: &[u8],
        entry_flags: u32,
    ) -> TranslationEntry {
        let entry = TranslationEntry {
            guest_addr,
            host_addr,
            guest_len: guest_bytes.len() as u32,
            host_len: host_bytes.len() as u32,
            guest_hash: xxh64(guest_bytes, 0),
            last_access_ns: unix_now_ns(),
            access_count: 1,
            hot: false,
            flags: entry_flags,
        };

        let mut inner = self.lock();
        Self::insert_bounded(&mut inner, self.capacity, (id.clone(), guest_addr), entry.clone());
        entry
    }

    /// Insert an entry recovered from L2 (after the caller placed its host
    /// code and assigned `host_addr`).
    pub fn promote(&self, id: &BinaryId, entry: TranslationEntry) {
        let mut inner = self.lock();
        let key = (id.clone(), entry.guest_addr);
        Self::insert_bounded(&mut inner, self.capacity, key, entry);
    }

    /// Eviction on overflow: scan from the LRU end toward MRU for the first
    /// cold entry and remove it; if every entry is hot, remove the LRU entry
    /// regardless. Guarantees forward progress while biasing retention
    /// toward repeatedly used code.
    fn insert_bounded(
        inner: &mut CacheInner,
        capacity: NonZeroUsize,
        key: L1Key,
        entry: TranslationEntry,
    ) {
        if !inner.l1.contains(&key) {
            while inner.l1.len() >= capacity.get() {
                let victim = inner
                    .l1
                    .iter()
                    .rev()
                    .find(|(_, e)| !e.hot)
                    .map(|(k, _)| k.clone());
                match victim {
                    Some(victim) => {
                        inner.l1.pop(&victim);
                    }
                    None => {
                        inner.l1.pop_lru();
                    }
                }
            }
        }
        inner.l1.put(key, entry);
    }

    /// Marshal this binary's live L1 entries into a fresh cache image and
    /// queue the whole file for writing. `host_bytes_of` supplies each
    /// entry's host code; entries it cannot resolve are skipped.
    ///
    /// The refreshed image also replaces the attached one, so entries that
    /// later fall out of L1 remain reachable through L2.
    pub fn checkpoint<F>(
        &self,
        persist: &PersistenceManager,
        id: &BinaryId,
        binary_hash: u64,
        mut host_bytes_of: F,
    ) where
        F: FnMut(&TranslationEntry) -> Option<Vec<u8>>,
    {
        let now = unix_now_ns();
        let mut inner = self.lock();

        let mut live: Vec<TranslationEntry> = inner
            .l1
            .iter()
            .filter(|((binary, _), _)| binary == id)
            .map(|(_, entry)| entry.clone())
            .collect();
        live.sort_by_key(|entry| entry.guest_addr);

        let mut entries = Vec::with_capacity(live.len());
        let mut blob = Vec::new();
        for entry in &live {
            let Some(code) = host_bytes_of(entry) else {
                warn!(binary = %id, guest_addr = entry.guest_addr, "host code unavailable at checkpoint");
                continue;
            };
            entries.push(CacheFileEntry {
                guest_addr: entry.guest_addr,
                guest_size: entry.guest_len,
                guest_hash: entry.guest_hash,
                host_offset: blob.len() as u64,
                host_size: code.len() as u32,
                execution_count: entry.access_count,
                last_execution_ns: entry.last_access_ns,
                flags: entry.flags,
            });
            blob.extend_from_slice(&code);
        }

        let Some(attached) = inner.binaries.get_mut(id) else {
            warn!(binary = %id, "checkpoint for unattached binary ignored");
            return;
        };

        // Creation time and accumulated hit count survive across checkpoints.
        let (creation_time_ns, hit_count) = match &attached.image {
            Some(previous) => (previous.header.creation_time_ns, previous.header.hit_count),
            None => (now, 0),
        };

        let image = CacheImage {
            header: CacheFileHeader {
                version: file::CACHE_VERSION,
                entry_count: entries.len() as u32,
                guest_hash: binary_hash,
                creation_time_ns,
                last_access_ns: now,
                hit_count,
            },
            entries,
            blob,
        };

        let bytes = image.encode();
        let path = attached.path.clone();
        attached.image = Some(image);
        drop(inner);

        debug!(binary = %id, bytes = bytes.len(), "checkpoint queued");
        persist.queue_write(path, bytes, 0);
    }

    pub fn stats(&self) -> CacheStats {
        self.lock().stats
    }

    pub fn len(&self) -> usize {
        self.lock().l1.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clear L1 and the hit counters. Attached binaries stay attached.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.l1.clear();
        inner.stats = CacheStats::default();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheInner> {
        self.inner.lock().expect("translation cache poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn persist(dir: &std::path::Path) -> PersistenceManager {
        PersistenceManager::new(volans_persist::PersistConfig::new(dir)).unwrap()
    }

    fn id() -> BinaryId {
        BinaryId::new(0xDEADBEEF, 123456789)
    }

    #[test]
    fn binary_id_round_trips() {
        let id = BinaryId::new(0xDEADBEEF, 42);
        assert_eq!(id.as_str(), "00000000deadbeef_42");
        assert_eq!(id.content_hash(), 0xDEADBEEF);
        assert_eq!(BinaryId::parse(id.as_str()), Some(id));

        assert!(BinaryId::parse("deadbeef_42").is_none()); // short hash
        assert!(BinaryId::parse("00000000deadbeef").is_none()); // no suffix
        assert!(BinaryId::parse("00000000deadbeef_4x").is_none());
    }

    #[test]
    fn store_then_lookup_hits_l1() {
        let dir = tempfile::tempdir().unwrap();
        let persist = persist(dir.path());
        let cache = TranslationCache::new();
        let id = id();
        cache.attach_binary(&persist, &id, 0);

        let guest = [0x90u8, 0xC3];
        let host = [0u8; 12];
        cache.store(&id, 0x1000, &guest, 0, &host, 0);

        match cache.lookup(&persist, &id, 0x1000, &guest) {
            LookupOutcome::L1(entry) => {
                assert_eq!(entry.guest_addr, 0x1000);
                assert_eq!(entry.access_count, 2);
            }
            other => panic!("expected L1 hit, got {other:?}"),
        }
        let stats = cache.stats();
        assert_eq!(stats.l1_hits, 1);
        assert_eq!(stats.misses, 0);
    }

    #[test]
    fn mutated_guest_bytes_miss() {
        let dir = tempfile::tempdir().unwrap();
        let persist = persist(dir.path());
        let cache = TranslationCache::new();
        let id = id();
        cache.attach_binary(&persist, &id, 0);

        cache.store(&id, 0x2000, &[0x90, 0xC3], 0, &[0u8; 12], 0);
        // First byte mutated: same address, different hash.
        assert_eq!(
            cache.lookup(&persist, &id, 0x2000, &[0x50, 0xC3]),
            LookupOutcome::Miss
        );
        assert_eq!(cache.stats().misses, 1);
        assert_eq!(cache.stats().l1_hits, 0);
    }

    #[test]
    fn per_binary_namespaces_do_not_alias() {
        let dir = tempfile::tempdir().unwrap();
        let persist = persist(dir.path());
        let cache = TranslationCache::new();
        let a = BinaryId::new(1, 1);
        let b = BinaryId::new(2, 2);
        cache.attach_binary(&persist, &a, 0);
        cache.attach_binary(&persist, &b, 0);

        cache.store(&a, 0x1000, &[0x90], 0, &[0u8; 4], 0);
        assert!(matches!(
            cache.lookup(&persist, &b, 0x1000, &[0x90]),
            LookupOutcome::Miss
        ));
        assert!(matches!(
            cache.lookup(&persist, &a, 0x1000, &[0x90]),
            LookupOutcome::L1(_)
        ));
    }

    #[test]
    fn cold_lru_entry_is_evicted_first() {
        let dir = tempfile::tempdir().unwrap();
        let persist = persist(dir.path());
        let cache = TranslationCache::with_capacity(1024);
        let id = id();
        cache.attach_binary(&persist, &id, 0);

        for i in 0..1024u64 {
            cache.store(&id, 0x1000 + i, &[0x90], 0, &[0u8; 4], 0);
        }
        assert_eq!(cache.len(), 1024);

        // One more store evicts the LRU cold entry (the first one stored).
        cache.store(&id, 0x9000, &[0x90], 0, &[0u8; 4], 0);
        assert_eq!(cache.len(), 1024);
        assert!(matches!(
            cache.lookup(&persist, &id, 0x1000, &[0x90]),
            LookupOutcome::Miss
        ));
        assert!(matches!(
            cache.lookup(&persist, &id, 0x9000, &[0x90]),
            LookupOutcome::L1(_)
        ));
        assert!(matches!(
            cache.lookup(&persist, &id, 0x1001, &[0x90]),
            LookupOutcome::L1(_)
        ));
    }

    #[test]
    fn hot_entries_survive_eviction_while_cold_ones_exist() {
        let dir = tempfile::tempdir().unwrap();
        let persist = persist(dir.path());
        let cache = TranslationCache::with_capacity(4);
        let id = id();
        cache.attach_binary(&persist, &id, 0);

        // Make entry 0 hot.
        cache.store(&id, 0, &[0x90], 0, &[0u8; 4], 0);
        for _ in 0..=HOT_ACCESS_THRESHOLD {
            let _ = cache.lookup(&persist, &id, 0, &[0x90]);
        }

        for addr in 1..4u64 {
            cache.store(&id, addr, &[0x90], 0, &[0u8; 4], 0);
        }
        assert_eq!(cache.len(), 4);

        // The hot entry is the LRU-adjacent one but must be skipped: the
        // oldest cold entry (addr 1) goes instead.
        cache.store(&id, 4, &[0x90], 0, &[0u8; 4], 0);
        assert!(matches!(
            cache.lookup(&persist, &id, 0, &[0x90]),
            LookupOutcome::L1(_)
        ));
        assert!(matches!(
            cache.lookup(&persist, &id, 1, &[0x90]),
            LookupOutcome::Miss
        ));
    }

    #[test]
    fn all_hot_cache_still_makes_progress() {
        let dir = tempfile::tempdir().unwrap();
        let persist = persist(dir.path());
        let cache = TranslationCache::with_capacity(2);
        let id = id();
        cache.attach_binary(&persist, &id, 0);

        for addr in 0..2u64 {
            cache.store(&id, addr, &[0x90], 0, &[0u8; 4], 0);
            for _ in 0..=HOT_ACCESS_THRESHOLD {
                let _ = cache.lookup(&persist, &id, addr, &[0x90]);
            }
        }

        // Both entries hot; the LRU one (addr 0) is sacrificed.
        cache.store(&id, 7, &[0x90], 0, &[0u8; 4], 0);
        assert_eq!(cache.len(), 2);
        assert!(matches!(
            cache.lookup(&persist, &id, 0, &[0x90]),
            LookupOutcome::Miss
        ));
        assert!(matches!(
            cache.lookup(&persist, &id, 1, &[0x90]),
            LookupOutcome::L1(_)
        ));
    }

    #[test]
    fn restore_replaces_stale_entry_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let persist = persist(dir.path());
        let cache = TranslationCache::with_capacity(8);
        let id = id();
        cache.attach_binary(&persist, &id, 0);

        cache.store(&id, 0x3000, &[0x90, 0xC3], 0, &[0u8; 12], 0);
        // Guest bytes changed; a retranslation stores under the same key.
        cache.store(&id, 0x3000, &[0x50, 0xC3], 4, &[0u8; 8], 0);
        assert_eq!(cache.len(), 1);

        match cache.lookup(&persist, &id, 0x3000, &[0x50, 0xC3]) {
            LookupOutcome::L1(entry) => assert_eq!(entry.host_addr, 4),
            other => panic!("expected L1 hit, got {other:?}"),
        }
    }
}
