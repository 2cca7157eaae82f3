//! Metadata index (C3): per-key metadata plus the tag and prefix/pattern
//! queries the facade needs for bulk invalidation.

mod key;

pub use key::CacheKey;

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use dashmap::DashMap;
use regex::Regex;

use crate::clock::{Clock, SharedClock};
use crate::error::{CacheError, CacheResult, ErrorKind};

/// A bulk-invalidation label attached to an entry.
pub type Tag = Arc<str>;

const ACCESS_HISTORY_CAP: usize = 10;

/// Everything the core tracks about a single live key, owned by the
/// [`MetadataIndex`] and mirrored into the memory engine where convenient.
#[derive(Debug, Clone)]
pub struct EntryMetadata {
    /// Set-valued labels used for tag-based bulk invalidation.
    pub tags: HashSet<Tag>,
    /// Epoch-millisecond creation time.
    pub created_at: u64,
    /// Epoch-millisecond time of the most recent write.
    pub updated_at: u64,
    /// Epoch-millisecond time of the most recent read.
    pub last_accessed: u64,
    /// Monotonic non-negative read counter.
    pub access_count: u64,
    /// TTL in seconds, if the entry expires by time.
    pub ttl_seconds: Option<u64>,
    /// `created_at + ttl_seconds * 1000`, kept consistent with `ttl_seconds`.
    pub expires_at: Option<u64>,
    /// Byte-size estimate (compressed size when `compressed` is set).
    pub size: u64,
    /// Whether the stored payload is compressed.
    pub compressed: bool,
    /// Bounded ring of recent access instants, for diagnostics.
    pub access_history: VecDeque<u64>,
    /// Epoch-millisecond time the value was last (re)computed, used for
    /// stale-while-revalidate threshold checks in the compute engine.
    pub refreshed_at: Option<u64>,
}

impl EntryMetadata {
    fn new(now: u64, tags: HashSet<Tag>, ttl_seconds: Option<u64>, size: u64, compressed: bool) -> Self {
        let expires_at = ttl_seconds
            .filter(|ttl| *ttl > 0)
            .map(|ttl| now + ttl * 1000);
        Self {
            tags,
            created_at: now,
            updated_at: now,
            last_accessed: now,
            access_count: 0,
            ttl_seconds,
            expires_at,
            size,
            compressed,
            access_history: VecDeque::with_capacity(ACCESS_HISTORY_CAP),
            refreshed_at: Some(now),
        }
    }

    /// True iff `expires_at` is set and not after `now`.
    #[must_use]
    pub fn is_expired(&self, now: u64) -> bool {
        self.expires_at.is_some_and(|exp| exp <= now)
    }
}

/// Partial update applied by [`MetadataIndex::set`]/[`MetadataIndex::update`].
#[derive(Debug, Clone, Default)]
pub struct MetadataPatch {
    /// `Some(tags)` replaces the tag set (differentially updating the
    /// reverse index); `None` leaves existing tags untouched. Pass
    /// `Some(HashSet::new())` to explicitly clear tags.
    pub tags: Option<HashSet<Tag>>,
    pub ttl_seconds: Option<Option<u64>>,
    pub size: Option<u64>,
    pub compressed: Option<bool>,
    pub refreshed_at: Option<u64>,
}

/// Aggregate statistics across all live entries.
#[derive(Debug, Clone, Default)]
pub struct MetadataStats {
    pub entry_count: usize,
    pub avg_access_count: f64,
    pub avg_ttl_seconds: f64,
    pub avg_age_millis: f64,
    pub tag_counts: std::collections::HashMap<Tag, usize>,
}

/// Maps keys to metadata and tags to the keys that carry them.
pub struct MetadataIndex {
    entries: DashMap<CacheKey, EntryMetadata>,
    tag_index: DashMap<Tag, HashSet<CacheKey>>,
    clock: SharedClock,
}

impl MetadataIndex {
    /// Create an empty index using the given clock.
    #[must_use]
    pub fn new(clock: SharedClock) -> Self {
        Self {
            entries: DashMap::new(),
            tag_index: DashMap::new(),
            clock,
        }
    }

    fn now(&self) -> u64 {
        self.clock.now_millis()
    }

    /// Initialize metadata for a key. Rejects empty/whitespace keys (the key
    /// itself is already validated by [`CacheKey::new`] by the time it
    /// reaches here; this guards against programmer error constructing a
    /// `CacheKey` some other way).
    pub fn create(
        &self,
        key: CacheKey,
        tags: HashSet<Tag>,
        ttl_seconds: Option<u64>,
        size: u64,
        compressed: bool,
    ) -> CacheResult<()> {
        if key.as_str().trim().is_empty() {
            return Err(CacheError::invalid_key("key must not be empty or whitespace"));
        }
        let now = self.now();
        for tag in &tags {
            self.tag_index.entry(tag.clone()).or_default().insert(key.clone());
        }
        self.entries.insert(key, EntryMetadata::new(now, tags, ttl_seconds, size, compressed));
        Ok(())
    }

    /// Upsert: create the entry if absent, otherwise apply `patch` the same
    /// way [`Self::update`] would.
    pub fn set(&self, key: CacheKey, patch: MetadataPatch) -> CacheResult<()> {
        if !self.entries.contains_key(&key) {
            let tags = patch.tags.clone().unwrap_or_default();
            let ttl = patch.ttl_seconds.flatten();
            let size = patch.size.unwrap_or(0);
            let compressed = patch.compressed.unwrap_or(false);
            self.create(key.clone(), tags, ttl, size, compressed)?;
            if patch.refreshed_at.is_none() && patch.tags.is_none() {
                return Ok(());
            }
        }
        self.update(&key, patch)
    }

    /// Mutate an existing entry in place. Fails with `NotFound` if absent.
    pub fn update(&self, key: &CacheKey, patch: MetadataPatch) -> CacheResult<()> {
        let now = self.now();
        let mut entry = self
            .entries
            .get_mut(key)
            .ok_or_else(|| CacheError::not_found(key.clone()))?;

        if let Some(new_tags) = patch.tags {
            let old_tags = std::mem::replace(&mut entry.tags, new_tags.clone());
            for removed in old_tags.difference(&new_tags) {
                if let Some(mut set) = self.tag_index.get_mut(removed) {
                    set.remove(key);
                }
            }
            for added in new_tags.difference(&old_tags) {
                self.tag_index.entry(added.clone()).or_default().insert(key.clone());
            }
        }
        if let Some(ttl) = patch.ttl_seconds {
            entry.ttl_seconds = ttl;
            entry.expires_at = ttl.filter(|t| *t > 0).map(|t| now + t * 1000);
        }
        if let Some(size) = patch.size {
            entry.size = size;
        }
        if let Some(compressed) = patch.compressed {
            entry.compressed = compressed;
        }
        if let Some(refreshed_at) = patch.refreshed_at {
            entry.refreshed_at = Some(refreshed_at);
        }
        entry.updated_at = now;
        Ok(())
    }

    /// Defensive copy of a key's metadata.
    #[must_use]
    pub fn get(&self, key: &CacheKey) -> Option<EntryMetadata> {
        self.entries.get(key).map(|e| e.clone())
    }

    /// Remove the entry and its tag memberships. Returns whether it existed.
    pub fn delete(&self, key: &CacheKey) -> bool {
        let Some((_, meta)) = self.entries.remove(key) else {
            return false;
        };
        for tag in &meta.tags {
            if let Some(mut set) = self.tag_index.get_mut(tag) {
                set.remove(key);
            }
        }
        true
    }

    /// Remove every entry and every tag membership.
    pub fn clear(&self) {
        self.entries.clear();
        self.tag_index.clear();
    }

    /// Increment the access counter, stamp `last_accessed`, and append to
    /// the bounded access-history ring.
    pub fn record_access(&self, key: &CacheKey) {
        let now = self.now();
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.access_count += 1;
            entry.last_accessed = now;
            if entry.access_history.len() == ACCESS_HISTORY_CAP {
                entry.access_history.pop_front();
            }
            entry.access_history.push_back(now);
        }
    }

    /// Snapshot of every key carrying `tag`. O(1) lookup into the reverse
    /// index, O(k) to materialize the snapshot.
    #[must_use]
    pub fn find_by_tag(&self, tag: &str) -> Vec<CacheKey> {
        self.tag_index
            .get(tag)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Snapshot of every key starting with `prefix`.
    #[must_use]
    pub fn find_by_prefix(&self, prefix: &str) -> Vec<CacheKey> {
        self.entries
            .iter()
            .filter(|entry| entry.key().as_str().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Snapshot of every key matching `pattern`. Compilation failures map
    /// to `ErrorKind::InvalidArgument`.
    pub fn find_by_pattern(&self, pattern: &str) -> CacheResult<Vec<CacheKey>> {
        let re = Regex::new(pattern)
            .map_err(|e| CacheError::new(ErrorKind::InvalidArgument, e.to_string()))?;
        Ok(self
            .entries
            .iter()
            .filter(|entry| re.is_match(entry.key().as_str()))
            .map(|entry| entry.key().clone())
            .collect())
    }

    /// True iff the key's `expires_at` is present and not after `now`.
    #[must_use]
    pub fn is_expired(&self, key: &CacheKey) -> bool {
        let now = self.now();
        self.entries.get(key).is_some_and(|e| e.is_expired(now))
    }

    /// Aggregate statistics across all live entries.
    #[must_use]
    pub fn stats(&self) -> MetadataStats {
        let now = self.now();
        let mut stats = MetadataStats {
            entry_count: self.entries.len(),
            ..Default::default()
        };
        if stats.entry_count == 0 {
            return stats;
        }
        let mut access_sum = 0u64;
        let mut ttl_sum = 0u64;
        let mut ttl_count = 0u64;
        let mut age_sum = 0u64;
        for entry in self.entries.iter() {
            access_sum += entry.access_count;
            age_sum += now.saturating_sub(entry.created_at);
            if let Some(ttl) = entry.ttl_seconds {
                ttl_sum += ttl;
                ttl_count += 1;
            }
        }
        stats.avg_access_count = access_sum as f64 / stats.entry_count as f64;
        stats.avg_age_millis = age_sum as f64 / stats.entry_count as f64;
        stats.avg_ttl_seconds = if ttl_count > 0 {
            ttl_sum as f64 / ttl_count as f64
        } else {
            0.0
        };
        for set in self.tag_index.iter() {
            stats.tag_counts.insert(set.key().clone(), set.value().len());
        }
        stats
    }
}
