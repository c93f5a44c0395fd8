//! Keyed result cache with freshness and retention windows.
//!
//! [`CacheStore`] owns every [`CacheEntry`] exclusively; all mutation goes
//! through `mark_pending`/`complete`/`fail`/`evict`/`invalidate`. Entries
//! move through `absent -> pending -> {fresh | error}` and age from fresh
//! to stale once the freshness window elapses; stale entries are still
//! served immediately while a revalidation runs ("stale-while-revalidate").
//! Entries untouched for the retention window are evicted by the sweep,
//! and an identity switch evicts its entries eagerly so one role's rows
//! can never linger into another's session.
//!
//! All ages are measured on the tokio clock, the same clock that drives
//! fetch timeouts and the sweep interval.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::Error;
use crate::key::QueryKey;
use crate::remote::Incident;

/// Lifecycle state of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// A fetch (first or revalidation) is expected to fill this entry.
    Pending,
    /// Data is current within the freshness window.
    Fresh,
    /// Data exists but the freshness window has elapsed.
    Stale,
    /// The most recent fetch failed; any prior data is still displayable.
    Error,
}

/// Displayable summary of a stored fetch failure.
///
/// [`crate::Error`] is not `Clone`, so entries keep this reduced form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    /// Stable category label (see [`crate::Error::category`]).
    pub category: &'static str,
    /// User-displayable message.
    pub message: String,
}

impl From<&Error> for ErrorInfo {
    fn from(err: &Error) -> Self {
        Self {
            category: err.category(),
            message: err.to_string(),
        }
    }
}

/// One cached page of results plus its lifecycle metadata.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Records for this key's page, at most `page_size` of them.
    pub records: Vec<Incident>,
    /// Total matching rows reported by the service, 0 until first success.
    pub total_count: u64,
    /// When the data was last fetched successfully.
    pub fetched_at: Instant,
    /// When any consumer last read this entry.
    pub last_accessed: Instant,
    /// Lifecycle state.
    pub state: EntryState,
    /// Failure from the most recent fetch, if it failed.
    pub error: Option<ErrorInfo>,
    has_data: bool,
}

impl CacheEntry {
    fn pending() -> Self {
        let now = Instant::now();
        Self {
            records: Vec::new(),
            total_count: 0,
            fetched_at: now,
            last_accessed: now,
            state: EntryState::Pending,
            error: None,
            has_data: false,
        }
    }

    /// Whether a successful fetch has ever filled this entry.
    ///
    /// Distinguishes "no data yet" from "fetched zero rows": an empty page
    /// with `has_data()` true is a real, displayable result.
    #[must_use]
    pub const fn has_data(&self) -> bool {
        self.has_data
    }

    /// Age of the data since its last successful fetch.
    #[must_use]
    pub fn age(&self) -> Duration {
        self.fetched_at.elapsed()
    }
}

/// Cache behavior knobs.
#[derive(Debug, Clone, Copy)]
pub struct CachePolicy {
    /// Entries younger than this are served without any fetch.
    pub freshness_window: Duration,
    /// Entries unread for this long are evicted by the sweep.
    pub retention_window: Duration,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            freshness_window: Duration::from_secs(30),
            retention_window: Duration::from_secs(300),
        }
    }
}

/// Counters for cache behavior, updated with relaxed atomics.
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Reads that found an entry with data.
    pub hits: AtomicU64,
    /// Reads that found nothing usable.
    pub misses: AtomicU64,
    /// Background revalidations triggered by stale reads.
    pub revalidations: AtomicU64,
    /// Entries removed by sweep, invalidation, or explicit eviction.
    pub evictions: AtomicU64,
}

/// Snapshot of [`CacheStats`] counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStatsSnapshot {
    /// Reads that found an entry with data.
    pub hits: u64,
    /// Reads that found nothing usable.
    pub misses: u64,
    /// Background revalidations triggered by stale reads.
    pub revalidations: u64,
    /// Entries removed by sweep, invalidation, or explicit eviction.
    pub evictions: u64,
}

/// Process-lifetime, in-memory store mapping query keys to their last
/// known result. No disk or cross-session persistence.
pub struct CacheStore {
    entries: RwLock<HashMap<QueryKey, CacheEntry>>,
    policy: CachePolicy,
    stats: CacheStats,
}

impl CacheStore {
    /// Create an empty store with the given policy.
    #[must_use]
    pub fn new(policy: CachePolicy) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            policy,
            stats: CacheStats::default(),
        }
    }

    /// Policy this store was built with.
    #[must_use]
    pub const fn policy(&self) -> CachePolicy {
        self.policy
    }

    /// Read the entry for a key, touching its access time and demoting
    /// fresh data past the freshness window to stale.
    ///
    /// For the stats, a hit is a read that found displayable data. A
    /// pending entry that has never completed is still returned, but
    /// counts as a miss the same as an absent key.
    pub async fn get(&self, key: &QueryKey) -> Option<CacheEntry> {
        let mut entries = self.entries.write().await;
        let Some(entry) = entries.get_mut(key) else {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        entry.last_accessed = Instant::now();
        if entry.state == EntryState::Fresh && entry.age() >= self.policy.freshness_window {
            debug!(key = %key, age_ms = entry.age().as_millis() as u64, "entry aged to stale");
            entry.state = EntryState::Stale;
        }

        if entry.has_data {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
        }
        Some(entry.clone())
    }

    /// Transition a key to pending ahead of a fetch, creating the entry on
    /// first use and keeping any previous records visible during
    /// revalidation.
    pub async fn mark_pending(&self, key: &QueryKey) {
        let mut entries = self.entries.write().await;
        let entry = entries.entry(key.clone()).or_insert_with(CacheEntry::pending);
        entry.state = EntryState::Pending;
    }

    /// Record a successful fetch: refresh the entry in place rather than
    /// replacing it, clear any stored failure, and mark it fresh.
    pub async fn complete(&self, key: &QueryKey, records: Vec<Incident>, total_count: u64) {
        let mut entries = self.entries.write().await;
        let entry = entries.entry(key.clone()).or_insert_with(CacheEntry::pending);
        let now = Instant::now();
        entry.records = records;
        entry.total_count = total_count;
        entry.fetched_at = now;
        entry.last_accessed = now;
        entry.state = EntryState::Fresh;
        entry.error = None;
        entry.has_data = true;
        debug!(key = %key, rows = entry.records.len(), total = total_count, "entry refreshed");
    }

    /// Record a failed fetch. Previously fetched records are kept so a
    /// transient error never erases a good page; only new reads see the
    /// error state.
    pub async fn fail(&self, key: &QueryKey, error: &Error) {
        let mut entries = self.entries.write().await;
        let entry = entries.entry(key.clone()).or_insert_with(CacheEntry::pending);
        entry.state = EntryState::Error;
        entry.error = Some(ErrorInfo::from(error));
    }

    /// Roll back a `mark_pending` whose fetch ended without a result
    /// (cancelled, or its late response was discarded). An entry that
    /// never held data is removed so the next read starts over; an entry
    /// with data drops back to stale so the next read revalidates it.
    pub async fn abandon_pending(&self, key: &QueryKey) {
        let mut entries = self.entries.write().await;
        let Some(entry) = entries.get_mut(key) else {
            return;
        };
        if entry.state != EntryState::Pending {
            return;
        }
        if entry.has_data {
            entry.state = EntryState::Stale;
        } else {
            entries.remove(key);
        }
    }

    /// Count of background revalidations, incremented by the controller
    /// when a stale read kicks one off.
    pub fn note_revalidation(&self) {
        self.stats.revalidations.fetch_add(1, Ordering::Relaxed);
    }

    /// Remove one entry.
    pub async fn evict(&self, key: &QueryKey) {
        if self.entries.write().await.remove(key).is_some() {
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Remove every entry matching the predicate. Used on identity change,
    /// where leaking a prior role's rows would be a correctness bug, and
    /// for forced invalidation after mutations.
    pub async fn invalidate<F>(&self, predicate: F) -> usize
    where
        F: Fn(&QueryKey) -> bool,
    {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|key, _| !predicate(key));
        let removed = before - entries.len();
        if removed > 0 {
            self.stats
                .evictions
                .fetch_add(removed as u64, Ordering::Relaxed);
            info!(removed, "cache entries invalidated");
        }
        removed
    }

    /// Evict entries unread for longer than the retention window.
    pub async fn sweep_expired(&self) -> usize {
        let retention = self.policy.retention_window;
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.last_accessed.elapsed() < retention);
        let removed = before - entries.len();
        if removed > 0 {
            self.stats
                .evictions
                .fetch_add(removed as u64, Ordering::Relaxed);
            debug!(removed, "expired cache entries swept");
        }
        removed
    }

    /// Number of live entries.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Whether the store holds no entries.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Current counter values.
    #[must_use]
    pub fn stats(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            revalidations: self.stats.revalidations.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
        }
    }
}
