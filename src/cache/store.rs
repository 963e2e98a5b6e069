//! Key-addressed cache storage.
//!
//! One [`CacheStore`] holds every resource family. Entries and the pending
//! fetch tickets share a single lock, so an invalidation and the completion of
//! a fetch for the same key are always observed in one order or the other.

use std::collections::HashMap;
use std::sync::RwLock;

use metrics::counter;
use tokio::time::Instant;
use tracing::debug;

use super::entry::{CacheEntry, EntryStatus, StalenessPolicy};
use super::keys::CacheKey;
use super::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::store";
pub(crate) const METRIC_CACHE_EVICT_TOTAL: &str = "catalog_cache_evict_total";

/// Handle for a fetch that will write its result back through
/// [`CacheStore::complete_fetch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchTicket {
    key: CacheKey,
    id: u64,
}

impl FetchTicket {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }
}

/// How a completed fetch landed in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Stored as a fresh entry.
    Stored,
    /// An invalidation arrived while the fetch was running; stored as stale.
    Superseded,
}

#[derive(Debug)]
struct PendingFetch {
    id: u64,
    superseded: bool,
}

#[derive(Debug)]
struct StoreState<V> {
    entries: HashMap<CacheKey, CacheEntry<V>>,
    pending: HashMap<CacheKey, PendingFetch>,
    next_ticket: u64,
}

impl<V> StoreState<V> {
    fn supersede_pending(&mut self, key: &CacheKey) {
        if let Some(pending) = self.pending.get_mut(key) {
            pending.superseded = true;
        }
    }
}

/// In-memory store of cache entries with staleness metadata.
#[derive(Debug)]
pub struct CacheStore<V> {
    state: RwLock<StoreState<V>>,
}

impl<V> Default for CacheStore<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> CacheStore<V> {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(StoreState {
                entries: HashMap::new(),
                pending: HashMap::new(),
                next_ticket: 0,
            }),
        }
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Create or overwrite an entry; `fetched_at` is reset to now.
    pub fn set(&self, key: CacheKey, value: V, policy: StalenessPolicy) {
        let entry = CacheEntry::new(value, policy, Instant::now());
        rw_write(&self.state, SOURCE, "set")
            .entries
            .insert(key, entry);
    }

    /// Remove one entry. Absent keys are a no-op. Returns the number removed.
    pub fn invalidate(&self, key: &CacheKey) -> usize {
        let mut state = rw_write(&self.state, SOURCE, "invalidate");
        state.supersede_pending(key);
        let removed = usize::from(state.entries.remove(key).is_some());
        drop(state);

        if removed > 0 {
            counter!(METRIC_CACHE_EVICT_TOTAL, "reason" => "invalidate").increment(1);
        }
        debug!(key = %key, removed, "Cache key invalidated");
        removed
    }

    /// Remove every entry whose key satisfies `predicate`.
    ///
    /// Pending fetches for matching keys are superseded even when no entry
    /// exists yet, so a first load racing an invalidation still lands stale.
    pub fn invalidate_where<F>(&self, predicate: F) -> usize
    where
        F: Fn(&CacheKey) -> bool,
    {
        let mut state = rw_write(&self.state, SOURCE, "invalidate_where");
        let StoreState {
            entries, pending, ..
        } = &mut *state;

        for (key, fetch) in pending.iter_mut() {
            if predicate(key) {
                fetch.superseded = true;
            }
        }

        let before = entries.len();
        entries.retain(|key, _| !predicate(key));
        let removed = before - entries.len();
        drop(state);

        if removed > 0 {
            counter!(METRIC_CACHE_EVICT_TOTAL, "reason" => "invalidate").increment(removed as u64);
        }
        removed
    }

    /// Drop every entry past its hard expiry.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut state = rw_write(&self.state, SOURCE, "sweep_expired");
        let before = state.entries.len();
        state
            .entries
            .retain(|_, entry| entry.status(now) != EntryStatus::Expired);
        let removed = before - state.entries.len();
        drop(state);

        if removed > 0 {
            counter!(METRIC_CACHE_EVICT_TOTAL, "reason" => "expired").increment(removed as u64);
            debug!(removed, "Expired cache entries swept");
        }
        removed
    }

    /// Demote an entry to stale. Returns false when the key is absent.
    pub fn mark_stale(&self, key: &CacheKey) -> bool {
        let mut state = rw_write(&self.state, SOURCE, "mark_stale");
        match state.entries.get_mut(key) {
            Some(entry) => {
                entry.mark_stale();
                true
            }
            None => false,
        }
    }

    pub fn clear(&self) {
        let mut state = rw_write(&self.state, SOURCE, "clear");
        for pending in state.pending.values_mut() {
            pending.superseded = true;
        }
        state.entries.clear();
    }

    // ========================================================================
    // Fetch tickets
    // ========================================================================

    /// Register a fetch for `key`. Invalidations from here on supersede it.
    pub fn begin_fetch(&self, key: &CacheKey) -> FetchTicket {
        let mut state = rw_write(&self.state, SOURCE, "begin_fetch");
        state.next_ticket += 1;
        let id = state.next_ticket;
        state.pending.insert(
            key.clone(),
            PendingFetch {
                id,
                superseded: false,
            },
        );
        FetchTicket {
            key: key.clone(),
            id,
        }
    }

    /// Write a fetch result. A superseded ticket stores the value as stale so
    /// the next read revalidates again.
    pub fn complete_fetch(
        &self,
        ticket: &FetchTicket,
        value: V,
        policy: StalenessPolicy,
    ) -> Completion {
        let mut state = rw_write(&self.state, SOURCE, "complete_fetch");
        let pending = state
            .pending
            .get(&ticket.key)
            .map(|pending| (pending.id, pending.superseded));
        let superseded = match pending {
            Some((id, superseded)) if id == ticket.id => {
                state.pending.remove(&ticket.key);
                superseded
            }
            // A newer fetch owns the key now; this result is already outdated.
            Some(_) => true,
            None => false,
        };

        let mut entry = CacheEntry::new(value, policy, Instant::now());
        if superseded {
            entry.mark_stale();
        }
        state.entries.insert(ticket.key.clone(), entry);

        if superseded {
            Completion::Superseded
        } else {
            Completion::Stored
        }
    }

    /// Forget a ticket without writing anything. Safe to call after completion.
    pub fn abandon_fetch(&self, ticket: &FetchTicket) {
        let mut state = rw_write(&self.state, SOURCE, "abandon_fetch");
        if state
            .pending
            .get(&ticket.key)
            .is_some_and(|pending| pending.id == ticket.id)
        {
            state.pending.remove(&ticket.key);
        }
    }

    pub fn has_pending_fetch(&self, key: &CacheKey) -> bool {
        rw_read(&self.state, SOURCE, "has_pending_fetch")
            .pending
            .contains_key(key)
    }

    // ========================================================================
    // Reads
    // ========================================================================

    pub fn len(&self) -> usize {
        rw_read(&self.state, SOURCE, "len").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<CacheKey> {
        rw_read(&self.state, SOURCE, "keys")
            .entries
            .keys()
            .cloned()
            .collect()
    }

    /// Current status of `key`, or `None` when nothing is stored.
    pub fn status(&self, key: &CacheKey) -> Option<EntryStatus> {
        let now = Instant::now();
        rw_read(&self.state, SOURCE, "status")
            .entries
            .get(key)
            .map(|entry| entry.status(now))
    }
}

impl<V: Clone> CacheStore<V> {
    /// Pure lookup. Expired entries are reported as absent.
    pub fn get(&self, key: &CacheKey) -> Option<CacheEntry<V>> {
        let now = Instant::now();
        rw_read(&self.state, SOURCE, "get")
            .entries
            .get(key)
            .filter(|entry| entry.status(now) != EntryStatus::Expired)
            .cloned()
    }

    /// Lookup that also returns expired entries still awaiting the sweep.
    pub fn peek(&self, key: &CacheKey) -> Option<CacheEntry<V>> {
        rw_read(&self.state, SOURCE, "peek")
            .entries
            .get(key)
            .cloned()
    }
}
