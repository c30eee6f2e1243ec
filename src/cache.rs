//! Engine-wide keyed caches with pending/done ownership discipline.
//!
//! Every entry is either `Pending` (exactly one context — the owner — is
//! fetching the value; everyone else waits) or `Done` (the value is published
//! and ownership is released). Waiters block on a single condition that fires
//! on any cache change; a generation counter lets callers re-check without
//! sleeping through updates that happened before they went to sleep.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Condvar, Mutex};

/// Lifecycle of a cache entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PairState {
    Pending,
    Done,
}

struct Pair<V> {
    state: PairState,
    owner: u32,
    value: Option<Arc<V>>,
}

struct Inner<K, V> {
    pairs: HashMap<K, Pair<V>>,
    generation: u64,
}

pub struct Cache<K, V> {
    inner: Mutex<Inner<K, V>>,
    cond: Condvar,
}

impl<K: Eq + Hash + Clone, V> Cache<K, V> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner { pairs: HashMap::new(), generation: 0 }),
            cond: Condvar::new(),
        }
    }

    /// Look the key up, creating a `Pending` entry owned by `ctx_id` if
    /// absent. Returns the entry's state, owner, and value.
    pub fn get_or_create(&self, key: &K, ctx_id: u32) -> (PairState, u32, Option<Arc<V>>) {
        let mut inner = self.inner.lock().unwrap();
        let pair = inner.pairs.entry(key.clone()).or_insert(Pair {
            state: PairState::Pending,
            owner: ctx_id,
            value: None,
        });
        (pair.state, pair.owner, pair.value.clone())
    }

    /// Look the key up without creating anything.
    pub fn lookup(&self, key: &K) -> Option<(PairState, u32, Option<Arc<V>>)> {
        let inner = self.inner.lock().unwrap();
        inner
            .pairs
            .get(key)
            .map(|pair| (pair.state, pair.owner, pair.value.clone()))
    }

    /// Publish a value: the entry becomes `Done`, ownership is released, and
    /// all waiters are woken.
    pub fn put_done(&self, key: &K, value: Arc<V>) {
        let mut inner = self.inner.lock().unwrap();
        inner.pairs.insert(
            key.clone(),
            Pair { state: PairState::Done, owner: 0, value: Some(value) },
        );
        inner.generation += 1;
        self.cond.notify_all();
    }

    /// Remove a single pending entry if `ctx_id` owns it.
    pub fn remove_pending(&self, key: &K, ctx_id: u32) {
        let mut inner = self.inner.lock().unwrap();
        let owned = matches!(
            inner.pairs.get(key),
            Some(pair) if pair.state == PairState::Pending && pair.owner == ctx_id
        );
        if owned {
            inner.pairs.remove(key);
            inner.generation += 1;
            self.cond.notify_all();
        }
    }

    /// Remove every pending entry owned by `ctx_id` (context teardown).
    /// Published entries persist; waiters are woken to re-enter the protocol.
    pub fn remove_by_owner(&self, ctx_id: u32) {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.pairs.len();
        inner
            .pairs
            .retain(|_, pair| !(pair.state == PairState::Pending && pair.owner == ctx_id));
        if inner.pairs.len() != before {
            inner.generation += 1;
            self.cond.notify_all();
        }
    }

    /// Snapshot the change counter for a later [`wait_until_changed`] call.
    ///
    /// [`wait_until_changed`]: Cache::wait_until_changed
    pub fn generation(&self) -> u64 {
        self.inner.lock().unwrap().generation
    }

    /// Block until the cache has changed since the snapshot was taken.
    /// Returns immediately if it already has.
    pub fn wait_until_changed(&self, generation: u64) {
        let mut inner = self.inner.lock().unwrap();
        while inner.generation == generation {
            inner = self.cond.wait(inner).unwrap();
        }
    }
}

impl<K: Eq + Hash + Clone, V> Default for Cache<K, V> {
    fn default() -> Self {
        Self::new()
    }
}
