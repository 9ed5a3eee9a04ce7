// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Sharded concurrent map from [`LevelId`] to its [`ProductStore`] entries.
//!
//! Bucket-sharded rather than a single global lock: the shard index is a
//! cheap mask over the id's positional hash, so unrelated levels rarely
//! contend, matching the bucket-lock discipline the host family already
//! uses for its active-footprint tracking.

use rustc_hash::FxHashMap;
use std::sync::Mutex;

use crate::error::FlowError;
use crate::ident::LevelId;
use crate::store::{ProductStore, Stage};

const SHARD_COUNT: usize = 64;

#[derive(Default)]
struct Entry {
    process: Option<ProductStore>,
    flush: Option<ProductStore>,
}

/// Maps [`LevelId`] to its (at most one process, at most one flush) stores.
pub struct StoreCache {
    shards: Vec<Mutex<FxHashMap<LevelId, Entry>>>,
}

impl Default for StoreCache {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        let shards = (0..SHARD_COUNT).map(|_| Mutex::new(FxHashMap::default())).collect();
        Self { shards }
    }

    fn shard_for(&self, id: &LevelId) -> &Mutex<FxHashMap<LevelId, Entry>> {
        let idx = (id.positional_hash() as usize) & (SHARD_COUNT - 1);
        &self.shards[idx]
    }

    /// Returns the process store for `id`, creating an empty one if absent.
    pub fn get_or_create(&self, id: &LevelId) -> ProductStore {
        let shard = self.shard_for(id);
        let mut guard = shard.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let entry = guard.entry(id.clone()).or_default();
        entry
            .process
            .get_or_insert_with(|| ProductStore::empty(id.clone(), Stage::Process))
            .clone()
    }

    /// Inserts `store` as the process store for its id.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::UnexpectedFlush`] only in the degenerate case of
    /// re-inserting a process store for an id whose flush has already been
    /// recorded (the cache should have been evicted first).
    pub fn put_process(&self, store: ProductStore) -> Result<(), FlowError> {
        let id = store.id().clone();
        let shard = self.shard_for(&id);
        let mut guard = shard.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let entry = guard.entry(id.clone()).or_default();
        if entry.flush.is_some() {
            return Err(FlowError::UnexpectedFlush(id));
        }
        entry.process = Some(store);
        Ok(())
    }

    /// Records the flush store for `id`.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::UnexpectedFlush`] if a flush for this id was
    /// already recorded.
    pub fn put_flush(&self, store: ProductStore) -> Result<(), FlowError> {
        let id = store.id().clone();
        let shard = self.shard_for(&id);
        let mut guard = shard.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let entry = guard.entry(id.clone()).or_default();
        if entry.flush.is_some() {
            return Err(FlowError::UnexpectedFlush(id));
        }
        entry.flush = Some(store);
        Ok(())
    }

    /// Returns `true` if a flush has been recorded for `id`.
    pub fn has_flush(&self, id: &LevelId) -> bool {
        let shard = self.shard_for(id);
        let guard = shard.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        guard.get(id).is_some_and(|e| e.flush.is_some())
    }

    /// Evicts the entry for `id`, e.g. after its flush has fully propagated.
    pub fn drop_entry(&self, id: &LevelId) {
        let shard = self.shard_for(id);
        let mut guard = shard.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        guard.remove(id);
    }

    /// Returns `true` if `id` has no recorded entry.
    pub fn is_empty_for(&self, id: &LevelId) -> bool {
        let shard = self.shard_for(id);
        let guard = shard.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        !guard.contains_key(id)
    }
}
