// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Reduction engine: per-ancestor accumulator buckets, completed once both
//! their flush has been observed and every contribution has arrived.

use std::sync::Mutex;

use rustc_hash::FxHashMap;

use crate::error::FlowError;
use crate::ident::LevelId;
use crate::message::OriginalId;
use crate::node::{CombineFn, InitFn, ReductionState};
use crate::product::Product;
use crate::store::FlushCounts;

const SHARD_COUNT: usize = 64;

struct Bucket {
    accumulator: ReductionState,
    contrib_count: u64,
    expected_count: Option<u64>,
    flushed: bool,
    terminal_original_id: Option<OriginalId>,
}

/// A reduction that has received its terminating flush and its full
/// complement of contributions, ready to be emitted.
pub struct CompletedReduction {
    /// The parent level the reduction completed at.
    pub id: LevelId,
    /// The final accumulator value, to be wrapped as the output product.
    pub accumulator: ReductionState,
    /// `original_id` to stamp on the reduction's own emitted flush, matching
    /// the flush that triggered completion.
    pub terminal_original_id: OriginalId,
}

type BucketKey = (String, LevelId);

/// Sharded map of reduction buckets, keyed by `(node_name, parent_id)`.
#[derive(Default)]
pub struct ReductionEngine {
    shards: Vec<Mutex<FxHashMap<BucketKey, Bucket>>>,
}

impl ReductionEngine {
    /// Creates an empty engine.
    pub fn new() -> Self {
        let shards = (0..SHARD_COUNT).map(|_| Mutex::new(FxHashMap::default())).collect();
        Self { shards }
    }

    fn shard_for(&self, id: &LevelId) -> &Mutex<FxHashMap<BucketKey, Bucket>> {
        let idx = (id.positional_hash() as usize) & (SHARD_COUNT - 1);
        &self.shards[idx]
    }

    /// Folds one contribution into the bucket for the nearest ancestor of
    /// `id` named `over_level`. A no-op if no such ancestor exists — e.g. a
    /// store several levels removed from any ancestor at `over_level` still
    /// routes to this node by product name, but contributes nothing to it.
    ///
    /// Returns `(folded, completed)`: `folded` is `true` only when an
    /// ancestor at `over_level` existed and the accumulator was actually
    /// updated — callers use this to decide whether the invocation counts as
    /// a real reduction run. `completed` carries the finished reduction if
    /// this contribution was the last one a previously-observed flush was
    /// waiting on.
    pub fn contribute(
        &self,
        node_name: &str,
        over_level: &str,
        init: &InitFn,
        combine: &CombineFn,
        id: &LevelId,
        contribution: &[&Product],
    ) -> (bool, Option<CompletedReduction>) {
        let Some(ancestor) = id.ancestor_at_level(over_level) else {
            return (false, None);
        };
        let key: BucketKey = (node_name.to_string(), ancestor.clone());
        let shard = self.shard_for(&ancestor);
        let mut guard = shard.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let bucket = guard.entry(key.clone()).or_insert_with(|| Bucket {
            accumulator: init(),
            contrib_count: 0,
            expected_count: None,
            flushed: false,
            terminal_original_id: None,
        });
        combine(&mut bucket.accumulator, contribution);
        bucket.contrib_count += 1;
        if bucket.flushed && bucket.expected_count == Some(bucket.contrib_count) {
            let Some(bucket) = guard.remove(&key) else {
                unreachable!("key was just looked up via entry() above")
            };
            return (
                true,
                Some(CompletedReduction {
                    id: ancestor,
                    accumulator: bucket.accumulator,
                    terminal_original_id: bucket.terminal_flush_id(),
                }),
            );
        }
        (true, None)
    }

    /// Observes a flush at `flush_id`. A no-op unless `flush_id`'s own level
    /// name is `over_level` — every other flush passes through irrelevant to
    /// this reduction.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::UnexpectedFlush`] if a flush for this parent was
    /// already observed.
    pub fn observe_flush(
        &self,
        node_name: &str,
        over_level: &str,
        init: &InitFn,
        flush_id: &LevelId,
        flush_original_id: OriginalId,
        flush_counts: Option<&FlushCounts>,
    ) -> Result<Option<CompletedReduction>, FlowError> {
        if flush_id.level_name() != over_level {
            return Ok(None);
        }
        let key: BucketKey = (node_name.to_string(), flush_id.clone());
        let shard = self.shard_for(flush_id);
        let mut guard = shard.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let bucket = guard.entry(key.clone()).or_insert_with(|| Bucket {
            accumulator: init(),
            contrib_count: 0,
            expected_count: None,
            flushed: false,
            terminal_original_id: None,
        });
        if bucket.flushed {
            return Err(FlowError::UnexpectedFlush(flush_id.clone()));
        }
        bucket.flushed = true;
        bucket.expected_count = Some(flush_counts.map(FlushCounts::total).unwrap_or(0));
        bucket.terminal_original_id = Some(flush_original_id);
        if bucket.expected_count == Some(bucket.contrib_count) {
            let Some(bucket) = guard.remove(&key) else {
                unreachable!("key was just looked up via entry() above")
            };
            return Ok(Some(CompletedReduction {
                id: flush_id.clone(),
                accumulator: bucket.accumulator,
                terminal_original_id: bucket.terminal_flush_id(),
            }));
        }
        Ok(None)
    }

    /// Returns a [`FlowError::CountMismatch`] for every bucket still open
    /// for `node_name` — called once the source is exhausted and no further
    /// contributions or flushes can ever arrive.
    pub fn drain_incomplete(&self, node_name: &str) -> Vec<FlowError> {
        let mut errors = Vec::new();
        for shard in &self.shards {
            let mut guard = shard.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            guard.retain(|(name, id), bucket| {
                if name != node_name {
                    return true;
                }
                errors.push(FlowError::CountMismatch {
                    node: name.clone(),
                    id: id.clone(),
                    expected: bucket.expected_count.unwrap_or(0),
                    actual: bucket.contrib_count,
                });
                false
            });
        }
        errors
    }
}

impl Bucket {
    fn terminal_flush_id(&self) -> OriginalId {
        self.terminal_original_id.unwrap_or(OriginalId::from_raw(0))
    }
}
