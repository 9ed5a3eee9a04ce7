// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Sources: a pull-based stream of process stores, with engine-synthesized
//! flushes interleaved between them.

use std::collections::VecDeque;

use rustc_hash::FxHashMap;

use crate::ident::LevelId;
use crate::message::{Message, OriginalIdSequence};
use crate::store::{FlushCounts, ProductStore};

/// A finite, ordered stream of process stores.
///
/// Implementors need only produce stores in depth-first, ancestor-before-
/// descendant, left-to-right order; [`SourceDriver`] is responsible for
/// noticing when a level's children are exhausted and synthesizing the
/// corresponding flush.
pub trait Source: Send {
    /// Returns the next store, or `None` at end of stream.
    fn next_store(&mut self) -> Option<ProductStore>;
}

/// A [`Source`] backed by a pre-built, in-memory vector of stores.
pub struct VecSource {
    stores: VecDeque<ProductStore>,
}

impl VecSource {
    /// Creates a source that replays `stores` in order.
    pub fn new(stores: impl IntoIterator<Item = ProductStore>) -> Self {
        Self {
            stores: stores.into_iter().collect(),
        }
    }
}

impl Source for VecSource {
    fn next_store(&mut self) -> Option<ProductStore> {
        self.stores.pop_front()
    }
}

fn chain_from_root(id: &LevelId) -> Vec<LevelId> {
    let mut out = Vec::with_capacity(id.depth() as usize + 1);
    let mut cur = Some(id.clone());
    while let Some(level) = cur {
        cur = level.parent().cloned();
        out.push(level);
    }
    out.reverse();
    out
}

fn common_prefix_len(a: &[LevelId], b: &[LevelId]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| *x == *y).count()
}

/// Wraps a [`Source`], synthesizing a flush at each level as soon as the
/// stream moves on to a sibling or ascends past it, and at end of stream for
/// every level still open.
///
/// This is the only place flush tokens are created: a [`Source`] emits only
/// `process` stores, and this driver interleaves the barriers per §6.
pub struct SourceDriver<S> {
    source: S,
    seq: OriginalIdSequence,
    prev_chain: Vec<LevelId>,
    child_counts: FxHashMap<LevelId, FlushCounts>,
    pending: VecDeque<ProductStore>,
    source_exhausted: bool,
}

impl<S: Source> SourceDriver<S> {
    /// Wraps `source`, starting emission order at `1`.
    pub fn new(source: S) -> Self {
        Self {
            source,
            seq: OriginalIdSequence::new(),
            prev_chain: Vec::new(),
            child_counts: FxHashMap::default(),
            pending: VecDeque::new(),
            source_exhausted: false,
        }
    }

    /// Closes `closing`, rolling its cumulative leaf counts up into its
    /// parent and emitting its own flush.
    ///
    /// A level with no recorded children is itself a leaf of its own level
    /// name — it contributes `{level_name: 1}` upward. A level that already
    /// accumulated counts from its own children passes those counts through
    /// unchanged, so a reduction several levels above the leaves (e.g. a
    /// "job" reduction fed directly by "event" and "primitive" leaves several
    /// levels down) still gets an authoritative total, not just a count of
    /// its own direct children.
    fn close_level(&mut self, closing: LevelId) {
        let sub_counts = self.child_counts.remove(&closing).unwrap_or_default();
        let own_counts = if sub_counts.is_empty() {
            let mut m = FlushCounts::new();
            m.set(closing.level_name().to_string(), 1);
            m
        } else {
            sub_counts
        };
        if let Some(parent) = closing.parent() {
            self.child_counts.entry(parent.clone()).or_default().merge(&own_counts);
        }
        self.pending.push_back(ProductStore::flush(closing, own_counts));
    }

    fn record_arrival(&mut self, chain: &[LevelId]) {
        let common = common_prefix_len(&self.prev_chain, chain);
        for i in (common.max(1)..self.prev_chain.len()).rev() {
            let closing = self.prev_chain[i].clone();
            self.close_level(closing);
        }
        self.prev_chain = chain.to_vec();
    }

    fn close_remaining(&mut self) {
        for i in (1..self.prev_chain.len()).rev() {
            let closing = self.prev_chain[i].clone();
            self.close_level(closing);
        }
        self.prev_chain.clear();
    }

    /// Returns the next message (process or synthesized flush), or `None`
    /// once the source is exhausted and every open level has been flushed.
    pub fn next_message(&mut self) -> Option<Message> {
        loop {
            if let Some(store) = self.pending.pop_front() {
                return Some(Message::new(store, self.seq.next()));
            }
            if self.source_exhausted {
                return None;
            }
            match self.source.next_store() {
                Some(store) => {
                    let chain = chain_from_root(store.id());
                    self.record_arrival(&chain);
                    return Some(Message::new(store, self.seq.next()));
                }
                None => {
                    self.source_exhausted = true;
                    self.close_remaining();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::product::Products;

    fn leaf(job: u32, run: u32, event: u32, number: i64) -> ProductStore {
        let mut p = Products::new();
        p.insert("number", number);
        let id = LevelId::root().child("job", job).child("run", run).child("event", event);
        ProductStore::process(id, p)
    }

    #[test]
    fn two_level_stream_synthesizes_flushes_at_run_and_job_boundaries() {
        let stores = vec![
            leaf(0, 0, 0, 0),
            leaf(0, 0, 1, 1),
            leaf(0, 1, 0, 2),
            leaf(0, 1, 1, 3),
        ];
        let mut driver = SourceDriver::new(VecSource::new(stores));

        let mut kinds = Vec::new();
        while let Some(msg) = driver.next_message() {
            kinds.push((msg.is_flush(), msg.store().id().depth()));
        }

        // 4 process stores, plus a flush for every level closed on the way:
        // each event (4), each run (2), and the job itself (1) = 7 flushes.
        let flushes: Vec<_> = kinds.iter().filter(|(is_flush, _)| *is_flush).collect();
        assert_eq!(flushes.len(), 7);
        assert_eq!(kinds.len(), 11);
    }

    #[test]
    fn flush_counts_reflect_direct_children_seen() {
        let stores = vec![leaf(0, 0, 0, 0), leaf(0, 0, 1, 1), leaf(0, 1, 0, 2)];
        let mut driver = SourceDriver::new(VecSource::new(stores));

        let mut run0_flush_counts = None;
        while let Some(msg) = driver.next_message() {
            if msg.is_flush() && msg.store().id().level_name() == "run" && msg.store().id().number() == Some(0) {
                run0_flush_counts = msg.store().flush_counts().and_then(|c| c.get("event"));
            }
        }
        assert_eq!(run0_flush_counts, Some(2));
    }

    #[test]
    fn empty_source_yields_no_messages() {
        let mut driver = SourceDriver::new(VecSource::new(Vec::new()));
        assert!(driver.next_message().is_none());
    }
}
