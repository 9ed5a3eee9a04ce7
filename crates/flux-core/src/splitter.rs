// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Splitters: nodes that inject new child levels at runtime.

use crate::ident::LevelId;
use crate::product::Products;
use crate::store::{FlushCounts, ProductStore};

/// Handle passed to a splitter's callable.
///
/// The splitter calls [`Generator::make_child`] any number of times; the
/// engine collects the resulting child stores and, once the callable
/// returns, synthesizes the parent-level flush carrying their authoritative
/// count. A splitter that never calls `make_child` still produces a flush
/// with a count of zero — a reduction `over` its level then completes
/// immediately via the empty-input case.
pub struct Generator {
    parent: LevelId,
    level_name: String,
    count: u32,
    children: Vec<ProductStore>,
}

impl Generator {
    pub(crate) fn new(parent: LevelId, level_name: impl Into<String>) -> Self {
        Self {
            parent,
            level_name: level_name.into(),
            count: 0,
            children: Vec::new(),
        }
    }

    /// Creates the `i`-th child under the parent level, carrying `products`.
    ///
    /// `i` need not be contiguous or ordered across calls; it becomes the
    /// child's positional number and is what downstream reductions bucket
    /// contributions by, not the count of calls made so far.
    pub fn make_child(&mut self, i: u32, products: Products) -> LevelId {
        let child_id = self.parent.child(&self.level_name, i);
        self.children.push(ProductStore::process(child_id.clone(), products));
        self.count += 1;
        child_id
    }

    /// Returns the level name this generator's children are created under.
    pub fn level_name(&self) -> &str {
        &self.level_name
    }

    /// Returns the parent level this generator is injecting children below.
    pub fn parent(&self) -> &LevelId {
        &self.parent
    }

    /// Synthesizes the flush for the parent level, authoritative on how many
    /// children were produced. Called by the engine once the splitter's
    /// callable returns; not exposed to user code.
    pub(crate) fn finish(self) -> (Vec<ProductStore>, ProductStore) {
        let mut counts = FlushCounts::new();
        counts.set(self.level_name.clone(), u64::from(self.count));
        let flush = ProductStore::flush(self.parent, counts);
        (self.children, flush)
    }
}
