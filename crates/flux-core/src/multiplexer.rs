// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Multiplexer: routes messages to consumer ports by product name, and
//! flushes to every port that has seen a process message in the same
//! branch of the hierarchy.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::ident::LevelId;
use crate::message::Message;

struct PortState {
    node_name: String,
    /// Ancestors (inclusive) of every process message ever delivered to this
    /// port. A flush at id F is eligible once F appears here: some delivered
    /// message was F itself, or a descendant of F.
    seen_ancestors: FxHashSet<LevelId>,
    /// Flush ids already delivered to this port. A reduction's own
    /// completion re-injects a process-then-flush pair at the very id it
    /// just completed, so the port that fed it (having necessarily seen
    /// that id as an ancestor already) would otherwise be handed the same
    /// flush a second time. Tracked per port, not globally, so a sibling
    /// port seeing this id's flush for the first time is unaffected.
    delivered_flushes: FxHashSet<LevelId>,
}

/// Routes [`Message`]s to registered ports by product name.
///
/// Callers must invoke [`Multiplexer::route`] in strictly increasing
/// `original_id` order; a port's deliveries are only ordered relative to the
/// sequence they were routed in, not re-sorted afterward.
#[derive(Default)]
pub struct Multiplexer {
    ports: Vec<PortState>,
    by_name: FxHashMap<String, usize>,
    by_product: FxHashMap<String, Vec<usize>>,
}

impl Multiplexer {
    /// Creates an empty multiplexer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a consumer port reading the given product names.
    ///
    /// # Panics
    ///
    /// Panics if `node_name` is already registered — this is a construction-
    /// time programmer error, not a runtime condition callers are expected
    /// to recover from.
    pub fn register_port(&mut self, node_name: impl Into<String>, inputs: impl IntoIterator<Item = impl Into<String>>) {
        let node_name = node_name.into();
        assert!(!self.by_name.contains_key(&node_name), "port {node_name:?} already registered");
        let idx = self.ports.len();
        for name in inputs {
            self.by_product.entry(name.into()).or_default().push(idx);
        }
        self.by_name.insert(node_name.clone(), idx);
        self.ports.push(PortState {
            node_name,
            seen_ancestors: FxHashSet::default(),
            delivered_flushes: FxHashSet::default(),
        });
    }

    /// Returns `true` if a port with this name is registered.
    pub fn has_port(&self, node_name: &str) -> bool {
        self.by_name.contains_key(node_name)
    }

    /// Routes `msg`, returning the node names it should be delivered to, in
    /// port-registration order.
    pub fn route(&mut self, msg: &Message) -> Vec<String> {
        if msg.is_flush() {
            self.route_flush(msg)
        } else {
            self.route_process(msg)
        }
    }

    fn route_process(&mut self, msg: &Message) -> Vec<String> {
        let mut targets: FxHashSet<usize> = FxHashSet::default();
        for name in msg.store().products().names() {
            if let Some(idxs) = self.by_product.get(name) {
                targets.extend(idxs.iter().copied());
            }
        }
        if targets.is_empty() {
            return Vec::new();
        }
        let mut ancestors = Vec::new();
        let mut cur = Some(msg.store().id().clone());
        while let Some(a) = cur {
            cur = a.parent().cloned();
            ancestors.push(a);
        }
        let mut sorted: Vec<usize> = targets.into_iter().collect();
        sorted.sort_unstable();
        for &idx in &sorted {
            self.ports[idx].seen_ancestors.extend(ancestors.iter().cloned());
        }
        sorted.into_iter().map(|idx| self.ports[idx].node_name.clone()).collect()
    }

    fn route_flush(&mut self, msg: &Message) -> Vec<String> {
        let id = msg.store().id();
        let mut targets = Vec::new();
        for port in &mut self.ports {
            if port.seen_ancestors.contains(id) && port.delivered_flushes.insert(id.clone()) {
                targets.push(port.node_name.clone());
            }
        }
        targets
    }
}
