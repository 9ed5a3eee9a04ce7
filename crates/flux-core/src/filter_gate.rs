// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! FilterGate: per-filter, per-`LevelId` boolean decision bookkeeping.
//!
//! A consumer declared `preceded_by = [F1, F2, …]` is delivered a process
//! message only once every listed filter has decided `true` for that id (or
//! its nearest decided ancestor); if any has decided `false`, delivery is
//! skipped. An undecided filter buffers the delivery until a decision
//! arrives — at the latest, when the id's own flush arrives, since no
//! further process messages for that id can ever arrive after it.

use rustc_hash::FxHashMap;

use crate::ident::LevelId;

/// Decision bookkeeping for a single filter.
#[derive(Default)]
struct Gate {
    decisions: FxHashMap<LevelId, bool>,
}

impl Gate {
    fn record(&mut self, id: LevelId, decision: bool) {
        self.decisions.insert(id, decision);
    }

    /// Returns the decision at `id` or its nearest decided ancestor.
    fn decision_for(&self, id: &LevelId) -> Option<bool> {
        let mut cur = Some(id.clone());
        while let Some(a) = cur {
            if let Some(&d) = self.decisions.get(&a) {
                return Some(d);
            }
            cur = a.parent().cloned();
        }
        None
    }
}

/// Outcome of checking a process message against a set of preceding filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    /// Every required filter decided `true`; deliver.
    Deliver,
    /// At least one required filter decided `false`; skip, no error.
    Skip,
    /// At least one required filter has not yet decided; buffer and retry
    /// once more decisions are recorded.
    Buffer,
}

/// Owns one [`Gate`] per registered filter name.
#[derive(Default)]
pub struct FilterGateRegistry {
    gates: FxHashMap<String, Gate>,
}

impl FilterGateRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `decision` for `filter_name` at `id`.
    pub fn record_decision(&mut self, filter_name: &str, id: LevelId, decision: bool) {
        self.gates.entry(filter_name.to_string()).or_default().record(id, decision);
    }

    /// Checks a process message at `id` against every filter in `required`.
    pub fn check(&self, required: &[String], id: &LevelId) -> GateDecision {
        for name in required {
            match self.gates.get(name).and_then(|g| g.decision_for(id)) {
                Some(false) => return GateDecision::Skip,
                Some(true) => {}
                None => return GateDecision::Buffer,
            }
        }
        GateDecision::Deliver
    }

    /// Resolves any still-undecided filter in `required` at `id` to `false`,
    /// as required once a flush for `id` arrives (no process message for
    /// this id can arrive after its own flush). Returns `true` if the flush
    /// should carry the suppression flag — i.e. any required filter's final
    /// decision (existing or just resolved) was `false`.
    pub fn resolve_for_flush(&mut self, required: &[String], id: &LevelId) -> bool {
        let mut suppressed = false;
        for name in required {
            let gate = self.gates.entry(name.clone()).or_default();
            let decision = gate.decision_for(id).unwrap_or_else(|| {
                gate.record(id.clone(), false);
                false
            });
            if !decision {
                suppressed = true;
            }
        }
        suppressed
    }
}
