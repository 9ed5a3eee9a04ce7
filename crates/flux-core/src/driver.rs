// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The graph driver: registration, validation, the scheduling loop, and
//! introspection.
//!
//! A [`Driver`] owns the registered [`NodeDescriptor`]s and drives a
//! [`Source`] through them: routing by product name, gating by filter
//! decision, reducing along hierarchy levels, and letting splitters inject
//! new child levels at runtime. Execution is sequential at the message
//! level — the queue is drained one message at a time, preserving the
//! caller's own `route()` order — but every target a single message fans
//! out to runs through [`crate::scheduler::execute_parallel`], so a wide
//! fan-out (many ports reacting to the same product) still uses the
//! configured worker pool.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use rustc_hash::{FxHashMap, FxHashSet};

use crate::error::{FlowError, FlowResult};
use crate::filter_gate::{FilterGateRegistry, GateDecision};
use crate::ident::LevelId;
use crate::message::Message;
use crate::multiplexer::Multiplexer;
use crate::node::{Concurrency, NodeDescriptor, NodeKind};
use crate::product::{Product, Products};
use crate::reduction::{CompletedReduction, ReductionEngine};
use crate::scheduler;
use crate::source::{Source, SourceDriver};
use crate::splitter::Generator;
use crate::store::{FlushCounts, ProductStore};
use crate::store_cache::StoreCache;
use crate::telemetry::{NullTelemetrySink, TelemetrySink};

/// Construction parameters for a [`Driver`], mirroring the host family's
/// `EngineBuilder` pattern: a handful of tuning knobs with sane defaults,
/// set via chained methods rather than a constructor with many arguments.
pub struct EngineConfig {
    max_parallelism: usize,
    telemetry: Arc<dyn TelemetrySink>,
}

impl std::fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineConfig")
            .field("max_parallelism", &self.max_parallelism)
            .finish_non_exhaustive()
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallelism: scheduler::default_parallelism(),
            telemetry: Arc::new(NullTelemetrySink),
        }
    }
}

impl EngineConfig {
    /// Creates a config with default parallelism and a [`NullTelemetrySink`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Caps the number of worker threads used to fan a single message out
    /// across its simultaneously-ready targets.
    #[must_use]
    pub fn max_parallelism(mut self, workers: usize) -> Self {
        self.max_parallelism = workers.max(1);
        self
    }

    /// Installs a telemetry sink observing node starts, finishes, resource
    /// conflicts, and flush arrivals.
    #[must_use]
    pub fn telemetry(mut self, sink: impl TelemetrySink + 'static) -> Self {
        self.telemetry = Arc::new(sink);
        self
    }
}

/// What a node's callable produced, carried back across the worker pool
/// boundary so the driving thread can fold it into the message queue.
enum Outcome {
    /// Monitors and non-completing reductions/flushes produce nothing new.
    None,
    /// A filter's gating decision for the triggering `LevelId`.
    Filter(bool),
    /// New `(product_name, value)` pairs to inject at the triggering id.
    Transform(Vec<(String, Product)>),
    /// New child stores plus the parent-level flush closing them.
    Splitter(Vec<ProductStore>, ProductStore),
    /// A reduction contribution or flush observation. `folded` is `false`
    /// only for a process-path contribution that found no ancestor at the
    /// reduction's `over` level — a no-op that must not count as a run of
    /// the node. Flush observations always report `folded: true`, since
    /// they never bump the execution counter regardless.
    Reduction { folded: bool, completed: Option<CompletedReduction> },
}

/// Mutable state for a single [`Driver::execute`] run. Rebuilt fresh on
/// every call so a `Driver` can be reused across independent runs.
struct ExecState {
    multiplexer: Multiplexer,
    filter_gates: FilterGateRegistry,
    reductions: ReductionEngine,
    store_cache: StoreCache,
    resource_locks: FxHashMap<String, Mutex<()>>,
    /// Ids whose terminal flush was already synthesized by a splitter —
    /// the source's own natural flush for the same id, arriving later, is
    /// shadowed rather than delivered a second time. See `DESIGN.md`.
    synthesized_flush_ids: FxHashSet<LevelId>,
    telemetry: Arc<dyn TelemetrySink>,
}

impl ExecState {
    fn new(nodes: &[NodeDescriptor], telemetry: Arc<dyn TelemetrySink>) -> Self {
        let mut multiplexer = Multiplexer::new();
        let mut resource_locks: FxHashMap<String, Mutex<()>> = FxHashMap::default();
        for node in nodes {
            multiplexer.register_port(node.name(), node.inputs().iter().cloned());
            if let Concurrency::Serial(resources) = node.concurrency() {
                for resource in resources {
                    resource_locks.entry(resource.clone()).or_insert_with(|| Mutex::new(()));
                }
            }
        }
        Self {
            multiplexer,
            filter_gates: FilterGateRegistry::new(),
            reductions: ReductionEngine::new(),
            store_cache: StoreCache::new(),
            resource_locks,
            synthesized_flush_ids: FxHashSet::default(),
            telemetry,
        }
    }
}

/// Owns a registered graph of nodes and drives a [`Source`] through it.
///
/// Registration (`register`) and execution (`execute`) are separate
/// phases: register every node, then call `execute` once with the
/// `Source` to run. A `Driver` may be executed more than once — each call
/// rebuilds its routing, gating, and reduction state from scratch.
pub struct Driver {
    nodes: Vec<NodeDescriptor>,
    config: EngineConfig,
    index: FxHashMap<String, usize>,
    counts: Vec<AtomicU64>,
}

impl Driver {
    /// Creates an empty driver with the given configuration.
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        Self {
            nodes: Vec::new(),
            config,
            index: FxHashMap::default(),
            counts: Vec::new(),
        }
    }

    /// Registers a node descriptor. Duplicate names and other structural
    /// problems are reported together when `execute` is called, not here.
    pub fn register(&mut self, node: NodeDescriptor) -> &mut Self {
        self.nodes.push(node);
        self
    }

    /// Runs `source` to completion.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::Registration`] if the graph has structural
    /// problems (duplicate names, under-declared reductions or splitters,
    /// a `preceded_by` referencing an unregistered filter, or a cycle in
    /// the product-name dependency graph) — every problem found is
    /// aggregated into the one error. Returns [`FlowError::UnexpectedFlush`]
    /// or [`FlowError::CountMismatch`] if a reduction observes a
    /// structurally impossible sequence of contributions and flushes.
    pub fn execute<S: Source>(&mut self, source: S) -> FlowResult<()> {
        let problems = self.validate();
        if !problems.is_empty() {
            return Err(FlowError::Registration(problems));
        }

        self.index = self.nodes.iter().enumerate().map(|(i, n)| (n.name().to_string(), i)).collect();
        self.counts = self.nodes.iter().map(|_| AtomicU64::new(0)).collect();

        let mut state = ExecState::new(&self.nodes, Arc::clone(&self.config.telemetry));
        let mut source_driver = SourceDriver::new(source);
        let mut queue: VecDeque<Message> = VecDeque::new();
        let mut pending: Vec<(String, Message)> = Vec::new();

        loop {
            if queue.is_empty() {
                let Some(msg) = Self::next_unshadowed(&mut source_driver, &mut state) else {
                    break;
                };
                queue.push_back(msg);
            }
            let Some(msg) = queue.pop_front() else {
                break;
            };
            self.dispatch(&mut state, msg, &mut queue, &mut pending)?;
        }

        for node in &self.nodes {
            if matches!(node.kind(), NodeKind::Reduction { .. }) {
                if let Some(first) = state.reductions.drain_incomplete(node.name()).into_iter().next() {
                    return Err(first);
                }
            }
        }

        Ok(())
    }

    /// Pulls the next message straight from the source, dropping a
    /// source-synthesized flush that a splitter already emitted for the
    /// same id.
    fn next_unshadowed<S: Source>(source_driver: &mut SourceDriver<S>, state: &mut ExecState) -> Option<Message> {
        loop {
            let msg = source_driver.next_message()?;
            if msg.is_flush() && state.synthesized_flush_ids.remove(msg.store().id()) {
                continue;
            }
            return Some(msg);
        }
    }

    /// Returns the number of times `node_name`'s callable has run so far
    /// (or over the whole of the last completed `execute`). Flush
    /// observations and reduction completions are not counted, only the
    /// underlying node invocations that produced them.
    #[must_use]
    pub fn execution_count(&self, node_name: &str) -> u64 {
        self.index
            .get(node_name)
            .map_or(0, |&idx| self.counts[idx].load(Ordering::Relaxed))
    }

    /// Renders the registered graph as a Graphviz `.dot` digraph.
    #[must_use]
    pub fn to_dot(&self) -> String {
        crate::dot::to_dot(&self.nodes)
    }

    fn node_index(&self, name: &str) -> usize {
        match self.index.get(name) {
            Some(&idx) => idx,
            None => unreachable!("routed to a node not present in the registration index: {name}"),
        }
    }

    // ---- validation ----------------------------------------------------

    fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        let mut seen_names: FxHashSet<&str> = FxHashSet::default();
        let mut filter_names: FxHashSet<&str> = FxHashSet::default();
        for node in &self.nodes {
            if !seen_names.insert(node.name()) {
                errors.push(format!("duplicate node name {:?}", node.name()));
            }
            if matches!(node.kind(), NodeKind::Filter { .. }) {
                filter_names.insert(node.name());
            }
        }
        for node in &self.nodes {
            match node.kind() {
                NodeKind::Reduction { output, over, .. } => {
                    if node.inputs().is_empty() {
                        errors.push(format!("reduction {:?} reacts to no declared product name", node.name()));
                    }
                    if output.is_empty() {
                        errors.push(format!("reduction {:?} declares no output product name", node.name()));
                    }
                    if over.is_empty() {
                        errors.push(format!("reduction {:?} declares no over level name", node.name()));
                    }
                }
                NodeKind::Splitter { level_name, .. } => {
                    if level_name.is_empty() {
                        errors.push(format!("splitter {:?} declares no level_name", node.name()));
                    }
                }
                NodeKind::Filter { .. } | NodeKind::Monitor { .. } | NodeKind::Transform { .. } => {}
            }
            for filter in node.preceded_by() {
                if !filter_names.contains(filter.as_str()) {
                    errors.push(format!("node {:?} is preceded_by unregistered filter {:?}", node.name(), filter));
                }
            }
        }
        errors.extend(self.detect_cycles());
        errors
    }

    fn detect_cycles(&self) -> Vec<String> {
        let mut producers: FxHashMap<&str, Vec<usize>> = FxHashMap::default();
        for (idx, node) in self.nodes.iter().enumerate() {
            for name in produced_names(node) {
                producers.entry(name).or_default().push(idx);
            }
        }
        let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); self.nodes.len()];
        for (idx, node) in self.nodes.iter().enumerate() {
            for input in node.inputs() {
                if let Some(froms) = producers.get(input.as_str()) {
                    for &from in froms {
                        adjacency[from].push(idx);
                    }
                }
            }
        }

        #[derive(Clone, Copy, PartialEq, Eq)]
        enum Mark {
            Unvisited,
            InProgress,
            Done,
        }

        fn visit(idx: usize, adjacency: &[Vec<usize>], marks: &mut [Mark], names: &[&str], errors: &mut Vec<String>) {
            match marks[idx] {
                Mark::Done => return,
                Mark::InProgress => {
                    errors.push(format!("cycle detected through node {:?}", names[idx]));
                    return;
                }
                Mark::Unvisited => {}
            }
            marks[idx] = Mark::InProgress;
            for &next in &adjacency[idx] {
                visit(next, adjacency, marks, names, errors);
            }
            marks[idx] = Mark::Done;
        }

        let names: Vec<&str> = self.nodes.iter().map(NodeDescriptor::name).collect();
        let mut marks = vec![Mark::Unvisited; self.nodes.len()];
        let mut errors = Vec::new();
        for idx in 0..self.nodes.len() {
            visit(idx, &adjacency, &mut marks, &names, &mut errors);
        }
        errors
    }

    // ---- dispatch --------------------------------------------------------

    fn dispatch(
        &self,
        state: &mut ExecState,
        msg: Message,
        queue: &mut VecDeque<Message>,
        pending: &mut Vec<(String, Message)>,
    ) -> FlowResult<()> {
        if msg.is_flush() {
            self.dispatch_flush(state, msg, queue, pending)
        } else {
            self.dispatch_process(state, msg, queue, pending)
        }
    }

    fn dispatch_process(
        &self,
        state: &mut ExecState,
        msg: Message,
        queue: &mut VecDeque<Message>,
        pending: &mut Vec<(String, Message)>,
    ) -> FlowResult<()> {
        let id = msg.store().id().clone();
        state.store_cache.put_process(msg.store().clone())?;
        let targets = state.multiplexer.route(&msg);
        let (filter_targets, other_targets): (Vec<String>, Vec<String>) = targets
            .into_iter()
            .partition(|name| matches!(self.nodes[self.node_index(name)].kind(), NodeKind::Filter { .. }));

        for name in &filter_targets {
            if let Outcome::Filter(decision) = self.run_process_node(state, name, &msg)? {
                state.filter_gates.record_decision(name, id.clone(), decision);
            }
        }

        let mut ready = Vec::new();
        for name in other_targets {
            let node = &self.nodes[self.node_index(&name)];
            match state.filter_gates.check(node.preceded_by(), &id) {
                GateDecision::Deliver => ready.push(name),
                GateDecision::Skip => {}
                GateDecision::Buffer => pending.push((name, msg.clone())),
            }
        }

        self.run_ready_and_inject(state, &ready, &msg, queue)?;
        self.retry_pending(state, pending, queue)
    }

    fn dispatch_flush(
        &self,
        state: &mut ExecState,
        msg: Message,
        queue: &mut VecDeque<Message>,
        pending: &mut Vec<(String, Message)>,
    ) -> FlowResult<()> {
        let id = msg.store().id().clone();
        state.store_cache.put_flush(msg.store().clone())?;

        for node in &self.nodes {
            if !node.preceded_by().is_empty() {
                state.filter_gates.resolve_for_flush(node.preceded_by(), &id);
            }
        }
        self.retry_pending(state, pending, queue)?;

        let targets = state.multiplexer.route(&msg);
        if !targets.is_empty() {
            let shared: &ExecState = state;
            let outcomes =
                scheduler::execute_parallel(&targets, self.config.max_parallelism, |name| self.run_flush_node(shared, name, &msg));
            let mut injected: VecDeque<Message> = VecDeque::new();
            for (name, outcome) in targets.iter().zip(outcomes) {
                if let Outcome::Reduction { completed: Some(completed), .. } = outcome? {
                    self.emit_completion(name, completed, &mut injected);
                }
            }
            while let Some(m) = injected.pop_back() {
                queue.push_front(m);
            }
        }

        state.store_cache.drop_entry(&id);
        Ok(())
    }

    fn retry_pending(
        &self,
        state: &mut ExecState,
        pending: &mut Vec<(String, Message)>,
        queue: &mut VecDeque<Message>,
    ) -> FlowResult<()> {
        let items = std::mem::take(pending);
        let mut still_pending = Vec::new();
        for (name, msg) in items {
            let id = msg.store().id().clone();
            let node = &self.nodes[self.node_index(&name)];
            match state.filter_gates.check(node.preceded_by(), &id) {
                GateDecision::Deliver => {
                    self.run_ready_and_inject(state, &[name], &msg, queue)?;
                }
                GateDecision::Skip => {}
                GateDecision::Buffer => still_pending.push((name, msg)),
            }
        }
        *pending = still_pending;
        Ok(())
    }

    fn run_ready_and_inject(
        &self,
        state: &mut ExecState,
        ready: &[String],
        msg: &Message,
        queue: &mut VecDeque<Message>,
    ) -> FlowResult<()> {
        if ready.is_empty() {
            return Ok(());
        }
        let shared: &ExecState = state;
        let outcomes = scheduler::execute_parallel(ready, self.config.max_parallelism, |name| {
            self.run_process_node(shared, name, msg)
        });

        let mut injected: VecDeque<Message> = VecDeque::new();
        for (name, outcome) in ready.iter().zip(outcomes) {
            match outcome? {
                Outcome::None | Outcome::Filter(_) => {}
                Outcome::Transform(pairs) => {
                    if !pairs.is_empty() {
                        let mut products = Products::new();
                        for (product_name, product) in pairs {
                            products.insert_product(product_name, product);
                        }
                        let store = ProductStore::process(msg.store().id().clone(), products);
                        injected.push_back(Message::new(store, msg.original_id()));
                    }
                }
                Outcome::Splitter(children, flush) => {
                    for child in children {
                        injected.push_back(Message::new(child, msg.original_id()));
                    }
                    state.synthesized_flush_ids.insert(flush.id().clone());
                    injected.push_back(Message::new(flush, msg.original_id()));
                }
                Outcome::Reduction { completed, .. } => {
                    if let Some(completed) = completed {
                        self.emit_completion(name, completed, &mut injected);
                    }
                }
            }
        }
        while let Some(m) = injected.pop_back() {
            queue.push_front(m);
        }
        Ok(())
    }

    /// Builds the process-then-flush pair a completed reduction emits: its
    /// output product at the parent id, immediately followed by a flush at
    /// that same id carrying a one-entry `FlushCounts` for its own level
    /// name, so a reduction one level further up can treat it as an
    /// ordinary leaf contribution.
    fn emit_completion(&self, name: &str, completed: CompletedReduction, injected: &mut VecDeque<Message>) {
        let node = &self.nodes[self.node_index(name)];
        let NodeKind::Reduction { output, .. } = node.kind() else {
            return;
        };
        let mut products = Products::new();
        products.insert_product(output.clone(), Product::from_boxed_any(completed.accumulator));
        let emit_id = completed.id;
        let store = ProductStore::process(emit_id.clone(), products);
        injected.push_back(Message::new(store, completed.terminal_original_id));

        let mut counts = FlushCounts::new();
        counts.set(emit_id.level_name().to_string(), 1);
        let flush_store = ProductStore::flush(emit_id, counts);
        injected.push_back(Message::new(flush_store, completed.terminal_original_id));
    }

    // ---- node execution --------------------------------------------------

    fn with_resources<R>(&self, state: &ExecState, node: &NodeDescriptor, f: impl FnOnce() -> R) -> R {
        let Concurrency::Serial(resources) = node.concurrency() else {
            return f();
        };
        let mut sorted: Vec<&String> = resources.iter().collect();
        sorted.sort();
        let mut guards = Vec::with_capacity(sorted.len());
        for resource in sorted {
            let Some(lock) = state.resource_locks.get(resource) else {
                continue;
            };
            let guard = match lock.try_lock() {
                Ok(guard) => guard,
                Err(_) => {
                    state.telemetry.conflict(resource, node.name());
                    lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
                }
            };
            guards.push(guard);
        }
        let result = f();
        drop(guards);
        result
    }

    fn run_process_node(&self, state: &ExecState, name: &str, msg: &Message) -> FlowResult<Outcome> {
        let idx = self.node_index(name);
        let node = &self.nodes[idx];
        let id = msg.store().id();
        let inputs: Vec<&Product> = node.inputs().iter().filter_map(|input| msg.store().products().get(input)).collect();

        let outcome = self.with_resources(state, node, || -> Outcome {
            state.telemetry.node_started(node.name(), id);
            let outcome = match node.kind() {
                NodeKind::Filter { predicate } => Outcome::Filter(predicate(&inputs)),
                NodeKind::Monitor { sink } => {
                    sink(&inputs);
                    Outcome::None
                }
                NodeKind::Transform { f, .. } => Outcome::Transform(f(&inputs)),
                NodeKind::Reduction { init, combine, over, .. } => {
                    let (folded, completed) = state.reductions.contribute(node.name(), over, init, combine, id, &inputs);
                    Outcome::Reduction { folded, completed }
                }
                NodeKind::Splitter { f, level_name, .. } => {
                    let mut generator = Generator::new(id.clone(), level_name.clone());
                    f(&mut generator, &inputs);
                    let (children, flush) = generator.finish();
                    Outcome::Splitter(children, flush)
                }
            };
            state.telemetry.node_finished(node.name(), id);
            outcome
        });

        // A reduction that found no ancestor at its `over` level folded
        // nothing — it routed here by product name alone, same as any other
        // consumer, but that's not a real execution of the node: a
        // `run`-level reduction fed by both event and job-level sibling
        // stores must not count the siblings it can't fold.
        if !matches!(outcome, Outcome::Reduction { folded: false, .. }) {
            self.counts[idx].fetch_add(1, Ordering::Relaxed);
        }
        Ok(outcome)
    }

    fn run_flush_node(&self, state: &ExecState, name: &str, msg: &Message) -> FlowResult<Outcome> {
        let idx = self.node_index(name);
        let node = &self.nodes[idx];
        let NodeKind::Reduction { init, over, .. } = node.kind() else {
            return Ok(Outcome::None);
        };
        state.telemetry.flush_observed(node.name(), msg.store().id());
        let completed = state.reductions.observe_flush(
            node.name(),
            over,
            init,
            msg.store().id(),
            msg.original_id(),
            msg.store().flush_counts(),
        )?;
        Ok(Outcome::Reduction { folded: true, completed })
    }
}

fn produced_names(node: &NodeDescriptor) -> Vec<&str> {
    match node.kind() {
        NodeKind::Transform { provides, .. } => provides.iter().map(String::as_str).collect(),
        NodeKind::Reduction { output, .. } => vec![output.as_str()],
        NodeKind::Splitter { provides, .. } => provides.iter().map(String::as_str).collect(),
        NodeKind::Filter { .. } | NodeKind::Monitor { .. } => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{declare_filter, declare_monitor};
    use crate::source::VecSource;
    use std::sync::atomic::AtomicI64;

    fn leaf(job: u32, number: i64) -> ProductStore {
        let mut p = Products::new();
        p.insert("number", number);
        ProductStore::process(LevelId::root().child("job", job), p)
    }

    #[test]
    fn registration_aggregates_duplicate_name_and_undeclared_reduction_input() {
        let mut driver = Driver::new(EngineConfig::new());
        driver.register(declare_filter("dup", |_| true).input(["number"]).build());
        driver.register(declare_filter("dup", |_| true).input(["number"]).build());
        driver.register(
            crate::node::declare_reduction("broken_add", || 0_i64, |acc: &mut i64, _: &[&Product]| *acc += 1)
                .output("broken_sum")
                .over("job")
                .build(),
        );

        let err = driver.execute(VecSource::new(vec![leaf(0, 1)])).unwrap_err();
        match err {
            FlowError::Registration(problems) => {
                assert!(problems.iter().any(|p| p.contains("duplicate node name")));
                assert!(problems.iter().any(|p| p.contains("reacts to no declared product name")));
            }
            other => panic!("expected Registration, got {other:?}"),
        }
    }

    #[test]
    fn monitor_runs_once_per_matching_message() {
        let seen = Arc::new(AtomicI64::new(0));
        let seen_for_monitor = Arc::clone(&seen);
        let mut driver = Driver::new(EngineConfig::new());
        driver.register(
            declare_monitor("watch", move |inputs| {
                if let Some(n) = inputs.first().and_then(|p| p.downcast_ref::<i64>()) {
                    seen_for_monitor.fetch_add(*n, Ordering::Relaxed);
                }
            })
            .input(["number"])
            .build(),
        );

        driver.execute(VecSource::new(vec![leaf(0, 10), leaf(1, 32)])).unwrap();
        assert_eq!(seen.load(Ordering::Relaxed), 42);
        assert_eq!(driver.execution_count("watch"), 2);
    }

    #[test]
    fn to_dot_includes_registered_node_names() {
        let mut driver = Driver::new(EngineConfig::new());
        driver.register(declare_monitor("watch", |_| {}).input(["number"]).build());
        let dot = driver.to_dot();
        assert!(dot.contains("\"watch\""));
    }
}
