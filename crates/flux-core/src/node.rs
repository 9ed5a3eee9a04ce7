// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Node declaration surface: descriptors and the fluent builders that
//! construct them.
//!
//! This is the thin, user-facing half of the engine — the routing and
//! reduction machinery underneath is where the real complexity lives. These
//! builders intentionally do no function-signature reflection; callables are
//! plain closures over `&[&Product]`.

use std::any::Any;
use std::sync::Arc;

use crate::product::Product;
use crate::splitter::Generator;

/// Per-node scheduling policy.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Concurrency {
    /// May run concurrently across different `LevelId`s.
    #[default]
    Unlimited,
    /// Must hold every named resource token before running; resources are
    /// acquired in a fixed global order (lexicographic by name) to prevent
    /// deadlock across nodes sharing more than one token.
    Serial(Vec<String>),
}

/// `fn(&[&Product]) -> bool`.
pub type FilterFn = Arc<dyn Fn(&[&Product]) -> bool + Send + Sync>;
/// `fn(&[&Product])`, run for side effect only.
pub type MonitorFn = Arc<dyn Fn(&[&Product]) + Send + Sync>;
/// `fn(&[&Product]) -> Vec<(String, Product)>`.
pub type TransformFn = Arc<dyn Fn(&[&Product]) -> Vec<(String, Product)> + Send + Sync>;
/// Type-erased reduction accumulator.
pub type ReductionState = Box<dyn Any + Send + Sync>;
/// Builds the zero/identity accumulator.
pub type InitFn = Arc<dyn Fn() -> ReductionState + Send + Sync>;
/// Folds one contribution into the accumulator in place.
pub type CombineFn = Arc<dyn Fn(&mut ReductionState, &[&Product]) + Send + Sync>;
/// `fn(&mut Generator, &[&Product])`.
pub type SplitterFn = Arc<dyn Fn(&mut Generator, &[&Product]) + Send + Sync>;

/// The behavior a node contributes, independent of its scheduling metadata.
pub enum NodeKind {
    /// Gates downstream delivery by a per-`LevelId` boolean decision.
    Filter {
        /// Decision function.
        predicate: FilterFn,
    },
    /// Side-effecting observer; contributes no products.
    Monitor {
        /// Observer function.
        sink: MonitorFn,
    },
    /// Produces new named products from its inputs.
    Transform {
        /// Transform function.
        f: TransformFn,
        /// Declared output product names, if the caller stated them up
        /// front (purely advisory — used for `.dot` emission and
        /// registration-time wiring checks, never enforced against what the
        /// closure actually returns).
        provides: Vec<String>,
    },
    /// Aggregates contributions across a hierarchy level.
    Reduction {
        /// Builds the initial accumulator.
        init: InitFn,
        /// Folds one contribution in.
        combine: CombineFn,
        /// Name the final accumulator is emitted under.
        output: String,
        /// Level name the reduction is parameterized over.
        over: String,
    },
    /// Injects new child levels at runtime.
    Splitter {
        /// Generator function.
        f: SplitterFn,
        /// Level name the generator hands to every child it creates.
        level_name: String,
        /// Product names this splitter's children may carry.
        provides: Vec<String>,
    },
}

impl std::fmt::Debug for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Filter { .. } => f.debug_struct("Filter").finish_non_exhaustive(),
            Self::Monitor { .. } => f.debug_struct("Monitor").finish_non_exhaustive(),
            Self::Transform { .. } => f.debug_struct("Transform").finish_non_exhaustive(),
            Self::Reduction { output, over, .. } => f
                .debug_struct("Reduction")
                .field("output", output)
                .field("over", over)
                .finish_non_exhaustive(),
            Self::Splitter { level_name, provides, .. } => f
                .debug_struct("Splitter")
                .field("level_name", level_name)
                .field("provides", provides)
                .finish_non_exhaustive(),
        }
    }
}

/// A fully-specified node, ready for registration with the driver.
#[derive(Debug)]
pub struct NodeDescriptor {
    name: String,
    kind: NodeKind,
    inputs: Vec<String>,
    preceded_by: Vec<String>,
    concurrency: Concurrency,
}

impl NodeDescriptor {
    /// Returns the node's unique name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the node's behavior.
    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    /// Returns the product names this node consumes.
    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    /// Returns the filter names gating this node's delivery.
    pub fn preceded_by(&self) -> &[String] {
        &self.preceded_by
    }

    /// Returns the node's concurrency policy.
    pub fn concurrency(&self) -> &Concurrency {
        &self.concurrency
    }

    /// Returns `true` if this node is a [`NodeKind::Reduction`] parameterized
    /// `over` the given level name.
    pub fn reduces_over(&self, level_name: &str) -> bool {
        matches!(&self.kind, NodeKind::Reduction { over, .. } if over == level_name)
    }

    /// Returns the level name this node's children are created under, if
    /// this is a [`NodeKind::Splitter`].
    pub fn splitter_level_name(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::Splitter { level_name, .. } => Some(level_name),
            _ => None,
        }
    }
}

macro_rules! common_builder_methods {
    () => {
        /// Declares the product names this node consumes.
        pub fn input(mut self, names: impl IntoIterator<Item = impl Into<String>>) -> Self {
            self.inputs = names.into_iter().map(Into::into).collect();
            self
        }

        /// Declares the filter names that must accept before this node runs.
        pub fn preceded_by(mut self, names: impl IntoIterator<Item = impl Into<String>>) -> Self {
            self.preceded_by = names.into_iter().map(Into::into).collect();
            self
        }

        /// Sets the node's concurrency policy (default: [`Concurrency::Unlimited`]).
        pub fn concurrency(mut self, policy: Concurrency) -> Self {
            self.concurrency = policy;
            self
        }
    };
}

/// Builder returned by a filter declaration.
pub struct FilterBuilder {
    name: String,
    predicate: FilterFn,
    inputs: Vec<String>,
    preceded_by: Vec<String>,
    concurrency: Concurrency,
}

impl FilterBuilder {
    pub(crate) fn new(name: impl Into<String>, predicate: FilterFn) -> Self {
        Self {
            name: name.into(),
            predicate,
            inputs: Vec::new(),
            preceded_by: Vec::new(),
            concurrency: Concurrency::default(),
        }
    }

    common_builder_methods!();

    /// Finalizes the descriptor.
    pub fn build(self) -> NodeDescriptor {
        NodeDescriptor {
            name: self.name,
            kind: NodeKind::Filter { predicate: self.predicate },
            inputs: self.inputs,
            preceded_by: self.preceded_by,
            concurrency: self.concurrency,
        }
    }
}

/// Builder returned by a monitor declaration.
pub struct MonitorBuilder {
    name: String,
    sink: MonitorFn,
    inputs: Vec<String>,
    preceded_by: Vec<String>,
    concurrency: Concurrency,
}

impl MonitorBuilder {
    pub(crate) fn new(name: impl Into<String>, sink: MonitorFn) -> Self {
        Self {
            name: name.into(),
            sink,
            inputs: Vec::new(),
            preceded_by: Vec::new(),
            concurrency: Concurrency::default(),
        }
    }

    common_builder_methods!();

    /// Finalizes the descriptor.
    pub fn build(self) -> NodeDescriptor {
        NodeDescriptor {
            name: self.name,
            kind: NodeKind::Monitor { sink: self.sink },
            inputs: self.inputs,
            preceded_by: self.preceded_by,
            concurrency: self.concurrency,
        }
    }
}

/// Builder returned by a transform declaration.
pub struct TransformBuilder {
    name: String,
    f: TransformFn,
    provides: Vec<String>,
    inputs: Vec<String>,
    preceded_by: Vec<String>,
    concurrency: Concurrency,
}

impl TransformBuilder {
    pub(crate) fn new(name: impl Into<String>, f: TransformFn) -> Self {
        Self {
            name: name.into(),
            f,
            provides: Vec::new(),
            inputs: Vec::new(),
            preceded_by: Vec::new(),
            concurrency: Concurrency::default(),
        }
    }

    /// Declares the product names this transform's closure may emit. Purely
    /// advisory; omit it and `.dot` emission falls back to treating the
    /// transform as a sink.
    pub fn provides(mut self, names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.provides = names.into_iter().map(Into::into).collect();
        self
    }

    common_builder_methods!();

    /// Finalizes the descriptor.
    pub fn build(self) -> NodeDescriptor {
        NodeDescriptor {
            name: self.name,
            kind: NodeKind::Transform { f: self.f, provides: self.provides },
            inputs: self.inputs,
            preceded_by: self.preceded_by,
            concurrency: self.concurrency,
        }
    }
}

/// Builder returned by a reduction declaration.
///
/// `react_to`, `output`, and `over` are all required before [`build`](Self::build);
/// omitting one leaves the corresponding field empty, which the driver
/// rejects at registration.
pub struct ReductionBuilder {
    name: String,
    init: InitFn,
    combine: CombineFn,
    output: String,
    over: String,
    inputs: Vec<String>,
    preceded_by: Vec<String>,
    concurrency: Concurrency,
}

impl ReductionBuilder {
    pub(crate) fn new(name: impl Into<String>, init: InitFn, combine: CombineFn) -> Self {
        Self {
            name: name.into(),
            init,
            combine,
            output: String::new(),
            over: String::new(),
            inputs: Vec::new(),
            preceded_by: Vec::new(),
            concurrency: Concurrency::default(),
        }
    }

    /// Declares the product names that trigger a contribution.
    pub fn react_to(mut self, names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.inputs = names.into_iter().map(Into::into).collect();
        self
    }

    /// Names the product the final accumulator is emitted under.
    pub fn output(mut self, name: impl Into<String>) -> Self {
        self.output = name.into();
        self
    }

    /// Sets the level this reduction aggregates over.
    pub fn over(mut self, level_name: impl Into<String>) -> Self {
        self.over = level_name.into();
        self
    }

    common_builder_methods!();

    /// Finalizes the descriptor.
    pub fn build(self) -> NodeDescriptor {
        NodeDescriptor {
            name: self.name,
            kind: NodeKind::Reduction {
                init: self.init,
                combine: self.combine,
                output: self.output,
                over: self.over,
            },
            inputs: self.inputs,
            preceded_by: self.preceded_by,
            concurrency: self.concurrency,
        }
    }
}

/// Builder returned by a splitter declaration.
///
/// `.level_name` is required before [`build`](Self::build); omitting it
/// leaves the field empty, which the driver rejects at registration.
pub struct SplitterBuilder {
    name: String,
    f: SplitterFn,
    level_name: String,
    provides: Vec<String>,
    inputs: Vec<String>,
    preceded_by: Vec<String>,
    concurrency: Concurrency,
}

impl SplitterBuilder {
    pub(crate) fn new(name: impl Into<String>, f: SplitterFn) -> Self {
        Self {
            name: name.into(),
            f,
            level_name: String::new(),
            provides: Vec::new(),
            inputs: Vec::new(),
            preceded_by: Vec::new(),
            concurrency: Concurrency::default(),
        }
    }

    /// Names the level this splitter's children are created under.
    pub fn level_name(mut self, name: impl Into<String>) -> Self {
        self.level_name = name.into();
        self
    }

    /// Declares the product names this splitter's children may carry.
    pub fn provides(mut self, names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.provides = names.into_iter().map(Into::into).collect();
        self
    }

    common_builder_methods!();

    /// Finalizes the descriptor.
    pub fn build(self) -> NodeDescriptor {
        NodeDescriptor {
            name: self.name,
            kind: NodeKind::Splitter { f: self.f, level_name: self.level_name, provides: self.provides },
            inputs: self.inputs,
            preceded_by: self.preceded_by,
            concurrency: self.concurrency,
        }
    }
}

/// Starts a filter declaration.
pub fn declare_filter(
    name: impl Into<String>,
    predicate: impl Fn(&[&Product]) -> bool + Send + Sync + 'static,
) -> FilterBuilder {
    FilterBuilder::new(name, Arc::new(predicate))
}

/// Starts a monitor declaration.
pub fn declare_monitor(
    name: impl Into<String>,
    sink: impl Fn(&[&Product]) + Send + Sync + 'static,
) -> MonitorBuilder {
    MonitorBuilder::new(name, Arc::new(sink))
}

/// Starts a transform declaration.
pub fn declare_transform(
    name: impl Into<String>,
    f: impl Fn(&[&Product]) -> Vec<(String, Product)> + Send + Sync + 'static,
) -> TransformBuilder {
    TransformBuilder::new(name, Arc::new(f))
}

/// Starts a reduction declaration.
pub fn declare_reduction<Acc>(
    name: impl Into<String>,
    init: impl Fn() -> Acc + Send + Sync + 'static,
    combine: impl Fn(&mut Acc, &[&Product]) + Send + Sync + 'static,
) -> ReductionBuilder
where
    Acc: Any + Send + Sync + 'static,
{
    let init: InitFn = Arc::new(move || -> ReductionState { Box::new(init()) });
    let combine: CombineFn = Arc::new(move |state: &mut ReductionState, contribution: &[&Product]| {
        if let Some(acc) = state.downcast_mut::<Acc>() {
            combine(acc, contribution);
        }
    });
    ReductionBuilder::new(name, init, combine)
}

/// Starts a splitter declaration.
pub fn declare_splitter(
    name: impl Into<String>,
    f: impl Fn(&mut Generator, &[&Product]) + Send + Sync + 'static,
) -> SplitterBuilder {
    SplitterBuilder::new(name, Arc::new(f))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_builder_carries_inputs_and_preceded_by() {
        let descriptor = declare_filter("accept_even", |_| true)
            .input(["id"])
            .preceded_by(Vec::<String>::new())
            .build();
        assert_eq!(descriptor.name(), "accept_even");
        assert_eq!(descriptor.inputs(), ["id"]);
        assert!(matches!(descriptor.kind(), NodeKind::Filter { .. }));
    }

    #[test]
    fn reduction_builder_sets_output_and_over() {
        let descriptor = declare_reduction(
            "run_add",
            || 0_i64,
            |acc: &mut i64, products: &[&Product]| {
                if let Some(n) = products.first().and_then(|p| p.downcast_ref::<i64>()) {
                    *acc += n;
                }
            },
        )
        .react_to(["number"])
        .output("run_sum")
        .over("run")
        .build();

        assert!(descriptor.reduces_over("run"));
        assert!(!descriptor.reduces_over("job"));
        assert_eq!(descriptor.inputs(), ["number"]);
    }

    #[test]
    fn serial_concurrency_carries_resource_names() {
        let descriptor = declare_monitor("watch", |_| {})
            .concurrency(Concurrency::Serial(vec!["R".to_string()]))
            .build();
        assert_eq!(descriptor.concurrency(), &Concurrency::Serial(vec!["R".to_string()]));
    }
}
