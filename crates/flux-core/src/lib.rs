// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! flux-core: a hierarchical dataflow processing engine.
//!
//! Users register side-effect-free nodes (filters, monitors, transforms,
//! reductions, splitters) and wire them together by the named data products
//! each consumes and produces. A [`Source`] feeds a stream of hierarchically
//! identified [`ProductStore`]s into a [`Driver`], which routes stores to
//! registered nodes by product name, enforces filter predicates, reduces
//! along arbitrary hierarchy levels, and lets splitters synthesize new child
//! levels at runtime.
#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms, unused_must_use)]
#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    clippy::cargo,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::dbg_macro,
    clippy::print_stdout,
    clippy::print_stderr
)]
#![allow(
    clippy::must_use_candidate,
    clippy::return_self_not_must_use,
    clippy::missing_const_for_fn,
    clippy::redundant_pub_crate,
    clippy::module_name_repetitions,
    clippy::use_self,
    clippy::multiple_crate_versions
)]

mod dot;
mod driver;
mod error;
mod filter_gate;
mod ident;
mod message;
mod multiplexer;
mod node;
mod product;
mod reduction;
mod scheduler;
mod source;
mod splitter;
mod store;
mod store_cache;
mod telemetry;

/// Hierarchical identifier and hash-combining primitives.
pub use ident::{parse, LevelId};
/// Driver-level error type and result alias.
pub use error::{FlowError, FlowResult};
/// Product bag and typed retrieval.
pub use product::{Product, Products};
/// Product store and stage flags.
pub use store::{FlushCounts, ProductStore, Stage};
/// Message envelope carrying a store through the graph.
pub use message::Message;
/// Source trait and a simple in-memory implementation.
pub use source::{Source, VecSource};
/// Node declaration surface and concurrency policy.
pub use node::{
    declare_filter, declare_monitor, declare_reduction, declare_splitter, declare_transform,
    Concurrency, NodeDescriptor, NodeKind,
};
/// Splitter generator handle.
pub use splitter::Generator;
/// The graph driver: registration, execution, introspection.
pub use driver::{Driver, EngineConfig};
/// Observability seam.
pub use telemetry::{NullTelemetrySink, TelemetrySink};
#[cfg(feature = "telemetry")]
pub use telemetry::StderrJsonlSink;
/// `.dot` graph emission.
pub use dot::to_dot;

#[cfg(test)]
mod integration_tests;
