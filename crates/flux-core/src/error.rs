// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Engine error type.

use thiserror::Error;

use crate::ident::LevelId;

/// Result alias used throughout the engine.
pub type FlowResult<T> = Result<T, FlowError>;

/// Errors surfaced by registration or execution.
#[derive(Debug, Error)]
pub enum FlowError {
    /// One or more registration problems, aggregated and raised at `execute()`.
    #[error("registration failed: {0:?}")]
    Registration(Vec<String>),
    /// A product a node declared as input was absent from the store it was handed.
    #[error("missing product {product:?} for node {node:?} at {id}")]
    MissingProduct {
        /// Name of the node that requested the product.
        node: String,
        /// Name of the missing product.
        product: String,
        /// Level at which the product was requested.
        id: LevelId,
    },
    /// A product was present under the requested name but had a different type.
    #[error("type mismatch for product {product:?} requested by node {node:?} at {id}")]
    TypeMismatch {
        /// Name of the node that requested the product.
        node: String,
        /// Name of the mistyped product.
        product: String,
        /// Level at which the product was requested.
        id: LevelId,
    },
    /// A second flush arrived for an id that already had one, or a flush
    /// arrived for an id that never saw a process store.
    #[error("unexpected flush at {0}")]
    UnexpectedFlush(LevelId),
    /// A user-supplied callable returned an error.
    #[error("node {node:?} failed at {id}: {message}")]
    UserFunctionFailure {
        /// Name of the node whose callable failed.
        node: String,
        /// Level at which the failure occurred.
        id: LevelId,
        /// Message produced by the callable.
        message: String,
    },
    /// A reduction's `contrib_count` did not equal its `expected_count` at completion.
    #[error("reduction {node:?} at {id} expected {expected} contributions, saw {actual}")]
    CountMismatch {
        /// Name of the reduction node.
        node: String,
        /// Parent level at which the reduction completed.
        id: LevelId,
        /// Authoritative expected count.
        expected: u64,
        /// Observed contribution count.
        actual: u64,
    },
}
