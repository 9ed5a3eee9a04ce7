// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Message envelopes: a store plus its place in emission order.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::store::ProductStore;

/// Monotonically increasing sequence number assigned at emission time.
///
/// Ordering, not identity: two messages from different sources may share a
/// `LevelId` but never an `OriginalId`. Ports and the multiplexer use it to
/// decide when a flush may be forwarded (only once every smaller id at the
/// same or a descendant level has already passed through).
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OriginalId(u64);

impl OriginalId {
    /// Wraps a raw sequence value, e.g. for test fixtures.
    pub const fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Returns the underlying raw value.
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for OriginalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Process-wide source of fresh [`OriginalId`] values.
///
/// One counter per process, not per source: ids only need to be unique and
/// monotonic within whatever stream a consumer observes them in, and sharing
/// the counter keeps interleaved sources from ever colliding.
#[derive(Debug, Default)]
pub struct OriginalIdSequence(AtomicU64);

impl OriginalIdSequence {
    /// Creates a fresh sequence starting at `1` (`0` is never issued).
    pub const fn new() -> Self {
        Self(AtomicU64::new(1))
    }

    /// Issues the next id.
    pub fn next(&self) -> OriginalId {
        OriginalId(self.0.fetch_add(1, Ordering::Relaxed))
    }
}

/// A store together with its emission order.
#[derive(Clone, Debug)]
pub struct Message {
    store: ProductStore,
    original_id: OriginalId,
}

impl Message {
    /// Wraps `store` with the given emission order.
    pub fn new(store: ProductStore, original_id: OriginalId) -> Self {
        Self { store, original_id }
    }

    /// Returns the carried store.
    pub fn store(&self) -> &ProductStore {
        &self.store
    }

    /// Returns the emission-order id.
    pub fn original_id(&self) -> OriginalId {
        self.original_id
    }

    /// Returns `true` if the carried store is a flush barrier.
    pub fn is_flush(&self) -> bool {
        self.store.is_flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ident::LevelId;
    use crate::product::Products;

    #[test]
    fn sequence_starts_at_one_and_increments() {
        let seq = OriginalIdSequence::new();
        assert_eq!(seq.next().value(), 1);
        assert_eq!(seq.next().value(), 2);
        assert_eq!(seq.next().value(), 3);
    }

    #[test]
    fn message_carries_store_and_order() {
        let seq = OriginalIdSequence::new();
        let store = ProductStore::process(LevelId::root(), Products::new());
        let msg = Message::new(store, seq.next());
        assert!(!msg.is_flush());
        assert_eq!(msg.original_id().value(), 1);
    }

    #[test]
    fn ordering_follows_wrapped_u64() {
        let a = OriginalId::from_raw(1);
        let b = OriginalId::from_raw(2);
        assert!(a < b);
    }
}
