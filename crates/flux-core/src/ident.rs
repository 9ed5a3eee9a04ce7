// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Hierarchical identifier and hashing utilities.
//!
//! A [`LevelId`] is a persistent, shared node in a tree of identifiers: a
//! path from the root, one named-or-unnamed number per tier. Two hashes are
//! maintained eagerly so routing and reduction bucketing never recompute
//! them: a **structural** hash folding ancestor level names, and a
//! **positional** hash folding ancestor numbers.

use std::fmt;
use std::sync::{Arc, Mutex, OnceLock};

use rustc_hash::FxHashMap;

/// Combines a running hash with a new value using the classic
/// `boost::hash_combine` step: `h' = h ^ (x + 0x9e3779b9 + (h<<6) + (h>>2))`.
#[inline]
const fn combine(h: u64, x: u64) -> u64 {
    h ^ (x
        .wrapping_add(0x9e37_79b9)
        .wrapping_add(h << 6)
        .wrapping_add(h >> 2))
}

fn hash_str(s: &str) -> u64 {
    // FNV-1a, folded into `combine` below; stable across runs (unlike
    // `std`'s randomized `SipHash`), which `level_hash` requires.
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    for b in s.as_bytes() {
        h ^= u64::from(*b);
        h = h.wrapping_mul(0x100_0000_01b3);
    }
    h
}

struct Inner {
    parent: Option<LevelId>,
    number: Option<u32>,
    name: String,
    depth: u32,
    level_hash: u64,
    hash: u64,
}

/// Immutable hierarchical identifier with a parent pointer and stable hashes.
///
/// Cloning a `LevelId` is a cheap `Arc` bump. Parents strictly outlive
/// children: a child holds an owning reference to its parent, so the parent
/// chain is always valid for the lifetime of any descendant.
#[derive(Clone)]
pub struct LevelId(Arc<Inner>);

impl LevelId {
    /// Returns the process-wide root identifier.
    ///
    /// The root has no parent, no number, and an empty level name.
    pub fn root() -> Self {
        static ROOT: OnceLock<LevelId> = OnceLock::new();
        ROOT.get_or_init(|| {
            LevelId(Arc::new(Inner {
                parent: None,
                number: None,
                name: String::new(),
                depth: 0,
                level_hash: 0,
                hash: 0,
            }))
        })
        .clone()
    }

    /// Returns `true` if this is the root identifier.
    pub fn is_root(&self) -> bool {
        self.0.parent.is_none()
    }

    /// Returns the parent, or `None` at the root.
    pub fn parent(&self) -> Option<&LevelId> {
        self.0.parent.as_ref()
    }

    /// Returns the child number at this level, or `None` at the root.
    pub fn number(&self) -> Option<u32> {
        self.0.number
    }

    /// Returns the level name, empty for unnamed levels and for the root.
    pub fn level_name(&self) -> &str {
        &self.0.name
    }

    /// Returns the depth (root is 0).
    pub fn depth(&self) -> u32 {
        self.0.depth
    }

    /// Returns the cached structural hash (combines ancestor level names).
    pub fn level_hash(&self) -> u64 {
        self.0.level_hash
    }

    /// Returns the cached positional hash (combines ancestor numbers).
    pub fn positional_hash(&self) -> u64 {
        self.0.hash
    }

    /// Creates (or returns the interned) child with the given name and number.
    pub fn child(&self, name: &str, number: u32) -> LevelId {
        arena_child(self, name, number)
    }

    /// Creates (or returns the interned) unnamed child with the given number.
    pub fn child_unnamed(&self, number: u32) -> LevelId {
        self.child("", number)
    }

    /// Walks from the root, creating unnamed children for each number in turn.
    pub fn id_for(numbers: &[u32]) -> LevelId {
        let mut id = LevelId::root();
        for &n in numbers {
            id = id.child_unnamed(n);
        }
        id
    }

    /// Returns the nearest ancestor (including `self`) whose level name
    /// equals `level_name`, or `None` if no such ancestor exists.
    pub fn ancestor_at_level(&self, level_name: &str) -> Option<LevelId> {
        let mut cur = Some(self.clone());
        while let Some(id) = cur {
            if id.level_name() == level_name {
                return Some(id);
            }
            cur = id.parent().cloned();
        }
        None
    }

    /// Returns `true` if `self` is the same id as, or a descendant of, `other`.
    pub fn is_descendant_of_or_eq(&self, other: &LevelId) -> bool {
        let mut cur = Some(self.clone());
        while let Some(id) = cur {
            if id == *other {
                return true;
            }
            cur = id.parent().cloned();
        }
        false
    }

    /// Collects the sequence of numbers from root to self (root excluded).
    fn numbers_from_root(&self) -> Vec<u32> {
        let mut out = Vec::with_capacity(self.depth() as usize);
        let mut cur = Some(self.clone());
        while let Some(id) = cur {
            if let Some(n) = id.number() {
                out.push(n);
            }
            cur = id.parent().cloned();
        }
        out.reverse();
        out
    }

    /// Collects `(name, number)` pairs from root to self (root excluded).
    fn segments_from_root(&self) -> Vec<(String, u32)> {
        let mut out = Vec::with_capacity(self.depth() as usize);
        let mut cur = Some(self.clone());
        while let Some(id) = cur {
            if let Some(n) = id.number() {
                out.push((id.level_name().to_string(), n));
            }
            cur = id.parent().cloned();
        }
        out.reverse();
        out
    }
}

impl PartialEq for LevelId {
    fn eq(&self, other: &Self) -> bool {
        self.depth() == other.depth() && self.segments_from_root() == other.segments_from_root()
    }
}
impl Eq for LevelId {}

impl std::hash::Hash for LevelId {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.hash.hash(state);
    }
}

impl PartialOrd for LevelId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for LevelId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.numbers_from_root().cmp(&other.numbers_from_root())
    }
}

impl fmt::Debug for LevelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LevelId({self})")
    }
}

impl fmt::Display for LevelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let segments = self.segments_from_root();
        write!(f, "[")?;
        for (i, (name, number)) in segments.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            if name.is_empty() {
                write!(f, "{number}")?;
            } else {
                write!(f, "{name}:{number}")?;
            }
        }
        write!(f, "]")
    }
}

/// Parses the `name:number(:name:number)*` string syntax (§6).
///
/// Segments are `:`-delimited; empty tokens are dropped. A token that parses
/// as an integer where a name is expected produces an unnamed level (so
/// purely numeric paths like `"0:1:2"` parse the same as [`LevelId::id_for`]).
pub fn parse(s: &str) -> LevelId {
    let tokens: Vec<&str> = s.split(':').filter(|t| !t.is_empty()).collect();
    let mut id = LevelId::root();
    let mut i = 0;
    while i < tokens.len() {
        if let Ok(n) = tokens[i].parse::<u32>() {
            id = id.child_unnamed(n);
            i += 1;
        } else if i + 1 < tokens.len() {
            if let Ok(n) = tokens[i + 1].parse::<u32>() {
                id = id.child(tokens[i], n);
                i += 2;
            } else {
                // Name with no following number: keep as an unnamed-number-0
                // placeholder rather than silently dropping the segment.
                id = id.child(tokens[i], 0);
                i += 1;
            }
        } else {
            id = id.child(tokens[i], 0);
            i += 1;
        }
    }
    id
}

type ArenaKey = (usize, u32, String);

fn arena() -> &'static Mutex<FxHashMap<ArenaKey, LevelId>> {
    static ARENA: OnceLock<Mutex<FxHashMap<ArenaKey, LevelId>>> = OnceLock::new();
    ARENA.get_or_init(|| Mutex::new(FxHashMap::default()))
}

#[allow(clippy::significant_drop_tightening)]
fn arena_child(parent: &LevelId, name: &str, number: u32) -> LevelId {
    let parent_ptr = Arc::as_ptr(&parent.0) as usize;
    let key: ArenaKey = (parent_ptr, number, name.to_string());
    let mut guard = arena().lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    if let Some(existing) = guard.get(&key) {
        return existing.clone();
    }
    let level_hash = combine(parent.level_hash(), hash_str(name));
    let hash = combine(parent.positional_hash(), u64::from(number));
    let child = LevelId(Arc::new(Inner {
        parent: Some(parent.clone()),
        number: Some(number),
        name: name.to_string(),
        depth: parent.depth() + 1,
        level_hash,
        hash,
    }));
    guard.insert(key, child.clone());
    child
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_has_no_parent_and_empty_name() {
        let root = LevelId::root();
        assert!(root.is_root());
        assert_eq!(root.number(), None);
        assert_eq!(root.level_name(), "");
        assert_eq!(root.depth(), 0);
    }

    #[test]
    fn id_for_creates_unnamed_chain() {
        let id = LevelId::id_for(&[1, 2, 3]);
        assert_eq!(id.depth(), 3);
        assert_eq!(id.to_string(), "[1, 2, 3]");
    }

    #[test]
    fn child_calls_are_interned() {
        let root = LevelId::root();
        let a = root.child("job", 0);
        let b = root.child("job", 0);
        assert_eq!(a, b);
        assert_eq!(a.positional_hash(), b.positional_hash());
    }

    #[test]
    fn distinct_children_are_not_equal() {
        let root = LevelId::root();
        let a = root.child("job", 0);
        let b = root.child("job", 1);
        assert_ne!(a, b);
    }

    #[test]
    fn string_form_round_trips() {
        let id = LevelId::root().child("job", 0).child("run", 1).child("event", 3);
        let printed = id.to_string();
        assert_eq!(printed, "[job:0, run:1, event:3]");
        let reparsed = parse("job:0:run:1:event:3");
        assert_eq!(reparsed, id);
        assert_eq!(reparsed.positional_hash(), id.positional_hash());
        assert_eq!(reparsed.level_hash(), id.level_hash());
    }

    #[test]
    fn unnamed_levels_print_just_the_number() {
        let id = LevelId::root().child("job", 0).child_unnamed(5);
        assert_eq!(id.to_string(), "[job:0, 5]");
    }

    #[test]
    fn ordering_is_lexicographic_over_numbers() {
        let a = LevelId::id_for(&[0, 1]);
        let b = LevelId::id_for(&[0, 2]);
        let c = LevelId::id_for(&[1, 0]);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn ancestor_at_level_finds_nearest_match() {
        let job = LevelId::root().child("job", 0);
        let run = job.child("run", 1);
        let event = run.child("event", 3);
        assert_eq!(event.ancestor_at_level("run"), Some(run.clone()));
        assert_eq!(event.ancestor_at_level("job"), Some(job));
        assert_eq!(event.ancestor_at_level("nope"), None);
    }

    #[test]
    fn is_descendant_of_or_eq_walks_parent_chain() {
        let job = LevelId::root().child("job", 0);
        let run = job.child("run", 1);
        assert!(run.is_descendant_of_or_eq(&job));
        assert!(run.is_descendant_of_or_eq(&run));
        assert!(!job.is_descendant_of_or_eq(&run));
    }

    #[test]
    fn empty_segments_are_dropped_when_parsing() {
        let a = parse("job:0::run:1");
        let b = parse("job:0:run:1");
        assert_eq!(a, b);
    }
}
