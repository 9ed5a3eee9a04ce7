// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Bounded internal worker pool.
//!
//! Work items are claimed by a small pool of scoped threads via an atomic
//! work-stealing counter, the same shape the host family uses for its
//! sharded rewrite execution — generalized here to an arbitrary slice of
//! ready work rather than a fixed rewrite-shard partition.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Returns the default `max_parallelism`: detected hardware concurrency, or
/// `1` if it cannot be determined.
pub fn default_parallelism() -> usize {
    std::thread::available_parallelism().map(std::num::NonZeroUsize::get).unwrap_or(1)
}

/// Runs `f` over every item in `items`, spreading work across up to
/// `workers` scoped threads via work-stealing. Results are returned in the
/// same order as `items`, independent of which worker claimed which index.
///
/// # Panics
///
/// Resumes the panic of any worker thread that panicked, after every other
/// worker has finished.
pub fn execute_parallel<W, R, F>(items: &[W], workers: usize, f: F) -> Vec<R>
where
    W: Sync,
    R: Send,
    F: Fn(&W) -> R + Sync,
{
    if items.is_empty() {
        return Vec::new();
    }
    let worker_count = workers.max(1).min(items.len());
    let next = AtomicUsize::new(0);

    std::thread::scope(|scope| {
        let handles: Vec<_> = (0..worker_count)
            .map(|_| {
                let next = &next;
                let items = &items;
                let f = &f;
                scope.spawn(move || {
                    let mut claimed = Vec::new();
                    loop {
                        let idx = next.fetch_add(1, Ordering::Relaxed);
                        if idx >= items.len() {
                            break;
                        }
                        claimed.push((idx, f(&items[idx])));
                    }
                    claimed
                })
            })
            .collect();

        let mut results: Vec<Option<R>> = (0..items.len()).map(|_| None).collect();
        for handle in handles {
            match handle.join() {
                Ok(claimed) => {
                    for (idx, value) in claimed {
                        results[idx] = Some(value);
                    }
                }
                Err(payload) => std::panic::resume_unwind(payload),
            }
        }
        results
            .into_iter()
            .map(|r| match r {
                Some(value) => value,
                None => unreachable!("every index is claimed by exactly one worker"),
            })
            .collect()
    })
}

/// Runs `f` over every item in `items` on the calling thread, in order.
pub fn execute_serial<W, R, F>(items: &[W], mut f: F) -> Vec<R>
where
    F: FnMut(&W) -> R,
{
    items.iter().map(|item| f(item)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    #[test]
    fn parallel_execution_preserves_input_order() {
        let items: Vec<i64> = (0..200).collect();
        let results = execute_parallel(&items, 8, |x| x * 2);
        let expected: Vec<i64> = items.iter().map(|x| x * 2).collect();
        assert_eq!(results, expected);
    }

    #[test]
    fn empty_input_yields_empty_output() {
        let items: Vec<i64> = Vec::new();
        let results = execute_parallel(&items, 4, |x| *x);
        assert!(results.is_empty());
    }

    #[test]
    fn workers_are_capped_at_item_count() {
        let items = vec![1, 2, 3];
        let touched = AtomicU64::new(0);
        let results = execute_parallel(&items, 64, |x| {
            touched.fetch_add(1, Ordering::Relaxed);
            *x
        });
        assert_eq!(results, items);
        assert_eq!(touched.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn serial_execution_runs_in_order() {
        let items = vec![1, 2, 3];
        let mut seen = Vec::new();
        let results = execute_serial(&items, |x| {
            seen.push(*x);
            x * 10
        });
        assert_eq!(seen, vec![1, 2, 3]);
        assert_eq!(results, vec![10, 20, 30]);
    }
}
