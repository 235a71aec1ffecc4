//! Fixed-partition worker pool (spec.md §4.4).
//!
//! `T = max(1, online-CPU-count)` threads are spawned with
//! `std::thread::scope`, each told its own `thread_no` and the total
//! thread count `T`. Partitioning is by `block_index mod T`; this is the
//! "deterministic partition" the spec calls out as load-bearing for the
//! Squasher's in-place reverse pass, so it lives here rather than behind a
//! work-stealing queue.

use std::thread;

use tracing::{debug, instrument};

use crate::error::SquashmergeError;

/// Number of worker threads this pool will use: the number of available
/// CPUs, floored at 1.
pub fn thread_count() -> usize {
    thread::available_parallelism().map(|n| n.get()).unwrap_or(1).max(1)
}

/// Runs `task` once per worker thread, in parallel, joining all of them
/// before returning. `task(thread_no, num_threads)` must only touch byte
/// ranges disjoint from every other `thread_no`'s — the caller upholds
/// this via the `index mod num_threads` partition.
///
/// The pool succeeds iff every worker's task returned `Ok`; the first
/// error observed at join time is returned (workers that already started
/// are allowed to run to completion — spec.md §4.4/§5 "Cancellation").
#[instrument(skip(task))]
pub fn run<F>(task: F) -> Result<(), SquashmergeError>
where
    F: Fn(usize, usize) -> Result<(), SquashmergeError> + Sync,
{
    let num_threads = thread_count();
    debug!(num_threads, "starting worker pool");

    let results: Vec<Result<(), SquashmergeError>> = thread::scope(|scope| {
        let handles: Vec<_> = (0..num_threads)
            .map(|thread_no| scope.spawn(move || task(thread_no, num_threads)))
            .collect();

        handles
            .into_iter()
            .map(|h| h.join().unwrap_or(Err(SquashmergeError::WorkerPanicked)))
            .collect()
    });

    results.into_iter().find(|r| r.is_err()).unwrap_or(Ok(()))
}

/// Indices `[0, block_count)` assigned to `thread_no` out of `num_threads`,
/// in ascending order. Used by the Expander's decompress pass.
pub fn partition_forward(block_count: usize, thread_no: usize, num_threads: usize) -> Vec<usize> {
    (0..block_count).filter(|i| i % num_threads == thread_no).collect()
}

/// Same partition as [`partition_forward`], but descending — used by the
/// Squasher, which must walk blocks from `N-1` down to `0` to compute each
/// one's `prev_offset` (spec.md §4.7).
pub fn partition_reverse(block_count: usize, thread_no: usize, num_threads: usize) -> Vec<usize> {
    (0..block_count).rev().filter(|i| i % num_threads == thread_no).collect()
}
