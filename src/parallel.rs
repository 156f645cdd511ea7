//! Parallel-for over index ranges, backed by a rayon thread pool.
//!
//! Every parallel region in the crate goes through [`ParallelContext`]. The
//! degree of parallelism is fixed when the context is built; a context with a
//! single thread runs everything inline on the calling thread and never
//! touches rayon.
//!
//! Closures receive a thread id in `0..num_threads()` so callers can index
//! per-thread scratch storage without further synchronization.

use crate::error::{LinAlgError, LinAlgResult};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::ops::Range;
use std::sync::Arc;

/// Handle to the worker threads used by the eliminator and the partitioned view.
#[derive(Debug, Clone, Default)]
pub struct ParallelContext {
    pool: Option<Arc<ThreadPool>>,
}

impl ParallelContext {
    /// Build a context with its own pool of `num_threads` workers.
    pub fn new(num_threads: usize) -> LinAlgResult<Self> {
        if num_threads == 0 {
            return Err(LinAlgError::InvalidInput(
                "num_threads must be at least 1".to_string(),
            ));
        }
        if num_threads == 1 {
            return Ok(Self::sequential());
        }
        let pool = ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|i| format!("block-schur-{i}"))
            .build()?;
        Ok(Self {
            pool: Some(Arc::new(pool)),
        })
    }

    /// Wrap a caller-owned pool.
    pub fn with_pool(pool: Arc<ThreadPool>) -> Self {
        if pool.current_num_threads() <= 1 {
            Self::sequential()
        } else {
            Self { pool: Some(pool) }
        }
    }

    /// Context that runs everything on the calling thread.
    pub fn sequential() -> Self {
        Self { pool: None }
    }

    pub fn num_threads(&self) -> usize {
        self.pool
            .as_ref()
            .map(|pool| pool.current_num_threads())
            .unwrap_or(1)
    }

    pub fn is_parallel(&self) -> bool {
        self.pool.is_some()
    }

    /// Run `f(i)` for every `i` in `range`, in unspecified order.
    pub fn for_each<F>(&self, range: Range<usize>, f: F)
    where
        F: Fn(usize) + Send + Sync,
    {
        match &self.pool {
            None => range.for_each(f),
            Some(pool) => pool.install(|| range.into_par_iter().for_each(f)),
        }
    }

    /// Run `f(thread_id, i)` for every `i` in `range`.
    pub fn for_each_with_thread<F>(&self, range: Range<usize>, f: F)
    where
        F: Fn(usize, usize) + Send + Sync,
    {
        match &self.pool {
            None => range.for_each(|i| f(0, i)),
            Some(pool) => pool.install(|| {
                range
                    .into_par_iter()
                    .for_each(|i| f(current_thread_id(), i))
            }),
        }
    }

    /// Run `f(thread_id, i, &mut items[i])` for every item. Items are disjoint,
    /// so no locking is needed to mutate them.
    pub fn for_each_mut<T, F>(&self, items: &mut [T], f: F)
    where
        T: Send,
        F: Fn(usize, usize, &mut T) + Send + Sync,
    {
        match &self.pool {
            None => items
                .iter_mut()
                .enumerate()
                .for_each(|(i, item)| f(0, i, item)),
            Some(pool) => pool.install(|| {
                items
                    .par_iter_mut()
                    .enumerate()
                    .for_each(|(i, item)| f(current_thread_id(), i, item))
            }),
        }
    }
}

fn current_thread_id() -> usize {
    rayon::current_thread_index().unwrap_or(0)
}

/// Split `data` into consecutive mutable pieces of the given lengths.
///
/// Panics if the lengths add up to more than `data.len()`.
pub fn partition_mut<T>(
    mut data: &mut [T],
    lengths: impl IntoIterator<Item = usize>,
) -> Vec<&mut [T]> {
    let lengths = lengths.into_iter();
    let mut parts = Vec::with_capacity(lengths.size_hint().0);
    for len in lengths {
        let (head, tail) = std::mem::take(&mut data).split_at_mut(len);
        parts.push(head);
        data = tail;
    }
    parts
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_zero_threads_rejected() {
        assert!(ParallelContext::new(0).is_err());
    }

    #[test]
    fn test_single_thread_is_sequential() {
        let ctx = ParallelContext::new(1).unwrap();
        assert!(!ctx.is_parallel());
        assert_eq!(ctx.num_threads(), 1);
    }

    #[test]
    fn test_for_each_visits_every_index() {
        for threads in [1, 4] {
            let ctx = ParallelContext::new(threads).unwrap();
            let sum = AtomicUsize::new(0);
            ctx.for_each(0..100, |i| {
                sum.fetch_add(i, Ordering::Relaxed);
            });
            assert_eq!(sum.load(Ordering::Relaxed), 4950);
        }
    }

    #[test]
    fn test_thread_ids_in_range() {
        let ctx = ParallelContext::new(3).unwrap();
        let max_id = AtomicUsize::new(0);
        ctx.for_each_with_thread(0..64, |thread_id, _| {
            max_id.fetch_max(thread_id, Ordering::Relaxed);
        });
        assert!(max_id.load(Ordering::Relaxed) < 3);
    }

    #[test]
    fn test_for_each_mut_writes_disjoint_items() {
        let ctx = ParallelContext::new(4).unwrap();
        let mut items = vec![0usize; 33];
        ctx.for_each_mut(&mut items, |_, i, item| *item = i * 2);
        for (i, item) in items.iter().enumerate() {
            assert_eq!(*item, i * 2);
        }
    }

    #[test]
    fn test_partition_mut() {
        let mut data = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let parts = partition_mut(&mut data, [2, 0, 3]);
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], &[1.0, 2.0]);
        assert!(parts[1].is_empty());
        assert_eq!(parts[2], &[3.0, 4.0, 5.0]);
    }
}
