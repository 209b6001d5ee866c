//! Fork-join loops over independent index ranges.
//!
//! Every helper runs on the rayon global pool. Bodies must only touch state
//! that is disjoint per index; the slice variants enforce that by handing
//! each index its own output element.

use std::ops::Range;

use rayon::prelude::*;

/// Run `body(i)` for every `i` in `range`, in parallel.
pub fn parallel_for<F>(range: Range<usize>, body: F)
where
    F: Fn(usize) + Sync + Send,
{
    match range.len() {
        0 => {}
        1 => body(range.start),
        _ => range.into_par_iter().for_each(body),
    }
}

/// [`parallel_for`] over a 64-bit range.
pub fn parallel_for_long<F>(range: Range<u64>, body: F)
where
    F: Fn(u64) + Sync + Send,
{
    if range.end <= range.start {
        return;
    }
    if range.end - range.start == 1 {
        body(range.start);
        return;
    }
    range.into_par_iter().for_each(body);
}

/// Set `out[i] = f(i)` for every index, in parallel.
pub fn parallel_fill<T, F>(out: &mut [T], f: F)
where
    T: Send,
    F: Fn(usize) -> T + Sync + Send,
{
    if out.len() == 1 {
        out[0] = f(0);
        return;
    }
    out.par_iter_mut()
        .enumerate()
        .for_each(|(i, slot)| *slot = f(i));
}

/// Set `outs[b][row] = f(b, row)` over the flattened `(batch, row)` pairs.
///
/// One task per pair, so a batch of short outputs still spreads across all
/// workers.
pub fn parallel_fill_batched<T, F>(outs: &mut [&mut [T]], f: F)
where
    T: Send,
    F: Fn(usize, usize) -> T + Sync + Send,
{
    outs.par_iter_mut()
        .enumerate()
        .flat_map(|(b, out)| {
            out.par_iter_mut()
                .enumerate()
                .map(move |(row, slot)| (b, row, slot))
        })
        .for_each(|(b, row, slot)| *slot = f(b, row));
}

/// Threads in the pool the helpers run on.
pub fn current_num_threads() -> usize {
    rayon::current_num_threads()
}

/// Size the global pool. Only the first call in a process takes effect;
/// `0` keeps the rayon default.
pub fn configure_global_pool(num_threads: usize) -> bool {
    rayon::ThreadPoolBuilder::new()
        .num_threads(num_threads)
        .thread_name(|i| format!("duplex-worker-{i}"))
        .build_global()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    #[test]
    fn test_parallel_for_visits_each_index_once() {
        let hits: Vec<AtomicUsize> = (0..1000).map(|_| AtomicUsize::new(0)).collect();
        parallel_for(0..1000, |i| {
            hits[i].fetch_add(1, Ordering::Relaxed);
        });
        assert!(hits.iter().all(|h| h.load(Ordering::Relaxed) == 1));
    }

    #[test]
    fn test_parallel_for_edge_ranges() {
        let count = AtomicUsize::new(0);
        parallel_for(5..5, |_| {
            count.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(count.load(Ordering::Relaxed), 0);

        parallel_for(7..8, |i| {
            assert_eq!(i, 7);
            count.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_parallel_for_long() {
        let sum = AtomicU64::new(0);
        parallel_for_long(1..101, |i| {
            sum.fetch_add(i, Ordering::Relaxed);
        });
        assert_eq!(sum.load(Ordering::Relaxed), 5050);
    }

    #[test]
    fn test_parallel_fill() {
        let mut out = vec![0usize; 257];
        parallel_fill(&mut out, |i| i * 2);
        assert!(out.iter().enumerate().all(|(i, &v)| v == i * 2));
    }

    #[test]
    fn test_parallel_fill_batched() {
        let mut a = vec![0usize; 3];
        let mut b = vec![0usize; 5];
        {
            let mut outs: Vec<&mut [usize]> = vec![&mut a, &mut b];
            parallel_fill_batched(&mut outs, |batch, row| batch * 100 + row);
        }
        assert_eq!(a, vec![0, 1, 2]);
        assert_eq!(b, vec![100, 101, 102, 103, 104]);
    }
}
