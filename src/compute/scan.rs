//! Chunked stream compaction: count, exclusive scan, then gather or scatter.
//!
//! Each primitive runs as three barrier-separated passes over fixed-size
//! chunks. Pass 1 counts per chunk in parallel, pass 2 scans the (small)
//! count array, pass 3 lets every chunk write into its own disjoint slice of
//! the output.

use rayon::prelude::*;

/// Exclusive prefix sum. Returns per-chunk offsets and the grand total.
pub fn exclusive_scan(counts: &[usize]) -> (Vec<usize>, usize) {
    let mut offsets = Vec::with_capacity(counts.len());
    let mut running = 0usize;
    for &count in counts {
        offsets.push(running);
        running += count;
    }
    (offsets, running)
}

/// Split `out` into consecutive disjoint slices starting at `offsets`.
pub fn split_at_offsets<'a, T>(mut out: &'a mut [T], offsets: &[usize]) -> Vec<&'a mut [T]> {
    let mut slices = Vec::with_capacity(offsets.len());
    let total = out.len();
    for (k, &start) in offsets.iter().enumerate() {
        let end = offsets.get(k + 1).copied().unwrap_or(total);
        let (head, tail) = std::mem::take(&mut out).split_at_mut(end - start);
        slices.push(head);
        out = tail;
    }
    slices
}

/// Gather the entries of `input` that satisfy `keep`, preserving order.
pub fn compact<T, F>(input: &[T], stride: usize, keep: F) -> Vec<T>
where
    T: Copy + Default + Send + Sync,
    F: Fn(&T) -> bool + Sync,
{
    let counts: Vec<usize> = input
        .par_chunks(stride)
        .map(|chunk| chunk.iter().filter(|v| keep(v)).count())
        .collect();

    let (offsets, total) = exclusive_scan(&counts);
    let mut out = vec![T::default(); total];

    split_at_offsets(&mut out, &offsets)
        .into_par_iter()
        .zip(input.par_chunks(stride))
        .for_each(|(dst, chunk)| {
            for (slot, value) in dst.iter_mut().zip(chunk.iter().filter(|v| keep(v))) {
                *slot = *value;
            }
        });

    out
}

/// Let every input entry emit zero or more outputs, concatenated in input order.
///
/// `emit` is called twice per entry (count pass and scatter pass) and must
/// produce the same sequence both times.
pub fn expand<T, U, F>(input: &[T], stride: usize, emit: F) -> Vec<U>
where
    T: Sync,
    U: Copy + Default + Send + Sync,
    F: Fn(&T, &mut dyn FnMut(U)) + Sync,
{
    let counts: Vec<usize> = input
        .par_chunks(stride)
        .map(|chunk| {
            let mut count = 0usize;
            for value in chunk {
                emit(value, &mut |_: U| count += 1);
            }
            count
        })
        .collect();

    let (offsets, total) = exclusive_scan(&counts);
    let mut out = vec![U::default(); total];

    split_at_offsets(&mut out, &offsets)
        .into_par_iter()
        .zip(input.par_chunks(stride))
        .for_each(|(dst, chunk)| {
            let mut cursor = 0usize;
            for value in chunk {
                emit(value, &mut |item: U| {
                    dst[cursor] = item;
                    cursor += 1;
                });
            }
        });

    out
}
