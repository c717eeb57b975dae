use std::ops::Range;

/// Splits `total` samples among `ranks` and returns `rank`'s share.
///
/// Ranges are contiguous, disjoint and cover `0..total`, their sizes differ
/// by at most one.
pub fn shard_range(total: usize, rank: usize, ranks: usize) -> Range<usize> {
    debug_assert!(rank < ranks, "rank {rank} out of {ranks}");

    let base = total / ranks;
    let rem = total % ranks;

    let start = rank * base + rank.min(rem);
    let end = start + base + usize::from(rank < rem);

    start..end
}
