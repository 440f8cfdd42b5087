//! Deterministic batch partitioning across ranks.

use std::ops::Range;

/// Prefix array of batch-axis split points: rank `r` owns rows
/// `assign_idx[r]..assign_idx[r + 1]`.
///
/// Ranges are contiguous, non-overlapping, ceiling-rounded, and cover
/// `0..batch` exactly: `assign_idx[0] == 0`, `assign_idx[n_ranks] == batch`.
pub fn assign_indices(batch: usize, n_ranks: usize) -> Vec<usize> {
    debug_assert!(n_ranks > 0);
    (0..=n_ranks).map(|r| (r * batch).div_ceil(n_ranks)).collect()
}

/// The batch-axis range rank `rank` owns.
pub fn rank_range(batch: usize, n_ranks: usize, rank: usize) -> Range<usize> {
    debug_assert!(rank < n_ranks);
    (rank * batch).div_ceil(n_ranks)..((rank + 1) * batch).div_ceil(n_ranks)
}
