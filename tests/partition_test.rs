use lockstep::partition::{assign_indices, rank_range};
use proptest::prelude::*;

#[test]
fn ceil_quartiles_match_expected() {
    assert_eq!(assign_indices(101, 4), vec![0, 26, 51, 76, 101]);
}

#[test]
fn degenerate_batches() {
    assert_eq!(assign_indices(0, 4), vec![0, 0, 0, 0, 0]);
    assert_eq!(assign_indices(3, 4), vec![0, 1, 2, 3, 3]);
    assert_eq!(assign_indices(4, 1), vec![0, 4]);
}

proptest! {
    #[test]
    fn partitions_cover_exactly(batch in 0usize..50_000, n_ranks in 1usize..64) {
        let idx = assign_indices(batch, n_ranks);
        prop_assert_eq!(idx.len(), n_ranks + 1);
        prop_assert_eq!(idx[0], 0);
        prop_assert_eq!(idx[n_ranks], batch);
        for r in 0..n_ranks {
            prop_assert!(idx[r] <= idx[r + 1]);
            prop_assert_eq!(rank_range(batch, n_ranks, r), idx[r]..idx[r + 1]);
        }
        let covered: usize = (0..n_ranks).map(|r| rank_range(batch, n_ranks, r).len()).sum();
        prop_assert_eq!(covered, batch);
    }

    #[test]
    fn ranges_are_balanced_within_one_row(batch in 0usize..50_000, n_ranks in 1usize..64) {
        let sizes: Vec<usize> = (0..n_ranks)
            .map(|r| rank_range(batch, n_ranks, r).len())
            .collect();
        let smallest = sizes.iter().copied().min().unwrap_or(0);
        let largest = sizes.iter().copied().max().unwrap_or(0);
        prop_assert!(largest - smallest <= 1);
    }
}
