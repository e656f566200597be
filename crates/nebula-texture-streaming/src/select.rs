//! In-place partitioning and budgeted selection.
//!
//! [`select_by_weight`] is a quickselect that, instead of looking for the
//! n-th element, looks for the longest sorted prefix whose accumulated weight
//! fits a budget. Each round partitions around a random pivot while summing
//! the weight of the smaller side, then recurses into whichever side holds the
//! boundary. Expected cost is linear in the slice length.

use std::cmp::Ordering;

use rand::Rng;

/// Move every element matching `pred` to the front. Returns the split index.
///
/// Relative order is not preserved.
pub fn partition_unstable<T>(items: &mut [T], mut pred: impl FnMut(&T) -> bool) -> usize {
    let mut front = 0;
    let mut back = items.len();
    while front < back {
        if pred(&items[front]) {
            front += 1;
            continue;
        }
        back -= 1;
        items.swap(front, back);
    }
    front
}

/// Move every element matching `pred` to the front, keeping relative order
/// on both sides. Returns the split index.
pub fn partition_stable<T: Copy>(items: &mut [T], mut pred: impl FnMut(&T) -> bool) -> usize {
    let (matching, rest): (Vec<T>, Vec<T>) = items.iter().partition(|item| pred(item));
    let split = matching.len();
    items[..split].copy_from_slice(&matching);
    items[split..].copy_from_slice(&rest);
    split
}

/// Reorder `items` so its first `k` elements are the `k` smallest under
/// `compare` and return the largest `k` whose summed `weight` is at most
/// `limit`.
///
/// The prefix is a set, not sorted. Weights must be non-negative. A negative
/// limit selects nothing.
pub fn select_by_weight<T, R, C, W>(
    items: &mut [T],
    limit: i64,
    rng: &mut R,
    compare: C,
    weight: W,
) -> usize
where
    R: Rng,
    C: Fn(&T, &T) -> Ordering,
    W: Fn(&T) -> i64,
{
    if limit < 0 {
        return 0;
    }

    let mut lo = 0;
    let mut hi = items.len();
    // Weight of items[..lo], all of which belong to the answer.
    let mut base = 0i64;

    while lo < hi {
        let pivot = rng.random_range(lo..hi);
        items.swap(pivot, hi - 1);

        let mut store = lo;
        let mut left = 0i64;
        for i in lo..hi - 1 {
            if compare(&items[i], &items[hi - 1]) == Ordering::Less {
                left += weight(&items[i]);
                items.swap(i, store);
                store += 1;
            }
        }
        items.swap(store, hi - 1);

        if base + left > limit {
            hi = store;
        } else if base + left + weight(&items[store]) > limit {
            return store;
        } else {
            base += left + weight(&items[store]);
            lo = store + 1;
        }
    }
    lo
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    use super::*;

    fn prefix_weight(items: &[(u32, i64)], k: usize) -> i64 {
        items[..k].iter().map(|&(_, w)| w).sum()
    }

    fn select(items: &mut [(u32, i64)], limit: i64, seed: u64) -> usize {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        select_by_weight(items, limit, &mut rng, |a, b| a.0.cmp(&b.0), |item| item.1)
    }

    #[test]
    fn test_unstable_partition_splits() {
        let mut items = [1, 8, 3, 6, 5, 2];
        let split = partition_unstable(&mut items, |v| v % 2 == 0);
        assert_eq!(split, 3);
        assert!(items[..split].iter().all(|v| v % 2 == 0));
        assert!(items[split..].iter().all(|v| v % 2 == 1));
    }

    #[test]
    fn test_stable_partition_keeps_order() {
        let mut items = [1, 8, 3, 6, 5, 2];
        let split = partition_stable(&mut items, |v| v % 2 == 0);
        assert_eq!(split, 3);
        assert_eq!(items, [8, 6, 2, 1, 3, 5]);
    }

    #[test]
    fn test_five_equal_items_balance_at_three() {
        let mut items: Vec<(u32, i64)> = (0..5).map(|i| (i, 300_000)).collect();
        assert_eq!(select(&mut items, 1_000_000, 1), 3);
        assert_eq!(prefix_weight(&items, 3), 900_000);
    }

    #[test]
    fn test_edge_limits() {
        let mut items: Vec<(u32, i64)> = (0..4).map(|i| (i, 10)).collect();
        assert_eq!(select(&mut items, 40, 3), 4);
        assert_eq!(select(&mut items, 9, 3), 0);
        assert_eq!(select(&mut items, -1, 3), 0);
        assert_eq!(select(&mut [], 100, 3), 0);
    }

    #[test]
    fn test_selected_prefix_is_smallest_and_fits() {
        let mut source = ChaCha8Rng::seed_from_u64(42);
        for round in 0..64 {
            let len = source.random_range(0..200);
            let mut items: Vec<(u32, i64)> = (0..len)
                .map(|i| (source.random_range(0..50) * 1000 + i, source.random_range(0..5000)))
                .collect();
            let limit = source.random_range(0..200_000);
            let k = select(&mut items, limit, round);

            assert!(prefix_weight(&items, k) <= limit);
            let mut sorted = items.clone();
            sorted.sort();
            let mut prefix = items[..k].to_vec();
            prefix.sort();
            assert_eq!(prefix, sorted[..k]);
            if k < items.len() {
                assert!(prefix_weight(&sorted, k + 1) > limit);
            }
        }
    }

    #[test]
    fn test_same_seed_same_order() {
        let build = || -> Vec<(u32, i64)> { (0..100).map(|i| ((i * 37) % 101, 10)).collect() };
        let mut a = build();
        let mut b = build();
        assert_eq!(select(&mut a, 500, 9), select(&mut b, 500, 9));
        assert_eq!(a, b);
    }
}
