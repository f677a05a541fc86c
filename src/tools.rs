//! Utility routines.

use itertools::{izip, Itertools};
use num::traits::Zero;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::{
    comm::Coordinator,
    constants::MAX_DIMENSIONS,
    error::{RcbError, RcbResult},
};

/// Make every rank of the group fail if any rank failed.
///
/// A fatal error on a single rank must not leave the remaining ranks waiting
/// in the next collective. Each rank contributes its status code. A failing
/// rank returns its own error, every other rank returns an error naming the
/// lowest failing rank.
pub fn agree_on_status<C: Coordinator>(status: RcbResult<()>, comm: &C) -> RcbResult<()> {
    let code = match &status {
        Ok(()) => 0,
        Err(err) => err.code(),
    };

    let codes = comm.gather_counts(&[code]);

    status?;

    if let Some((rank, &code)) = codes.iter().find_position(|&&code| code != 0) {
        return Err(RcbError::from_remote(code, rank));
    }

    Ok(())
}

/// Compute displacements from a vector of counts.
///
/// This is useful for global varcount operations. Let
/// count [ 3, 4, 5]. Then the corresponding displacements are
/// [0, 3, 7]. Note that the last element `5` is ignored.
pub fn displacements<T: Zero + Copy>(counts: &[T]) -> Vec<T> {
    counts
        .iter()
        .scan(T::zero(), |acc, &x| {
            let tmp = *acc;
            *acc = *acc + x;
            Some(tmp)
        })
        .collect()
}

/// First global position owned by each of `parts` blocks when `total`
/// items are distributed as evenly as possible.
///
/// The first `total % parts` blocks receive one item more than the others.
pub fn block_starts(total: usize, parts: usize) -> Vec<usize> {
    let w = total / parts;
    let k = total % parts;

    let mut bins = Vec::<usize>::with_capacity(parts);

    for p in 1..=parts {
        if p <= k {
            bins.push((p - 1) * (1 + w));
        } else {
            bins.push((p - 1) * w + k);
        }
    }

    bins
}

/// Distribute a sorted sequence into bins.
///
/// For an array with n elements to be distributed into p bins,
/// the array `bins` has p elements. The bins are defined by half-open intervals
/// of the form [b_j, b_{j+1})). The final bin is the half-open interval [b_{p-1}, \infty).
/// It is assumed that the bins and the elements are both sorted sequences and that
/// every element has an associated bin.
/// The function returns a p element array with the counts of how many elements go to each bin.
/// Since the sequence is sorted this fully defines what element goes into which bin.
pub fn sort_to_bins<T: Ord>(sorted_keys: &[T], bins: &[T]) -> Vec<usize> {
    let nbins = bins.len();

    assert!(nbins > 0, "At least one bin is required.");

    let mut bin_counts = vec![0; nbins];

    let (Some(first_bin), Some(first_key)) = (bins.first(), sorted_keys.first()) else {
        return bin_counts;
    };

    // Make sure that the smallest element of the sorted keys fits into the bins.
    assert!(first_bin <= first_key);

    // Deal with the special case that there is only one bin.
    // This means that all elements are in the one bin.
    if nbins == 1 {
        bin_counts[0] = sorted_keys.len();
        return bin_counts;
    }

    let mut count = 0;

    {
        // This iterates over each possible bin. The last bin position is not
        // iterated over since for an array with p elements there are p-1 tuple windows.
        let mut bin_iter = izip!(
            bin_counts.iter_mut(),
            bins.iter().tuple_windows::<(&T, &T)>(),
        );

        // There is always at least one window since there are at least two bins.
        let mut current = bin_iter.next();

        'outer: for key in sorted_keys.iter() {
            // Move the bin forward until it fits.
            loop {
                match current.as_mut() {
                    Some((r, (bin_start, bin_end))) if *bin_start <= key && key < *bin_end => {
                        **r += 1;
                        count += 1;
                        break;
                    }
                    Some(_) => current = bin_iter.next(),
                    // We have no more fitting bin. So break the outer loop.
                    None => break 'outer,
                }
            }
        }
    }

    // We now have everything but the last bin. Just bunch the remaining elements to
    // the last count.
    bin_counts[nbins - 1] = sorted_keys.len() - count;

    bin_counts
}

/// Number of items a contiguous global range sends to each block.
///
/// The caller owns the global positions `offset..offset + len` of a sequence
/// of `total` items that is block-distributed over `parts` targets.
pub fn range_to_blocks(offset: usize, len: usize, total: usize, parts: usize) -> Vec<usize> {
    let positions = (offset..offset + len).collect_vec();
    sort_to_bins(&positions, &block_starts(total, parts))
}

/// Generate random points in the unit cube for testing.
///
/// Coordinates beyond `dims` are zero.
pub fn generate_random_points<R: Rng>(
    npoints: usize,
    dims: usize,
    rng: &mut R,
) -> Vec<[f64; MAX_DIMENSIONS]> {
    (0..npoints)
        .map(|_| {
            let mut point = [0.0; MAX_DIMENSIONS];
            for coord in point.iter_mut().take(dims) {
                *coord = rng.gen();
            }
            point
        })
        .collect()
}

/// Get a seeded rng
pub fn seeded_rng(seed: usize) -> ChaCha8Rng {
    ChaCha8Rng::seed_from_u64(seed as u64)
}

#[cfg(test)]
mod test {
    use itertools::Itertools;

    use super::{agree_on_status, block_starts, displacements, range_to_blocks, sort_to_bins};
    use crate::{
        comm::{run_threaded, Coordinator},
        error::RcbError,
    };

    #[test]
    fn test_sort_to_bins() {
        let elems = (0..100).collect_vec();
        let bins = [0, 17, 55];

        let counts = sort_to_bins(&elems, &bins);

        assert_eq!(counts[0], 17);
        assert_eq!(counts[1], 38);
        assert_eq!(counts[2], 45);
    }

    #[test]
    fn test_sort_to_bins_empty_and_repeated() {
        let empty: [usize; 0] = [];
        assert_eq!(sort_to_bins(&empty, &[0, 3]), vec![0, 0]);

        // Repeated bin starts describe empty bins.
        assert_eq!(sort_to_bins(&[0, 1], &[0, 1, 1, 2]), vec![1, 0, 1, 0]);
    }

    #[test]
    fn test_block_starts() {
        assert_eq!(block_starts(10, 3), vec![0, 4, 7]);
        assert_eq!(block_starts(2, 4), vec![0, 1, 2, 2]);
    }

    #[test]
    fn test_range_to_blocks() {
        // 10 items over 3 blocks: [0, 4), [4, 7), [7, 10).
        assert_eq!(range_to_blocks(3, 5, 10, 3), vec![1, 3, 1]);
        assert_eq!(range_to_blocks(0, 0, 0, 2), vec![0, 0]);
    }

    #[test]
    fn test_displacements() {
        assert_eq!(displacements(&[3, 4, 5]), vec![0, 3, 7]);
    }

    #[test]
    fn test_agree_on_status() {
        let results = run_threaded(3, |comm| {
            let status = if comm.rank() == 1 {
                Err(RcbError::Configuration("missing callback".to_string()))
            } else {
                Ok(())
            };
            agree_on_status(status, &comm)
        });

        for result in results {
            assert!(matches!(result, Err(RcbError::Configuration(_))));
        }
    }
}
