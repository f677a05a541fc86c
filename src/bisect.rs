//! Recursive coordinate bisection.
//!
//! Each level bisects the current process group. The dots of the group are
//! cut along the widest dimension of their bounding box so that the weight
//! below the cut matches the share of the left daughter group, migrated to the
//! daughter groups, and the daughter groups continue independently until every
//! group consists of a single process.

use itertools::Itertools;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::{
    comm::Coordinator,
    config::RcbConfig,
    constants::EMPTY_GROUP_CUT,
    dot::Dot,
    error::RcbResult,
    geometry::BoundingBox,
    tools::range_to_blocks,
    tree::{split_sizes, CutNode},
};

/// Number of bisection levels needed for `size` processes, `ceil(log2(size))`.
pub fn tree_depth(size: usize) -> usize {
    if size <= 1 {
        return 0;
    }
    (usize::BITS - (size - 1).leading_zeros()) as usize
}

/// Relative tolerance applied at each level.
///
/// Per-level deviations compound along a root-to-leaf path of `depth` levels,
/// so each level may only deviate by the `depth`-th root of the final tolerance.
pub fn level_tolerance(imbalance_tol: f64, depth: usize) -> f64 {
    if depth == 0 {
        return imbalance_tol;
    }
    (1.0 + imbalance_tol).powf(1.0 / depth as f64) - 1.0
}

/// Diagnostic for a level whose weight split missed its tolerance.
///
/// The tolerance checked here is the per-level share of the run tolerance,
/// see [level_tolerance]. A warning therefore does not imply that the final
/// partition exceeds the run tolerance. The run continues with the best cut found.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImbalanceWarning {
    /// Recursion level, zero at the root.
    pub level: usize,
    /// First rank of the bisected group.
    pub first: usize,
    /// One past the last rank of the bisected group.
    pub end: usize,
    /// Cut dimension.
    pub dim: usize,
    /// Intended fraction of the group weight below the cut.
    pub target_fraction: f64,
    /// Achieved fraction of the group weight below the cut.
    pub achieved_fraction: f64,
    /// Median search iterations used.
    pub iterations: usize,
}

impl std::fmt::Display for ImbalanceWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "level {} group [{}, {}): weight fraction {:.4} below cut in dimension {} (target {:.4}) after {} iterations",
            self.level,
            self.first,
            self.end,
            self.achieved_fraction,
            self.dim,
            self.target_fraction,
            self.iterations
        )
    }
}

/// Statistics of one level on a process's path.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LevelRecord {
    /// Recursion level, zero at the root.
    pub level: usize,
    /// First rank of the bisected group.
    pub first: usize,
    /// One past the last rank of the bisected group.
    pub end: usize,
    /// Cut dimension.
    pub dim: usize,
    /// Cut position.
    pub position: f64,
    /// Weight the left group should receive.
    pub target_weight: f64,
    /// Weight the left group received.
    pub left_weight: f64,
    /// Weight of the whole group.
    pub total_weight: f64,
    /// Median search iterations used.
    pub iterations: usize,
    /// True if the split met its tolerance.
    pub converged: bool,
    /// True if the dots were split by count because all coordinates coincide.
    pub count_split: bool,
}

/// Outcome of a median search.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct MedianSearch {
    /// Best cut position found.
    pub position: f64,
    /// Group weight at or below `position`.
    pub left_weight: f64,
    /// Iterations used.
    pub iterations: usize,
    /// True if the weight at `position` is within tolerance of the target.
    pub converged: bool,
}

/// Parameters of a median search along one dimension.
#[derive(Copy, Clone, Debug)]
pub struct MedianProblem {
    /// Cut dimension.
    pub dim: usize,
    /// Lower end of the search interval.
    pub lower: f64,
    /// Upper end of the search interval.
    pub upper: f64,
    /// Group weight the lower side should receive.
    pub target: f64,
    /// Group weight of all dots.
    pub total: f64,
    /// Absolute deviation from `target` that is accepted.
    pub tolerance: f64,
    /// Iteration cap.
    pub max_iterations: usize,
    /// Count every dot with weight one instead of its own weight.
    pub unit_weights: bool,
}

/// Search for a cut position by interval halving on the coordinate.
///
/// Every iteration performs exactly one reduction over the group, so all
/// ranks of the group stay in lockstep. The search ends when the weight at
/// or below the cut is within tolerance, when no dot lies strictly inside the
/// remaining interval, or after `max_iterations` iterations.
pub fn find_median<C: Coordinator>(
    dots: &[Dot],
    problem: &MedianProblem,
    comm: &C,
) -> MedianSearch {
    let dim = problem.dim;
    let weight_of = |dot: &Dot| if problem.unit_weights { 1.0 } else { dot.weight };
    let deviation = |weight: f64| (weight - problem.target).abs();

    let mut lower = problem.lower;
    let mut upper = problem.upper;

    // Cutting at the upper end puts every dot on the lower side.
    let mut best = MedianSearch {
        position: upper,
        left_weight: problem.total,
        iterations: 0,
        converged: deviation(problem.total) <= problem.tolerance,
    };

    if best.converged {
        return best;
    }

    for iteration in 1..=problem.max_iterations {
        let cut = 0.5 * (lower + upper);

        // Weight at or below the cut and the number of dots whose side
        // changes for some cut in either half of the current interval.
        // Dots on the cut itself move for any lower cut.
        let mut local = [0.0; 3];
        for dot in dots {
            let x = dot.coords[dim];
            if x <= cut {
                local[0] += weight_of(dot);
                if x > lower {
                    local[1] += 1.0;
                }
            } else if x < upper {
                local[2] += 1.0;
            }
        }

        let global = comm.reduce_sum(&local);
        let weight = global[0];

        best.iterations = iteration;

        if deviation(weight) < deviation(best.left_weight) {
            best.position = cut;
            best.left_weight = weight;
        }

        if deviation(best.left_weight) <= problem.tolerance {
            best.converged = true;
            break;
        }

        // Move towards the target and stop once no dot can change the weight.
        if weight < problem.target {
            lower = cut;
            if global[2] == 0.0 {
                break;
            }
        } else {
            upper = cut;
            if global[1] == 0.0 {
                break;
            }
        }
    }

    best
}

/// Dots and records a process holds after recursive bisection.
#[derive(Clone, Debug)]
pub struct BisectionOutcome {
    /// Dots resident on this process after the final migration.
    pub dots: Vec<Dot>,
    /// Cuts recorded by this process as leader of a group.
    pub nodes: Vec<CutNode>,
    /// Region of space assigned to this process.
    pub region: BoundingBox,
    /// Imbalance warnings of the groups this process belonged to.
    pub warnings: Vec<ImbalanceWarning>,
    /// Per-level statistics, empty unless history is kept.
    pub history: Vec<LevelRecord>,
}

/// Level-independent parameters of a run.
struct RunParameters {
    dims: usize,
    level_tol: f64,
    max_iterations: usize,
    keep_history: bool,
}

/// Recursively bisect the dots over all processes of `comm`.
///
/// Returns the dots that end up on the calling process.
pub fn recursive_bisection<C: Coordinator>(
    dots: Vec<Dot>,
    config: &RcbConfig,
    comm: &C,
) -> RcbResult<BisectionOutcome> {
    let params = RunParameters {
        dims: config.dimensions,
        level_tol: level_tolerance(config.imbalance_tol, tree_depth(comm.size())),
        max_iterations: config.max_iterations,
        keep_history: config.keep_history,
    };

    // The root region is the bounding box of all dots.
    let total_count = comm.reduce_sum(&[dots.len() as f64])[0];
    let region = if total_count > 0.0 {
        BoundingBox::compute(&dots, params.dims, comm)?
    } else {
        BoundingBox::empty(params.dims)
    };

    let mut outcome = BisectionOutcome {
        dots,
        nodes: Vec::new(),
        region,
        warnings: Vec::new(),
        history: Vec::new(),
    };

    bisect_group(&mut outcome, comm, 0, 0, &params)?;

    Ok(outcome)
}

/// How the dots of a group are divided at one level.
struct Cut {
    dim: usize,
    position: f64,
    left: Vec<Dot>,
    right: Vec<Dot>,
    iterations: usize,
    converged: bool,
    count_split: bool,
}

fn bisect_group<C: Coordinator>(
    outcome: &mut BisectionOutcome,
    comm: &C,
    first: usize,
    level: usize,
    params: &RunParameters,
) -> RcbResult<()> {
    let size = comm.size();
    let rank = comm.rank();

    if size == 1 {
        return Ok(());
    }

    let (left_size, right_size) = split_sizes(size);
    let fraction = left_size as f64 / size as f64;

    // Group totals decide how the cut is found.

    let local_weight = outcome.dots.iter().map(|dot| dot.weight).sum::<f64>();
    let totals = comm.reduce_sum(&[local_weight, outcome.dots.len() as f64]);
    let (total_weight, total_count) = (totals[0], totals[1] as usize);

    let dots = std::mem::take(&mut outcome.dots);

    let cut = if total_count == 0 {
        Cut {
            dim: 0,
            position: EMPTY_GROUP_CUT,
            left: dots,
            right: Vec::new(),
            iterations: 0,
            converged: true,
            count_split: false,
        }
    } else {
        let bounding_box = BoundingBox::compute(&dots, params.dims, comm)?;
        let dim = bounding_box.widest_dimension();

        if bounding_box.extent(dim) == 0.0 {
            split_by_count(dots, dim, bounding_box.min()[dim], total_count, fraction, comm)
        } else {
            // Without any weight the split falls back to dot counts.
            let unit_weights = total_weight <= 0.0;
            let total = if unit_weights {
                total_count as f64
            } else {
                total_weight
            };
            let target = fraction * total;

            let problem = MedianProblem {
                dim,
                lower: bounding_box.min()[dim],
                upper: bounding_box.max()[dim],
                target,
                total,
                tolerance: params.level_tol * f64::min(target, total - target),
                max_iterations: params.max_iterations,
                unit_weights,
            };

            let search = find_median(&dots, &problem, comm);

            let (left, right): (Vec<Dot>, Vec<Dot>) = dots
                .into_iter()
                .partition(|dot| dot.coords[dim] <= search.position);

            Cut {
                dim,
                position: search.position,
                left,
                right,
                iterations: search.iterations,
                converged: search.converged,
                count_split: false,
            }
        }
    };

    // The achieved split is judged by weight, also for count splits.

    let left_weight = comm.reduce_sum(&[cut.left.iter().map(|dot| dot.weight).sum::<f64>()])[0];
    let target_weight = fraction * total_weight;

    let converged = if cut.count_split {
        (left_weight - target_weight).abs()
            <= params.level_tol * f64::min(target_weight, total_weight - target_weight)
    } else {
        cut.converged
    };

    let mid = first + left_size;
    let end = first + size;

    if rank == 0 {
        debug!(
            "Level {} group [{}, {}): cut dimension {} at {} with weight {} of {} ({} iterations).",
            level, first, end, cut.dim, cut.position, left_weight, total_weight, cut.iterations
        );
        outcome.nodes.push(CutNode {
            dim: cut.dim,
            position: cut.position,
            first,
            mid,
            end,
        });
    }

    if !converged {
        let achieved_fraction = if total_weight > 0.0 {
            left_weight / total_weight
        } else {
            fraction
        };
        let imbalance = ImbalanceWarning {
            level,
            first,
            end,
            dim: cut.dim,
            target_fraction: fraction,
            achieved_fraction,
            iterations: cut.iterations,
        };
        if rank == 0 {
            warn!("Imbalanced cut: {}", imbalance);
        }
        outcome.warnings.push(imbalance);
    }

    if params.keep_history {
        outcome.history.push(LevelRecord {
            level,
            first,
            end,
            dim: cut.dim,
            position: cut.position,
            target_weight,
            left_weight,
            total_weight,
            iterations: cut.iterations,
            converged,
            count_split: cut.count_split,
        });
    }

    // Move the dots to their daughter group and continue there.

    outcome.dots = migrate(cut.left, cut.right, left_size, right_size, comm);

    let (lower_region, upper_region) = outcome.region.split(cut.dim, cut.position);

    let sub_comm = comm.split_group(left_size, right_size);

    if rank < left_size {
        outcome.region = lower_region;
        bisect_group(outcome, &sub_comm, first, level + 1, params)
    } else {
        outcome.region = upper_region;
        bisect_group(outcome, &sub_comm, mid, level + 1, params)
    }
}

/// Split dots that all share the same coordinates by their global index.
///
/// The lower side receives `ceil(total_count * fraction)` dots.
fn split_by_count<C: Coordinator>(
    mut dots: Vec<Dot>,
    dim: usize,
    position: f64,
    total_count: usize,
    fraction: f64,
    comm: &C,
) -> Cut {
    let rank = comm.rank();
    let counts = comm.gather_counts(&[dots.len()]);
    let offset = counts[..rank].iter().sum::<usize>();

    let left_count = (fraction * total_count as f64).ceil() as usize;
    let keep = left_count.saturating_sub(offset).min(dots.len());

    let right = dots.split_off(keep);

    Cut {
        dim,
        position,
        left: dots,
        right,
        iterations: 0,
        converged: true,
        count_split: true,
    }
}

/// Send the left dots to the left daughter group and the right dots to the right one.
///
/// Within each daughter group the dots are block-distributed by count in the
/// order of their current rank, so every daughter process ends up with the
/// same number of dots up to one.
fn migrate<C: Coordinator>(
    left: Vec<Dot>,
    right: Vec<Dot>,
    left_size: usize,
    right_size: usize,
    comm: &C,
) -> Vec<Dot> {
    let rank = comm.rank();

    // counts[2 * r] and counts[2 * r + 1] hold the left and right counts of rank r.
    let counts = comm.gather_counts(&[left.len(), right.len()]);

    let left_counts = counts.iter().step_by(2).copied().collect_vec();
    let right_counts = counts.iter().skip(1).step_by(2).copied().collect_vec();

    let left_offset = left_counts[..rank].iter().sum::<usize>();
    let right_offset = right_counts[..rank].iter().sum::<usize>();

    let mut send_counts = range_to_blocks(
        left_offset,
        left.len(),
        left_counts.iter().sum(),
        left_size,
    );
    send_counts.extend(range_to_blocks(
        right_offset,
        right.len(),
        right_counts.iter().sum(),
        right_size,
    ));

    let mut send = left;
    send.extend(right);

    let (received, _) = comm.exchange_dots(&send, &send_counts);

    received
}
