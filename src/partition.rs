//! The partitioning context.
//!
//! A [Partitioner] owns everything a process needs for a partitioning run:
//! the registered callbacks, the configuration, the dot store and the
//! partition tree of the last run. Nothing is shared between contexts.

use itertools::izip;
use log::info;
use serde::{Deserialize, Serialize};

use crate::{
    bisect::{recursive_bisection, BisectionOutcome, ImbalanceWarning, LevelRecord},
    callbacks::{ObjectCallbacks, ObjectId},
    comm::Coordinator,
    config::RcbConfig,
    dot::{Dot, DotStore},
    error::{RcbError, RcbResult},
    geometry::BoundingBox,
    tools::agree_on_status,
    tree::PartitionTree,
};

/// Global load statistics of a partition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PartitionStats {
    /// Number of dots over all processes.
    pub num_dots: usize,
    /// Smallest number of dots on a process.
    pub min_dots: usize,
    /// Largest number of dots on a process.
    pub max_dots: usize,
    /// Weight of all dots.
    pub total_weight: f64,
    /// Smallest weight on a process.
    pub min_weight: f64,
    /// Largest weight on a process.
    pub max_weight: f64,
    /// Average weight per process.
    pub avg_weight: f64,
    /// Ratio of the largest to the average weight.
    pub imbalance: f64,
}

impl std::fmt::Display for PartitionStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "dots: {} (min {}, max {}), weight: {} (min {}, max {}, avg {}), imbalance: {:.4}",
            self.num_dots,
            self.min_dots,
            self.max_dots,
            self.total_weight,
            self.min_weight,
            self.max_weight,
            self.avg_weight,
            self.imbalance
        )
    }
}

/// The result of a partitioning run on one process.
#[derive(Clone, Debug)]
pub struct PartitionResult {
    /// Rank of the process the result belongs to.
    pub rank: usize,
    /// The local objects in enumeration order.
    pub objects: Vec<ObjectId>,
    /// Destination process of each local object. Equal to `rank` if it stays.
    pub destinations: Vec<usize>,
    /// Dots assigned to this process.
    pub dots: Vec<Dot>,
    /// Region of space assigned to this process.
    pub region: BoundingBox,
    /// The replicated partition tree.
    pub tree: PartitionTree,
    /// Imbalance diagnostics of the groups this process belonged to.
    pub warnings: Vec<ImbalanceWarning>,
    /// Per-level statistics if history is kept.
    pub history: Vec<LevelRecord>,
    /// Global load statistics.
    pub stats: PartitionStats,
}

impl PartitionResult {
    /// Objects that leave this process, with their destination.
    pub fn exports(&self) -> impl Iterator<Item = (ObjectId, usize)> + '_ {
        izip!(self.objects.iter(), self.destinations.iter())
            .filter(|&(_, &destination)| destination != self.rank)
            .map(|(&id, &destination)| (id, destination))
    }
}

/// A partitioning context for one process.
pub struct Partitioner {
    config: RcbConfig,
    callbacks: ObjectCallbacks,
    store: DotStore,
    tree: Option<PartitionTree>,
}

impl Partitioner {
    /// Create a new context.
    pub fn new(config: RcbConfig, callbacks: ObjectCallbacks) -> Self {
        Self {
            config,
            callbacks,
            store: DotStore::new(),
            tree: None,
        }
    }

    /// Replace the registered callbacks.
    pub fn set_callbacks(&mut self, callbacks: ObjectCallbacks) {
        self.callbacks = callbacks;
    }

    /// Return the configuration.
    pub fn config(&self) -> &RcbConfig {
        &self.config
    }

    /// Return the dot store of the last run.
    pub fn store(&self) -> &DotStore {
        &self.store
    }

    /// Return the partition tree of the last successful run.
    pub fn tree(&self) -> Option<&PartitionTree> {
        self.tree.as_ref()
    }

    /// Classify a point with the tree of the last run.
    pub fn classify(&self, point: &[f64]) -> RcbResult<usize> {
        self.last_tree()?.classify(point)
    }

    /// Processes whose region intersects the box `[min, max]`.
    pub fn box_assign(&self, min: &[f64], max: &[f64]) -> RcbResult<Vec<usize>> {
        self.last_tree()?.box_assign(min, max)
    }

    fn last_tree(&self) -> RcbResult<&PartitionTree> {
        self.tree.as_ref().ok_or_else(|| {
            RcbError::InvariantViolation("no partition has been computed yet".to_string())
        })
    }

    /// Partition the local objects over all processes of `comm`.
    ///
    /// Collective over `comm`. The objects are queried afresh, so coordinates
    /// may change between successive calls. Local failures are shared with all
    /// ranks before any further communication, so either every rank returns
    /// a result or every rank returns an error.
    pub fn partition<C: Coordinator>(&mut self, comm: &C) -> RcbResult<PartitionResult> {
        let rank = comm.rank();

        let status = self.config.validate().and_then(|_| {
            self.store
                .populate(&self.callbacks, rank, self.config.dimensions)
                .map(|_| ())
        });
        agree_on_status(status, comm)?;

        check_consistency(&self.config, comm)?;

        let outcome = recursive_bisection(self.store.dots().to_vec(), &self.config, comm)?;

        let tree = PartitionTree::gather(&outcome.nodes, comm)?;

        let (destinations, status) =
            match return_destinations(&outcome.dots, self.store.len(), comm) {
                Ok(destinations) => (destinations, Ok(())),
                Err(err) => (Vec::new(), Err(err)),
            };
        agree_on_status(status, comm)?;

        if self.config.check_geometry {
            check_geometry(&self.store, &outcome, comm)?;
        }

        let stats = compute_stats(&outcome.dots, comm);

        if rank == 0 {
            info!("Partitioned over {} processes: {}", comm.size(), stats);
        }

        self.tree = Some(tree.clone());

        Ok(PartitionResult {
            rank,
            objects: self.store.objects().to_vec(),
            destinations,
            dots: outcome.dots,
            region: outcome.region,
            tree,
            warnings: outcome.warnings,
            history: outcome.history,
            stats,
        })
    }
}

/// Check that the settings every rank depends on in lockstep agree.
fn check_consistency<C: Coordinator>(config: &RcbConfig, comm: &C) -> RcbResult<()> {
    let settings = comm.gather_counts(&[config.dimensions, config.max_iterations]);

    let dimensions = settings.iter().step_by(2);
    if dimensions.clone().any(|&d| d != config.dimensions) {
        return Err(RcbError::Input(format!(
            "coordinate dimensionality differs between processes: {:?}",
            dimensions.collect::<Vec<_>>()
        )));
    }

    if settings
        .iter()
        .skip(1)
        .step_by(2)
        .any(|&iterations| iterations != config.max_iterations)
    {
        return Err(RcbError::Configuration(
            "maximum median iterations differ between processes".to_string(),
        ));
    }

    let (min_tol, max_tol) = comm.reduce_min_max(&[config.imbalance_tol], &[config.imbalance_tol]);
    if min_tol[0] != max_tol[0] {
        return Err(RcbError::Configuration(
            "imbalance tolerance differs between processes".to_string(),
        ));
    }

    Ok(())
}

/// Send every dot's final rank back to the rank that created it.
///
/// Returns the destination of each dot of the local store, by store index.
fn return_destinations<C: Coordinator>(
    dots: &[Dot],
    num_local: usize,
    comm: &C,
) -> RcbResult<Vec<usize>> {
    let mut by_owner = dots.to_vec();
    by_owner.sort_by_key(|dot| dot.owner);

    let mut counts = vec![0; comm.size()];
    for dot in &by_owner {
        counts[dot.owner] += 1;
    }

    let (returned, recv_counts) = comm.exchange_dots(&by_owner, &counts);

    // The dots received from rank r are resident on rank r.
    let mut destinations = vec![None; num_local];
    let mut remainder = returned.as_slice();
    for (source, &count) in recv_counts.iter().enumerate() {
        let current;
        (current, remainder) = remainder.split_at(count);
        for dot in current {
            let slot = destinations.get_mut(dot.index).ok_or_else(|| {
                RcbError::InvariantViolation(format!(
                    "returned dot {} has index {} beyond the {} local objects",
                    dot.global_id, dot.index, num_local
                ))
            })?;
            *slot = Some(source);
        }
    }

    destinations
        .into_iter()
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| {
            RcbError::InvariantViolation(
                "a local object was not assigned to any process".to_string(),
            )
        })
}

/// Verify that no dot was lost or duplicated and that every dot lies in its region.
fn check_geometry<C: Coordinator>(
    store: &DotStore,
    outcome: &BisectionOutcome,
    comm: &C,
) -> RcbResult<()> {
    let after_weight = outcome.dots.iter().map(|dot| dot.weight).sum::<f64>();

    let sums = comm.reduce_sum(&[
        store.len() as f64,
        store.local_weight(),
        outcome.dots.len() as f64,
        after_weight,
    ]);

    if sums[0] != sums[2] {
        return Err(RcbError::InvariantViolation(format!(
            "{} dots before partitioning but {} after",
            sums[0], sums[2]
        )));
    }

    if (sums[1] - sums[3]).abs() > 1e-9 * f64::max(1.0, sums[1]) {
        return Err(RcbError::InvariantViolation(format!(
            "total weight {} before partitioning but {} after",
            sums[1], sums[3]
        )));
    }

    let status = match outcome
        .dots
        .iter()
        .find(|dot| !outcome.region.contains(&dot.coords))
    {
        Some(dot) => Err(RcbError::InvariantViolation(format!(
            "dot {} lies outside the region {} of rank {}",
            dot,
            outcome.region,
            comm.rank()
        ))),
        None => Ok(()),
    };

    agree_on_status(status, comm)
}

/// Gather the load statistics of the final partition.
fn compute_stats<C: Coordinator>(dots: &[Dot], comm: &C) -> PartitionStats {
    let local = [
        dots.len() as f64,
        dots.iter().map(|dot| dot.weight).sum::<f64>(),
    ];

    let sums = comm.reduce_sum(&local);
    let (mins, maxs) = comm.reduce_min_max(&local, &local);

    let avg_weight = sums[1] / comm.size() as f64;
    let imbalance = if avg_weight > 0.0 {
        maxs[1] / avg_weight
    } else {
        1.0
    };

    PartitionStats {
        num_dots: sums[0] as usize,
        min_dots: mins[0] as usize,
        max_dots: maxs[0] as usize,
        total_weight: sums[1],
        min_weight: mins[1],
        max_weight: maxs[1],
        avg_weight,
        imbalance,
    }
}

#[cfg(test)]
mod test {
    use std::{cell::Cell, collections::HashMap, rc::Rc};

    use itertools::Itertools;
    use rand::Rng;
    use rand_distr::{Distribution, Exp};

    use super::{PartitionResult, Partitioner};
    use crate::{
        bisect::tree_depth,
        callbacks::{Geometry, ObjectCallbacks, ObjectId},
        comm::{run_threaded, Coordinator, ThreadCoordinator},
        config::RcbConfig,
        error::RcbError,
        tools::{generate_random_points, seeded_rng},
    };

    /// Callbacks serving a fixed set of points. Global ids are `offset + index`.
    fn point_callbacks(
        points: Vec<[f64; 3]>,
        weights: Option<Vec<f64>>,
        dims: usize,
        offset: u64,
    ) -> ObjectCallbacks {
        let points = Rc::new(points);
        let list_points = points.clone();

        let callbacks = ObjectCallbacks::new()
            .with_object_list(move || {
                (0..list_points.len())
                    .map(|i| ObjectId::new(offset + i as u64, i as u64))
                    .collect()
            })
            .with_geometry(move |id| Geometry::new(&points[id.local as usize][..dims]));

        match weights {
            Some(weights) => callbacks.with_weight(move |id| weights[id.local as usize]),
            None => callbacks,
        }
    }

    /// Check the properties every partition must satisfy.
    fn assert_valid_partition(results: &[PartitionResult]) {
        let size = results.len();

        // Every dot is assigned exactly once.
        let mut resident = HashMap::<u64, usize>::new();
        for result in results {
            for dot in &result.dots {
                assert!(resident.insert(dot.global_id, result.rank).is_none());
            }
        }
        let num_objects = results.iter().map(|result| result.objects.len()).sum::<usize>();
        assert_eq!(resident.len(), num_objects);

        for result in results {
            // Destinations agree with where the dots ended up.
            for (id, &destination) in result.objects.iter().zip(&result.destinations) {
                assert_eq!(resident[&id.global], destination);
            }

            assert_eq!(result.tree.height(), tree_depth(size));
            assert_eq!(result.tree.nodes().len(), size - 1);
            assert_eq!(result.tree, results[0].tree);
            assert_eq!(result.stats.num_dots, num_objects);
        }
    }

    #[test]
    fn test_two_process_line() {
        let results = run_threaded(2, |comm| {
            let rank = comm.rank();
            // Rank 0 holds 0, 2, 4, 6 and rank 1 holds 1, 3, 5, 7.
            let points = (0..4)
                .map(|i| [(2 * i + rank) as f64, 0.0, 0.0])
                .collect_vec();
            let mut partitioner = Partitioner::new(
                RcbConfig::with_dimensions(1),
                point_callbacks(points, None, 1, 10 * rank as u64),
            );
            partitioner.partition(&comm).unwrap()
        });

        assert_valid_partition(&results);

        assert_eq!(results[0].destinations, vec![0, 0, 1, 1]);
        assert_eq!(results[1].destinations, vec![0, 0, 1, 1]);
        assert_eq!(results[0].stats.imbalance, 1.0);
        assert!(results.iter().all(|result| result.warnings.is_empty()));

        let exports = results[0].exports().collect_vec();
        assert_eq!(
            exports,
            vec![(ObjectId::new(2, 2), 1), (ObjectId::new(3, 3), 1)]
        );

        assert_eq!(results[0].tree.classify(&[3.0]).unwrap(), 0);
        assert_eq!(results[0].tree.classify(&[4.0]).unwrap(), 1);
    }

    #[test]
    fn test_four_process_balance() {
        let npoints = 250;
        let tol = 0.03;

        let results = run_threaded(4, |comm| {
            let mut rng = seeded_rng(comm.rank());
            let points = generate_random_points(npoints, 3, &mut rng);
            let mut partitioner = Partitioner::new(
                RcbConfig::default(),
                point_callbacks(points, None, 3, (npoints * comm.rank()) as u64),
            );
            let result = partitioner.partition(&comm).unwrap();

            // Every resident dot classifies to this process, twice in a row.
            for dot in &result.dots {
                assert_eq!(partitioner.classify(&dot.coords).unwrap(), comm.rank());
                assert_eq!(partitioner.classify(&dot.coords).unwrap(), comm.rank());
            }

            result
        });

        assert_valid_partition(&results);

        let avg = (4 * npoints) as f64 / 4.0;
        for result in &results {
            let weight = result.dots.iter().map(|dot| dot.weight).sum::<f64>();
            assert!((weight - avg).abs() <= tol * avg + 1e-9);
            assert!(result.warnings.is_empty());
        }
        assert!(results[0].stats.imbalance <= 1.0 + tol + 1e-9);
    }

    #[test]
    fn test_three_process_weighted() {
        let results = run_threaded(3, |comm| {
            let mut rng = seeded_rng(100 + comm.rank());
            let npoints = 40 + 13 * comm.rank();
            let points = generate_random_points(npoints, 2, &mut rng);
            let exp = Exp::new(1.0).unwrap();
            let weights = (0..npoints).map(|_| exp.sample(&mut rng)).collect_vec();

            let config = RcbConfig {
                keep_history: true,
                ..RcbConfig::with_dimensions(2)
            };
            let mut partitioner = Partitioner::new(
                config,
                point_callbacks(points, Some(weights), 2, 1000 * comm.rank() as u64),
            );
            let result = partitioner.partition(&comm).unwrap();

            for dot in &result.dots {
                assert_eq!(result.tree.classify(&dot.coords[..2]).unwrap(), comm.rank());
                assert!(result.region.contains(&dot.coords));
            }

            result
        });

        assert_valid_partition(&results);

        // The root split gives one of three shares to the left group.
        for result in &results {
            let root = &result.history[0];
            assert_eq!((root.first, root.end), (0, 3));
            assert!((root.target_weight / root.total_weight - 1.0 / 3.0).abs() < 1e-12);
        }
        assert_eq!(results[0].history.len(), 1);
        assert_eq!(results[2].history.len(), 2);
    }

    #[test]
    fn test_identical_coordinates() {
        let results = run_threaded(4, |comm| {
            let points = vec![[2.0, 2.0, 2.0]; 2 + comm.rank() % 2];
            let mut partitioner = Partitioner::new(
                RcbConfig::default(),
                point_callbacks(points, None, 3, 10 * comm.rank() as u64),
            );
            partitioner.partition(&comm).unwrap()
        });

        // Ten dots split 5/5 and then 3/2 in each half.
        let counts = results.iter().map(|result| result.dots.len()).collect_vec();
        assert_eq!(counts, vec![3, 2, 3, 2]);

        let mut ids = results
            .iter()
            .flat_map(|result| result.dots.iter().map(|dot| dot.global_id))
            .collect_vec();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 10);
    }

    #[test]
    fn test_more_processes_than_dots() {
        let results = run_threaded(4, |comm| {
            let points = if comm.rank() == 2 {
                vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0]]
            } else {
                Vec::new()
            };
            let mut partitioner = Partitioner::new(
                RcbConfig::with_dimensions(1),
                point_callbacks(points, None, 1, 0),
            );
            partitioner.partition(&comm).unwrap()
        });

        assert_valid_partition(&results);
        assert_eq!(results[0].stats.min_dots, 0);
        assert_eq!(results[0].stats.max_dots, 1);
    }

    #[test]
    fn test_single_process() {
        let comm = ThreadCoordinator::single();
        let points = vec![[0.0, 1.0, 2.0], [3.0, 4.0, 5.0]];
        let mut partitioner =
            Partitioner::new(RcbConfig::default(), point_callbacks(points, None, 3, 0));
        let results = vec![partitioner.partition(&comm).unwrap()];

        assert_valid_partition(&results);
        assert_eq!(results[0].destinations, vec![0, 0]);
        assert_eq!(results[0].exports().count(), 0);
        assert_eq!(results[0].tree.classify(&[9.0, 9.0, 9.0]).unwrap(), 0);
    }

    #[test]
    fn test_missing_callback_aborts_all_ranks() {
        let results = run_threaded(3, |comm| {
            let callbacks = if comm.rank() == 1 {
                ObjectCallbacks::new().with_geometry(|_| Geometry::new(&[0.0]))
            } else {
                point_callbacks(vec![[comm.rank() as f64, 0.0, 0.0]], None, 1, comm.rank() as u64)
            };
            let mut partitioner = Partitioner::new(RcbConfig::with_dimensions(1), callbacks);
            partitioner.partition(&comm)
        });

        for result in results {
            assert!(matches!(result, Err(RcbError::Configuration(_))));
        }
    }

    #[test]
    fn test_dimension_mismatch_is_input_error() {
        let results = run_threaded(2, |comm| {
            let dims = 2 + comm.rank();
            let mut partitioner = Partitioner::new(
                RcbConfig::with_dimensions(dims),
                point_callbacks(vec![[0.5, 0.5, 0.5]], None, dims, comm.rank() as u64),
            );
            partitioner.partition(&comm)
        });

        for result in results {
            assert!(matches!(result, Err(RcbError::Input(_))));
        }
    }

    #[test]
    fn test_iteration_cap_mismatch_is_configuration_error() {
        let results = run_threaded(3, |comm| {
            let config = RcbConfig {
                max_iterations: if comm.rank() == 2 { 10 } else { 30 },
                ..RcbConfig::with_dimensions(1)
            };
            let mut partitioner = Partitioner::new(
                config,
                point_callbacks(vec![[comm.rank() as f64, 0.0, 0.0]], None, 1, comm.rank() as u64),
            );
            partitioner.partition(&comm)
        });

        for result in results {
            assert!(matches!(result, Err(RcbError::Configuration(_))));
        }
    }

    #[test]
    fn test_tolerance_mismatch_is_configuration_error() {
        let results = run_threaded(3, |comm| {
            let config = RcbConfig {
                imbalance_tol: if comm.rank() == 0 { 0.1 } else { 0.03 },
                ..RcbConfig::with_dimensions(1)
            };
            let mut partitioner = Partitioner::new(
                config,
                point_callbacks(vec![[comm.rank() as f64, 0.0, 0.0]], None, 1, comm.rank() as u64),
            );
            partitioner.partition(&comm)
        });

        for result in results {
            assert!(matches!(result, Err(RcbError::Configuration(_))));
        }
    }

    #[test]
    fn test_repartition_with_new_objects() {
        let results = run_threaded(2, |comm| {
            let rank = comm.rank() as u64;
            let mut partitioner = Partitioner::new(
                RcbConfig::with_dimensions(1),
                point_callbacks(vec![[rank as f64, 0.0, 0.0]], None, 1, 10 * rank),
            );
            let first = partitioner.partition(&comm).unwrap();

            // Each rank now holds four objects spread over [0, 8).
            let points = (0..4)
                .map(|i| [(2 * i + rank) as f64, 0.0, 0.0])
                .collect_vec();
            partitioner.set_callbacks(point_callbacks(points, None, 1, 10 * rank));
            let second = partitioner.partition(&comm).unwrap();

            (first, second)
        });

        for (first, second) in &results {
            assert_eq!(first.objects.len(), 1);
            assert_eq!(second.objects.len(), 4);
            assert_eq!(second.destinations, vec![0, 0, 1, 1]);
            assert_eq!(second.stats.num_dots, 8);
        }
    }

    #[test]
    fn test_repartition_with_moved_coordinates() {
        let results = run_threaded(2, |comm| {
            let shift = Rc::new(Cell::new(0.0));
            let geometry_shift = shift.clone();
            let rank = comm.rank();

            let callbacks = ObjectCallbacks::new()
                .with_object_list(move || {
                    (0..50)
                        .map(|i| ObjectId::new((50 * rank + i) as u64, i as u64))
                        .collect()
                })
                .with_geometry(move |id| {
                    Geometry::new(&[(50 * rank) as f64 + id.local as f64 + geometry_shift.get()])
                });

            let mut partitioner = Partitioner::new(RcbConfig::with_dimensions(1), callbacks);

            let first = partitioner.partition(&comm).unwrap();
            let capacity = partitioner.store().capacity();

            shift.set(1000.0);
            let second = partitioner.partition(&comm).unwrap();

            assert!(partitioner.store().capacity() >= capacity);
            (first, second)
        });

        let first_cut = results[0].0.tree.nodes()[0].position;
        let second_cut = results[0].1.tree.nodes()[0].position;
        assert!((second_cut - first_cut - 1000.0).abs() < 1e-6);
        assert_eq!(results[0].1.destinations, results[0].0.destinations);
    }

    #[test]
    fn test_classify_before_partition() {
        let partitioner = Partitioner::new(RcbConfig::default(), ObjectCallbacks::new());
        assert!(matches!(
            partitioner.classify(&[0.0, 0.0, 0.0]),
            Err(RcbError::InvariantViolation(_))
        ));
    }

    #[test]
    fn test_random_unit_weights_classify_random_points() {
        let results = run_threaded(4, |comm| {
            let mut rng = seeded_rng(7 + comm.rank());
            let points = generate_random_points(100, 2, &mut rng);
            let mut partitioner = Partitioner::new(
                RcbConfig::with_dimensions(2),
                point_callbacks(points, None, 2, 100 * comm.rank() as u64),
            );
            partitioner.partition(&comm).unwrap();

            // Arbitrary query points classify to a process whose region contains them.
            let queries = (0..20)
                .map(|_| [rng.gen::<f64>(), rng.gen::<f64>()])
                .collect_vec();
            let owners = queries
                .iter()
                .map(|query| partitioner.classify(query).unwrap())
                .collect_vec();
            let boxes = queries
                .iter()
                .map(|query| partitioner.box_assign(query, query).unwrap())
                .collect_vec();
            (owners, boxes)
        });

        for (owners, boxes) in results {
            for (owner, parts) in owners.iter().zip(&boxes) {
                assert!(parts.contains(owner));
            }
        }
    }
}
