//! Partition random points across MPI ranks and check the result.

use std::{rc::Rc, time::Instant};

use rcb_partition::{
    callbacks::{Geometry, ObjectCallbacks, ObjectId},
    comm::{Coordinator, MpiCoordinator},
    config::RcbConfig,
    partition::Partitioner,
    tools::{generate_random_points, seeded_rng},
};

pub fn main() {
    // Initialise MPI
    let universe = mpi::initialize().unwrap();

    // Get the world communicator
    let comm = MpiCoordinator::world(&universe);
    let rank = comm.rank();

    // Initialise a seeded Rng.
    let mut rng = seeded_rng(rank);

    // Create `npoints` per rank.
    let npoints = 10000;

    let points = Rc::new(generate_random_points(npoints, 3, &mut rng));
    let geometry_points = points.clone();

    let callbacks = ObjectCallbacks::new()
        .with_object_list(move || {
            (0..npoints)
                .map(|index| ObjectId::new((rank * npoints + index) as u64, index as u64))
                .collect()
        })
        .with_geometry(move |id| Geometry::new(&geometry_points[id.local as usize]));

    let config = RcbConfig {
        keep_history: true,
        ..Default::default()
    };

    let mut partitioner = Partitioner::new(config, callbacks);

    let start = Instant::now();
    let result = partitioner.partition(&comm).unwrap();
    let duration = start.elapsed();

    // Every dot that arrived here must classify to this rank.

    for dot in &result.dots {
        assert_eq!(partitioner.classify(&dot.coords).unwrap(), rank);
    }

    for warning in &result.warnings {
        println!("Rank {}: {}", rank, warning);
    }

    if rank == 0 {
        println!(
            "Partitioned {} points on {} ranks in {} ms.",
            result.stats.num_dots,
            comm.size(),
            duration.as_millis()
        );
        println!("{}", result.stats);
        for record in &result.history {
            println!(
                "Level {}: ranks [{}, {}) cut along {} at {} after {} iterations.",
                record.level,
                record.first,
                record.end,
                record.dim,
                record.position,
                record.iterations
            );
        }
    }

    println!(
        "Rank {} exports {} of {} objects and owns {} dots in {}.",
        rank,
        result.exports().count(),
        result.objects.len(),
        result.dots.len(),
        result.region
    );
}
