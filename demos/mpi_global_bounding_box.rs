//! Test the computation of a global bounding box across MPI ranks.

use rcb_partition::{
    comm::{Coordinator, MpiCoordinator},
    dot::Dot,
    geometry::BoundingBox,
    tools::{generate_random_points, seeded_rng},
};

pub fn main() {
    // Initialise MPI
    let universe = mpi::initialize().unwrap();

    // Get the world communicator
    let comm = MpiCoordinator::world(&universe);

    // Initialise a seeded Rng.
    let mut rng = seeded_rng(comm.rank());

    // Create `npoints` per rank.
    let npoints = 10;

    // Generate random points.

    let dots = generate_random_points(npoints, 3, &mut rng)
        .into_iter()
        .enumerate()
        .map(|(index, coords)| Dot {
            coords,
            weight: 1.0,
            owner: comm.rank(),
            index,
            ..Default::default()
        })
        .collect::<Vec<_>>();

    // Compute the distributed bounding box.

    let bounding_box = BoundingBox::compute(&dots, 3, &comm).unwrap();

    // Gather the local boxes everywhere and combine them.

    let local = BoundingBox::from_dots(&dots, 3);
    let mut expected = BoundingBox::empty(3);
    for bytes in comm.gather_bytes(&serde_json::to_vec(&local).unwrap()) {
        let other: BoundingBox = serde_json::from_slice(&bytes).unwrap();
        expected.include(&other.min());
        expected.include(&other.max());
    }

    assert_eq!(expected, bounding_box);

    if comm.rank() == 0 {
        println!("Global bounding box: {}", bounding_box);
    }
}
