//! Geometry information

use serde::{Deserialize, Serialize};

use crate::{
    comm::Coordinator,
    constants::MAX_DIMENSIONS,
    dot::Dot,
    error::{RcbError, RcbResult},
};

/// An axis-aligned box over the active dimensions.
///
/// Entries beyond `dims` are kept at zero and never inspected.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    min: [f64; MAX_DIMENSIONS],
    max: [f64; MAX_DIMENSIONS],
    dims: usize,
}

impl BoundingBox {
    /// Create a new bounding box.
    pub fn new(min: [f64; MAX_DIMENSIONS], max: [f64; MAX_DIMENSIONS], dims: usize) -> Self {
        assert!(dims > 0 && dims <= MAX_DIMENSIONS);
        Self { min, max, dims }
    }

    /// The empty box. Including any point makes it non-empty.
    pub fn empty(dims: usize) -> Self {
        let mut min = [0.0; MAX_DIMENSIONS];
        let mut max = [0.0; MAX_DIMENSIONS];
        for d in 0..dims {
            min[d] = f64::MAX;
            max[d] = f64::MIN;
        }
        Self::new(min, max, dims)
    }

    /// Compute the local bounding box of a set of dots.
    pub fn from_dots(dots: &[Dot], dims: usize) -> Self {
        let mut bounding_box = Self::empty(dims);
        for dot in dots {
            bounding_box.include(&dot.coords);
        }
        bounding_box
    }

    /// Compute the bounding box of the dots on all ranks of the group.
    ///
    /// Fails with an invariant violation if no rank of the group holds a dot,
    /// since the bisector only asks for boxes of groups that own dots.
    pub fn compute<C: Coordinator>(dots: &[Dot], dims: usize, comm: &C) -> RcbResult<Self> {
        let local = Self::from_dots(dots, dims);

        let (global_min, global_max) =
            comm.reduce_min_max(&local.min[..dims], &local.max[..dims]);

        let mut bounding_box = local;
        bounding_box.min[..dims].copy_from_slice(&global_min);
        bounding_box.max[..dims].copy_from_slice(&global_max);

        if bounding_box.is_empty() {
            return Err(RcbError::InvariantViolation(format!(
                "empty bounding box on a group of {} participating ranks",
                comm.size()
            )));
        }

        Ok(bounding_box)
    }

    /// Grow the box to contain a point.
    pub fn include(&mut self, point: &[f64]) {
        for d in 0..self.dims {
            self.min[d] = f64::min(self.min[d], point[d]);
            self.max[d] = f64::max(self.max[d], point[d]);
        }
    }

    /// True if the box contains no point.
    pub fn is_empty(&self) -> bool {
        (0..self.dims).any(|d| self.min[d] > self.max[d])
    }

    /// True if `point` lies in the closed box.
    pub fn contains(&self, point: &[f64]) -> bool {
        (0..self.dims).all(|d| self.min[d] <= point[d] && point[d] <= self.max[d])
    }

    /// Number of active dimensions.
    pub fn dims(&self) -> usize {
        self.dims
    }

    /// Lower corner.
    pub fn min(&self) -> [f64; MAX_DIMENSIONS] {
        self.min
    }

    /// Upper corner.
    pub fn max(&self) -> [f64; MAX_DIMENSIONS] {
        self.max
    }

    /// Length of the box along dimension `d`.
    pub fn extent(&self, d: usize) -> f64 {
        self.max[d] - self.min[d]
    }

    /// The dimension of largest extent. Ties go to the lowest index.
    pub fn widest_dimension(&self) -> usize {
        let mut widest = 0;
        for d in 1..self.dims {
            if self.extent(d) > self.extent(widest) {
                widest = d;
            }
        }
        widest
    }

    /// Cut the box at `position` along `dim` into a lower and an upper box.
    pub fn split(&self, dim: usize, position: f64) -> (Self, Self) {
        let mut lower = *self;
        let mut upper = *self;
        lower.max[dim] = position;
        upper.min[dim] = position;
        (lower, upper)
    }
}

impl std::fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "(min: {:?}, max: {:?})",
            &self.min[..self.dims],
            &self.max[..self.dims]
        )
    }
}

#[cfg(test)]
mod test {
    use super::BoundingBox;
    use crate::{
        comm::{run_threaded, Coordinator},
        dot::Dot,
        error::RcbError,
        tools::{generate_random_points, seeded_rng},
    };

    fn dots_from_points(points: &[[f64; 3]]) -> Vec<Dot> {
        points
            .iter()
            .map(|&coords| Dot {
                coords,
                weight: 1.0,
                ..Default::default()
            })
            .collect()
    }

    #[test]
    fn test_global_bounding_box() {
        let results = run_threaded(3, |comm| {
            let mut rng = seeded_rng(comm.rank());
            let points = generate_random_points(10, 3, &mut rng);
            let dots = dots_from_points(&points);
            (
                BoundingBox::compute(&dots, 3, &comm).unwrap(),
                BoundingBox::from_dots(&dots, 3),
            )
        });

        // Compare with the box of all points combined.
        let mut expected = BoundingBox::empty(3);
        for (_, local) in &results {
            expected.include(&local.min());
            expected.include(&local.max());
        }

        for (global, _) in &results {
            assert_eq!(*global, expected);
        }
    }

    #[test]
    fn test_empty_group_is_invariant_violation() {
        let results = run_threaded(2, |comm| BoundingBox::compute(&[], 2, &comm));
        for result in results {
            assert!(matches!(result, Err(RcbError::InvariantViolation(_))));
        }
    }

    #[test]
    fn test_box_with_dots_on_one_rank() {
        let results = run_threaded(2, |comm| {
            let dots = if comm.rank() == 0 {
                dots_from_points(&[[1.0, 5.0, 0.0], [2.0, -1.0, 0.0]])
            } else {
                Vec::new()
            };
            BoundingBox::compute(&dots, 2, &comm).unwrap()
        });

        for bounding_box in results {
            assert_eq!(bounding_box.min()[..2], [1.0, -1.0]);
            assert_eq!(bounding_box.max()[..2], [2.0, 5.0]);
            assert_eq!(bounding_box.widest_dimension(), 1);
        }
    }

    #[test]
    fn test_widest_dimension_tie_break() {
        let bounding_box = BoundingBox::new([0.0, 0.0, 0.0], [2.0, 2.0, 1.0], 3);
        assert_eq!(bounding_box.widest_dimension(), 0);

        let flat = BoundingBox::new([3.0, 3.0, 3.0], [3.0, 3.0, 3.0], 3);
        assert_eq!(flat.widest_dimension(), 0);
        assert_eq!(flat.extent(0), 0.0);
        assert!(!flat.is_empty());
    }

    #[test]
    fn test_split() {
        let bounding_box = BoundingBox::new([0.0, 0.0, 0.0], [4.0, 2.0, 0.0], 2);
        let (lower, upper) = bounding_box.split(0, 1.5);
        assert_eq!(lower.max()[0], 1.5);
        assert_eq!(upper.min()[0], 1.5);
        assert!(lower.contains(&[1.5, 1.0]));
        assert!(upper.contains(&[1.5, 1.0]));
        assert!(!lower.contains(&[1.6, 1.0]));
    }
}
