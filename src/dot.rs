//! Dots and the local dot store.

#[cfg(feature = "mpi")]
use mpi::traits::Equivalence;

use crate::{
    callbacks::{ObjectCallbacks, ObjectId},
    constants::{DOT_SLACK, MAX_DIMENSIONS},
    error::{RcbError, RcbResult},
};

/// A point object being partitioned.
///
/// `owner` and `index` identify where the dot was created so that the
/// final destination can be sent back after migration.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "mpi", derive(Equivalence))]
pub struct Dot {
    /// Global id of the application object.
    pub global_id: u64,
    /// Local id of the application object on its owner.
    pub local_id: u64,
    /// Coordinates, zero beyond the active dimensions.
    pub coords: [f64; MAX_DIMENSIONS],
    /// Non-negative weight.
    pub weight: f64,
    /// Process that created the dot.
    pub owner: usize,
    /// Position of the dot in its owner's store.
    pub index: usize,
}

impl Dot {
    /// Create a new dot.
    pub fn new(
        id: ObjectId,
        coords: [f64; MAX_DIMENSIONS],
        weight: f64,
        owner: usize,
        index: usize,
    ) -> Self {
        Self {
            global_id: id.global,
            local_id: id.local,
            coords,
            weight,
            owner,
            index,
        }
    }

    /// Return the object id.
    pub fn id(&self) -> ObjectId {
        ObjectId::new(self.global_id, self.local_id)
    }
}

impl std::fmt::Display for Dot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "(gid: {}, coords: {:?}, weight: {}, owner: {})",
            self.global_id, self.coords, self.weight, self.owner
        )
    }
}

/// The dots of the local process.
///
/// A store is rebuilt for every partitioning run but keeps its allocation.
#[derive(Debug, Default)]
pub struct DotStore {
    dots: Vec<Dot>,
    objects: Vec<ObjectId>,
    dimensions: usize,
}

impl DotStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Query the application for its objects and fill the store.
    ///
    /// Space for half again as many dots is reserved to hold dots imported
    /// during migration. Returns the number of local objects.
    pub fn populate(
        &mut self,
        callbacks: &ObjectCallbacks,
        rank: usize,
        dimensions: usize,
    ) -> RcbResult<usize> {
        callbacks.validate()?;

        let objects = callbacks.objects()?;

        self.dots.clear();
        self.objects.clear();
        self.dimensions = dimensions;

        let capacity = (DOT_SLACK * objects.len() as f64).ceil() as usize;
        self.dots.reserve(capacity);
        self.objects.reserve(objects.len());

        for (index, &id) in objects.iter().enumerate() {
            let coords = self.query_coordinates(callbacks, id)?;
            let weight = callbacks.weight(id);

            if !weight.is_finite() || weight < 0.0 {
                return Err(RcbError::Input(format!(
                    "object {} has invalid weight {}",
                    id.global, weight
                )));
            }

            self.dots.push(Dot::new(id, coords, weight, rank, index));
            self.objects.push(id);
        }

        Ok(self.dots.len())
    }

    fn query_coordinates(
        &self,
        callbacks: &ObjectCallbacks,
        id: ObjectId,
    ) -> RcbResult<[f64; MAX_DIMENSIONS]> {
        let geometry = callbacks.geometry(id)?;

        if geometry.dims() == 0 || geometry.dims() > MAX_DIMENSIONS {
            return Err(RcbError::Input(format!(
                "number of geometry fields {} is invalid for RCB; valid range is 1-{}",
                geometry.dims(),
                MAX_DIMENSIONS
            )));
        }

        if geometry.dims() != self.dimensions {
            return Err(RcbError::Input(format!(
                "object {} has {} coordinates but the run is configured for {}",
                id.global,
                geometry.dims(),
                self.dimensions
            )));
        }

        let coords = geometry.coords();
        if coords.iter().any(|x| !x.is_finite()) {
            return Err(RcbError::Input(format!(
                "object {} has non-finite coordinates",
                id.global
            )));
        }

        Ok(coords)
    }

    /// Return the dots.
    pub fn dots(&self) -> &[Dot] {
        &self.dots
    }

    /// Return the object ids in population order.
    pub fn objects(&self) -> &[ObjectId] {
        &self.objects
    }

    /// Number of dots.
    pub fn len(&self) -> usize {
        self.dots.len()
    }

    /// True if the store holds no dots.
    pub fn is_empty(&self) -> bool {
        self.dots.is_empty()
    }

    /// Allocated dot capacity.
    pub fn capacity(&self) -> usize {
        self.dots.capacity()
    }

    /// Dimensionality of the stored coordinates.
    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Sum of the local dot weights.
    pub fn local_weight(&self) -> f64 {
        self.dots.iter().map(|dot| dot.weight).sum()
    }
}
