//! Query functions supplied by the application.
//!
//! The partitioner never owns application objects. It enumerates them through
//! either a bulk list function or a first/next iterator pair, and asks for
//! their coordinates and optionally their weights.

use crate::{
    constants::MAX_DIMENSIONS,
    error::{RcbError, RcbResult},
};

/// Identity of an application object.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId {
    /// Globally unique identifier.
    pub global: u64,
    /// Identifier local to the owning process.
    pub local: u64,
}

impl ObjectId {
    /// Create a new object id.
    pub fn new(global: u64, local: u64) -> Self {
        Self { global, local }
    }
}

/// Coordinates of an object, with up to three valid entries.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Geometry {
    coords: [f64; MAX_DIMENSIONS],
    dims: usize,
}

impl Geometry {
    /// Create a geometry from a coordinate slice.
    ///
    /// Slices longer than three entries are recorded with their full length
    /// so that the dot store can reject them.
    pub fn new(coords: &[f64]) -> Self {
        let mut padded = [0.0; MAX_DIMENSIONS];
        for (target, &source) in padded.iter_mut().zip(coords) {
            *target = source;
        }
        Self {
            coords: padded,
            dims: coords.len(),
        }
    }

    /// The coordinates, padded with zeros beyond the valid dimensions.
    pub fn coords(&self) -> [f64; MAX_DIMENSIONS] {
        self.coords
    }

    /// Number of valid coordinates.
    pub fn dims(&self) -> usize {
        self.dims
    }
}

/// Bulk enumeration of all local objects.
pub type ObjectListFn = Box<dyn Fn() -> Vec<ObjectId>>;
/// First object of the local iteration, `None` if there are no objects.
pub type FirstObjectFn = Box<dyn Fn() -> Option<ObjectId>>;
/// Object following the given one, `None` at the end of the iteration.
pub type NextObjectFn = Box<dyn Fn(ObjectId) -> Option<ObjectId>>;
/// Declared number of local objects.
pub type NumObjectsFn = Box<dyn Fn() -> usize>;
/// Coordinates of an object.
pub type GeometryFn = Box<dyn Fn(ObjectId) -> Geometry>;
/// Non-negative weight of an object.
pub type WeightFn = Box<dyn Fn(ObjectId) -> f64>;

/// The set of registered query functions.
#[derive(Default)]
pub struct ObjectCallbacks {
    object_list: Option<ObjectListFn>,
    first_object: Option<FirstObjectFn>,
    next_object: Option<NextObjectFn>,
    num_objects: Option<NumObjectsFn>,
    geometry: Option<GeometryFn>,
    weight: Option<WeightFn>,
}

impl ObjectCallbacks {
    /// Create an empty callback set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a bulk object list function.
    pub fn with_object_list(mut self, f: impl Fn() -> Vec<ObjectId> + 'static) -> Self {
        self.object_list = Some(Box::new(f));
        self
    }

    /// Register a first/next iterator pair.
    pub fn with_object_iterator(
        mut self,
        first: impl Fn() -> Option<ObjectId> + 'static,
        next: impl Fn(ObjectId) -> Option<ObjectId> + 'static,
    ) -> Self {
        self.first_object = Some(Box::new(first));
        self.next_object = Some(Box::new(next));
        self
    }

    /// Register a function declaring the number of local objects.
    pub fn with_num_objects(mut self, f: impl Fn() -> usize + 'static) -> Self {
        self.num_objects = Some(Box::new(f));
        self
    }

    /// Register the geometry function.
    pub fn with_geometry(mut self, f: impl Fn(ObjectId) -> Geometry + 'static) -> Self {
        self.geometry = Some(Box::new(f));
        self
    }

    /// Register the weight function. Without it every object weighs 1.0.
    pub fn with_weight(mut self, f: impl Fn(ObjectId) -> f64 + 'static) -> Self {
        self.weight = Some(Box::new(f));
        self
    }

    /// Check that an enumerator and a geometry function are registered.
    pub fn validate(&self) -> RcbResult<()> {
        let has_iterator = self.first_object.is_some() && self.next_object.is_some();

        if self.object_list.is_none() && !has_iterator {
            return Err(RcbError::Configuration(
                "either an object list function or a first/next object pair must be registered"
                    .to_string(),
            ));
        }

        if self.geometry.is_none() {
            return Err(RcbError::Configuration(
                "a geometry function must be registered".to_string(),
            ));
        }

        Ok(())
    }

    /// Enumerate the local objects.
    ///
    /// The bulk list takes precedence when both enumerators are registered.
    pub fn objects(&self) -> RcbResult<Vec<ObjectId>> {
        let objects = if let Some(list) = &self.object_list {
            list()
        } else if let (Some(first), Some(next)) = (&self.first_object, &self.next_object) {
            let mut objects = Vec::new();
            let mut current = first();
            while let Some(id) = current {
                objects.push(id);
                current = next(id);
            }
            objects
        } else {
            return Err(RcbError::Configuration(
                "no object enumeration function registered".to_string(),
            ));
        };

        if let Some(num_objects) = &self.num_objects {
            let declared = num_objects();
            if declared != objects.len() {
                return Err(RcbError::Input(format!(
                    "number of objects returned {} != number of objects declared {}",
                    objects.len(),
                    declared
                )));
            }
        }

        Ok(objects)
    }

    /// Query the geometry of an object.
    pub fn geometry(&self, id: ObjectId) -> RcbResult<Geometry> {
        self.geometry
            .as_ref()
            .map(|f| f(id))
            .ok_or_else(|| RcbError::Configuration("no geometry function registered".to_string()))
    }

    /// Query the weight of an object, defaulting to 1.0.
    pub fn weight(&self, id: ObjectId) -> f64 {
        self.weight.as_ref().map_or(1.0, |f| f(id))
    }
}

#[cfg(test)]
mod test {
    use super::{Geometry, ObjectCallbacks, ObjectId};
    use crate::error::RcbError;

    #[test]
    fn test_missing_enumerator() {
        let callbacks = ObjectCallbacks::new().with_geometry(|_| Geometry::new(&[0.0]));
        assert!(matches!(
            callbacks.validate(),
            Err(RcbError::Configuration(_))
        ));
    }

    #[test]
    fn test_iterator_enumeration() {
        let callbacks = ObjectCallbacks::new()
            .with_object_iterator(
                || Some(ObjectId::new(0, 0)),
                |id| (id.local < 4).then(|| ObjectId::new(id.global + 1, id.local + 1)),
            )
            .with_num_objects(|| 5)
            .with_geometry(|id| Geometry::new(&[id.global as f64]));

        assert!(callbacks.validate().is_ok());
        let objects = callbacks.objects().unwrap();
        assert_eq!(objects.len(), 5);
        assert_eq!(objects[4], ObjectId::new(4, 4));
        assert_eq!(callbacks.weight(objects[0]), 1.0);
    }

    #[test]
    fn test_object_list_takes_precedence() {
        let callbacks = ObjectCallbacks::new()
            .with_object_iterator(
                || Some(ObjectId::new(50, 0)),
                |id| (id.local < 2).then(|| ObjectId::new(id.global + 1, id.local + 1)),
            )
            .with_object_list(|| vec![ObjectId::new(7, 0), ObjectId::new(8, 1)])
            .with_geometry(|_| Geometry::new(&[0.0]));

        assert_eq!(
            callbacks.objects().unwrap(),
            vec![ObjectId::new(7, 0), ObjectId::new(8, 1)]
        );
    }

    #[test]
    fn test_declared_count_mismatch() {
        let callbacks = ObjectCallbacks::new()
            .with_object_list(|| vec![ObjectId::new(1, 0), ObjectId::new(2, 1)])
            .with_num_objects(|| 3)
            .with_geometry(|_| Geometry::new(&[0.0, 0.0]));

        assert!(matches!(callbacks.objects(), Err(RcbError::Input(_))));
    }

    #[test]
    fn test_geometry_padding() {
        let geometry = Geometry::new(&[1.0, 2.0]);
        assert_eq!(geometry.dims(), 2);
        assert_eq!(geometry.coords(), [1.0, 2.0, 0.0]);
    }
}
