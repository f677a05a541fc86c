//! Constants used across the partitioner.

/// Maximum number of coordinate dimensions of a dot.
pub const MAX_DIMENSIONS: usize = 3;

/// Default relative imbalance tolerance of the final partition.
pub const DEFAULT_IMBALANCE_TOL: f64 = 0.03;

/// Default cap on median-search iterations per level.
pub const DEFAULT_MAX_ITERATIONS: usize = 30;

/// Default dimensionality of the coordinates.
pub const DEFAULT_DIMENSIONS: usize = 3;

/// Extra capacity allocated for dots imported during migration.
pub const DOT_SLACK: f64 = 1.5;

/// Cut position recorded for groups that own no dots. Every point classifies left.
pub const EMPTY_GROUP_CUT: f64 = f64::MAX;
