//! Collective communication used by the partitioner.
//!
//! Every method is collective over the group: all ranks of the group must
//! call the same methods in the same order, otherwise the group deadlocks.
//! After [Coordinator::split_group] the two daughter groups are independent
//! and must not communicate with each other.
pub mod threaded;

#[cfg(feature = "mpi")]
pub mod mpi;

pub use threaded::{run_threaded, ThreadCoordinator};

#[cfg(feature = "mpi")]
pub use self::mpi::MpiCoordinator;

use crate::dot::Dot;

/// The transport selected at build time.
#[cfg(feature = "mpi")]
pub type DefaultCoordinator = MpiCoordinator;

/// The transport selected at build time.
#[cfg(not(feature = "mpi"))]
pub type DefaultCoordinator = ThreadCoordinator;

/// A group of cooperating processes.
pub trait Coordinator: Sized {
    /// Rank of the calling process within the group.
    fn rank(&self) -> usize;

    /// Number of processes in the group.
    fn size(&self) -> usize;

    /// Element-wise sum of `values` across the group.
    fn reduce_sum(&self, values: &[f64]) -> Vec<f64>;

    /// Element-wise minimum of `mins` and maximum of `maxs` across the group.
    fn reduce_min_max(&self, mins: &[f64], maxs: &[f64]) -> (Vec<f64>, Vec<f64>);

    /// Gather `counts` from every rank.
    ///
    /// Each rank must pass the same number of counts. The result holds the
    /// contributions concatenated in rank order.
    fn gather_counts(&self, counts: &[usize]) -> Vec<usize>;

    /// Exchange dots between all ranks of the group.
    ///
    /// The first `counts[0]` dots go to rank 0, the next `counts[1]` to rank 1
    /// and so on. Returns the received dots ordered by source rank together
    /// with the number of dots received from each rank.
    fn exchange_dots(&self, dots: &[Dot], counts: &[usize]) -> (Vec<Dot>, Vec<usize>);

    /// Gather a byte buffer of arbitrary length from every rank.
    fn gather_bytes(&self, bytes: &[u8]) -> Vec<Vec<u8>>;

    /// Broadcast `bytes` from `root`. On other ranks the buffer is replaced.
    fn broadcast_bytes(&self, root: usize, bytes: &mut Vec<u8>);

    /// Split the group into a left group of the first `left_size` ranks and
    /// a right group of the remaining `right_size` ranks.
    ///
    /// Returns the daughter group the calling rank belongs to.
    fn split_group(&self, left_size: usize, right_size: usize) -> Self;
}
