//! MPI transport.

use itertools::Itertools;
use mpi::{
    collective::SystemOperation,
    datatype::{Partition, PartitionMut},
    environment::Universe,
    topology::{Color, SimpleCommunicator},
    traits::{Communicator, CommunicatorCollectives, Root},
};

use super::Coordinator;
use crate::{dot::Dot, tools::displacements};

/// A process group backed by an MPI communicator.
pub struct MpiCoordinator {
    comm: SimpleCommunicator,
}

impl MpiCoordinator {
    /// Wrap an existing communicator.
    pub fn new(comm: SimpleCommunicator) -> Self {
        Self { comm }
    }

    /// The world communicator of an initialised universe.
    pub fn world(universe: &Universe) -> Self {
        Self::new(universe.world())
    }
}

impl Coordinator for MpiCoordinator {
    fn rank(&self) -> usize {
        self.comm.rank() as usize
    }

    fn size(&self) -> usize {
        self.comm.size() as usize
    }

    fn reduce_sum(&self, values: &[f64]) -> Vec<f64> {
        let mut result = vec![0.0; values.len()];
        self.comm
            .all_reduce_into(values, &mut result[..], SystemOperation::sum());
        result
    }

    fn reduce_min_max(&self, mins: &[f64], maxs: &[f64]) -> (Vec<f64>, Vec<f64>) {
        let mut global_min = vec![0.0; mins.len()];
        let mut global_max = vec![0.0; maxs.len()];

        self.comm
            .all_reduce_into(mins, &mut global_min[..], SystemOperation::min());
        self.comm
            .all_reduce_into(maxs, &mut global_max[..], SystemOperation::max());

        (global_min, global_max)
    }

    fn gather_counts(&self, counts: &[usize]) -> Vec<usize> {
        let mut result = vec![0_usize; counts.len() * self.size()];
        self.comm.all_gather_into(counts, &mut result[..]);
        result
    }

    fn exchange_dots(&self, dots: &[Dot], counts: &[usize]) -> (Vec<Dot>, Vec<usize>) {
        assert_eq!(counts.len(), self.size());

        // First send the counts around via an alltoall operation.

        let counts = counts.iter().map(|&c| c as i32).collect_vec();
        let mut recv_counts = vec![0_i32; counts.len()];

        self.comm.all_to_all_into(&counts[..], &mut recv_counts[..]);

        // We have the recv_counts. Allocate space and setup the partitions.

        let nelems = recv_counts.iter().sum::<i32>() as usize;
        let mut output = vec![Dot::default(); nelems];

        {
            let send_partition = Partition::new(dots, &counts[..], displacements(&counts));
            let mut recv_partition = PartitionMut::new(
                &mut output[..],
                &recv_counts[..],
                displacements(&recv_counts),
            );

            self.comm
                .all_to_all_varcount_into(&send_partition, &mut recv_partition);
        }

        let recv_counts = recv_counts.iter().map(|&c| c as usize).collect_vec();
        (output, recv_counts)
    }

    fn gather_bytes(&self, bytes: &[u8]) -> Vec<Vec<u8>> {
        // First we need to broadcast the individual sizes on each process.

        let local_len = bytes.len() as i32;
        let mut sizes = vec![0_i32; self.size()];

        self.comm.all_gather_into(&local_len, &mut sizes[..]);

        let recv_len = sizes.iter().sum::<i32>() as usize;
        let mut recvbuffer = vec![0_u8; recv_len];

        {
            let recv_displs = displacements(&sizes);
            let mut partition =
                PartitionMut::new(&mut recvbuffer[..], &sizes[..], &recv_displs[..]);
            self.comm.all_gather_varcount_into(bytes, &mut partition);
        }

        // Split the concatenated buffer back into the per-rank contributions.

        let mut remainder = recvbuffer.as_slice();
        let mut result = Vec::with_capacity(sizes.len());
        for &size in &sizes {
            let current;
            (current, remainder) = remainder.split_at(size as usize);
            result.push(current.to_vec());
        }

        result
    }

    fn broadcast_bytes(&self, root: usize, bytes: &mut Vec<u8>) {
        let root_process = self.comm.process_at_rank(root as i32);

        let mut len = bytes.len() as u64;
        root_process.broadcast_into(&mut len);

        if self.rank() != root {
            bytes.clear();
            bytes.resize(len as usize, 0);
        }

        root_process.broadcast_into(&mut bytes[..]);
    }

    fn split_group(&self, left_size: usize, right_size: usize) -> Self {
        assert_eq!(left_size + right_size, self.size());
        assert!(left_size > 0 && right_size > 0, "Daughter groups must be non-empty.");

        let color = if self.rank() < left_size { 0 } else { 1 };

        // Ranks keep their relative order within the daughter groups.
        let comm = self
            .comm
            .split_by_color(Color::with_value(color))
            .expect("Every rank supplies a color, so every rank receives a communicator.");

        Self { comm }
    }
}
