//! In-process transport where every rank is a thread.

use std::{
    any::Any,
    sync::{Arc, Barrier},
    thread,
};

use itertools::Itertools;
use parking_lot::Mutex;

use super::Coordinator;
use crate::dot::Dot;

type Slot = Option<Box<dyn Any + Send>>;

/// State shared by the threads of one group.
struct Shared {
    barrier: Barrier,
    slots: Mutex<Vec<Slot>>,
}

impl Shared {
    fn new(size: usize) -> Arc<Self> {
        Arc::new(Self {
            barrier: Barrier::new(size),
            slots: Mutex::new((0..size).map(|_| None).collect()),
        })
    }
}

/// A rank of a thread group.
///
/// Collectives block on a barrier until every rank of the group has arrived,
/// mirroring the blocking semantics of message-passing collectives.
pub struct ThreadCoordinator {
    rank: usize,
    size: usize,
    shared: Arc<Shared>,
}

impl ThreadCoordinator {
    /// Create the ranks of a new group of `size` threads.
    pub fn group(size: usize) -> Vec<ThreadCoordinator> {
        assert!(size > 0, "A group needs at least one rank.");
        let shared = Shared::new(size);
        (0..size)
            .map(|rank| ThreadCoordinator {
                rank,
                size,
                shared: shared.clone(),
            })
            .collect()
    }

    /// A group consisting only of the calling thread.
    pub fn single() -> ThreadCoordinator {
        ThreadCoordinator {
            rank: 0,
            size: 1,
            shared: Shared::new(1),
        }
    }

    /// Gather one value from every rank. This is the primitive that all other
    /// collectives of this transport are built on.
    fn all_gather<T: Clone + Send + 'static>(&self, value: T) -> Vec<T> {
        if self.size == 1 {
            return vec![value];
        }

        self.shared.slots.lock()[self.rank] = Some(Box::new(value));

        self.shared.barrier.wait();

        let gathered = {
            let slots = self.shared.slots.lock();
            slots
                .iter()
                .map(|slot| {
                    slot.as_ref()
                        .and_then(|value| value.downcast_ref::<T>())
                        .cloned()
                        .expect("Ranks issued mismatching collective operations.")
                })
                .collect_vec()
        };

        // Nobody may overwrite a slot before every rank has read all of them.
        self.shared.barrier.wait();

        gathered
    }
}

impl Coordinator for ThreadCoordinator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn reduce_sum(&self, values: &[f64]) -> Vec<f64> {
        let all = self.all_gather(values.to_vec());
        let mut result = vec![0.0; values.len()];
        for contribution in &all {
            for (r, &v) in result.iter_mut().zip(contribution) {
                *r += v;
            }
        }
        result
    }

    fn reduce_min_max(&self, mins: &[f64], maxs: &[f64]) -> (Vec<f64>, Vec<f64>) {
        let all = self.all_gather((mins.to_vec(), maxs.to_vec()));
        let mut global_min = vec![f64::MAX; mins.len()];
        let mut global_max = vec![f64::MIN; maxs.len()];
        for (local_min, local_max) in &all {
            for (g, &l) in global_min.iter_mut().zip(local_min) {
                *g = f64::min(*g, l);
            }
            for (g, &l) in global_max.iter_mut().zip(local_max) {
                *g = f64::max(*g, l);
            }
        }
        (global_min, global_max)
    }

    fn gather_counts(&self, counts: &[usize]) -> Vec<usize> {
        self.all_gather(counts.to_vec()).concat()
    }

    fn exchange_dots(&self, dots: &[Dot], counts: &[usize]) -> (Vec<Dot>, Vec<usize>) {
        assert_eq!(counts.len(), self.size);
        assert_eq!(counts.iter().sum::<usize>(), dots.len());

        // Every rank publishes its send buffer and picks out its own block
        // from each of the others.
        let all = self.all_gather((dots.to_vec(), counts.to_vec()));

        let mut received = Vec::<Dot>::new();
        let mut recv_counts = Vec::<usize>::with_capacity(self.size);

        for (send_dots, send_counts) in &all {
            let start = send_counts[..self.rank].iter().sum::<usize>();
            let count = send_counts[self.rank];
            received.extend_from_slice(&send_dots[start..start + count]);
            recv_counts.push(count);
        }

        (received, recv_counts)
    }

    fn gather_bytes(&self, bytes: &[u8]) -> Vec<Vec<u8>> {
        self.all_gather(bytes.to_vec())
    }

    fn broadcast_bytes(&self, root: usize, bytes: &mut Vec<u8>) {
        assert!(root < self.size);
        let all = self.all_gather(bytes.clone());
        if self.rank != root {
            *bytes = all[root].clone();
        }
    }

    fn split_group(&self, left_size: usize, right_size: usize) -> Self {
        assert_eq!(left_size + right_size, self.size);
        assert!(left_size > 0 && right_size > 0, "Daughter groups must be non-empty.");

        // The first rank of each daughter group allocates its shared state.
        let fresh = if self.rank == 0 {
            Some(Shared::new(left_size))
        } else if self.rank == left_size {
            Some(Shared::new(right_size))
        } else {
            None
        };

        let all = self.all_gather(fresh);

        let (leader, rank, size) = if self.rank < left_size {
            (0, self.rank, left_size)
        } else {
            (left_size, self.rank - left_size, right_size)
        };

        let shared = all[leader]
            .clone()
            .expect("The leader of a daughter group always allocates its state.");

        ThreadCoordinator { rank, size, shared }
    }
}

/// Run `f` once per rank of a fresh thread group of `size` ranks.
///
/// Returns the results ordered by rank.
pub fn run_threaded<R, F>(size: usize, f: F) -> Vec<R>
where
    R: Send,
    F: Fn(ThreadCoordinator) -> R + Sync,
{
    let f = &f;
    thread::scope(|scope| {
        let handles = ThreadCoordinator::group(size)
            .into_iter()
            .map(|comm| scope.spawn(move || f(comm)))
            .collect_vec();

        handles
            .into_iter()
            .map(|handle| handle.join().expect("A rank panicked."))
            .collect_vec()
    })
}
