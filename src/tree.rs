//! The partition tree.
//!
//! Every bisection of a process group `[first, end)` into `[first, mid)` and
//! `[mid, end)` is recorded as a [CutNode]. Since each boundary `mid` between
//! two neighbouring ranks is created by exactly one bisection, the nodes are
//! indexed by `mid` and a tree over `P` processes has exactly `P - 1` nodes.
//! The tree is small and replicated on every process, so any process can
//! classify arbitrary points without communication.

use std::ops::Range;

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::{
    comm::Coordinator,
    error::{RcbError, RcbResult},
};

/// Sizes of the two daughter groups of a group with `size` ranks.
///
/// The left group receives `floor(size / 2)` ranks.
pub fn split_sizes(size: usize) -> (usize, usize) {
    let left = size / 2;
    (left, size - left)
}

/// A single cut of a process group.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CutNode {
    /// Cut dimension.
    pub dim: usize,
    /// Cut position. Points with `point[dim] <= position` belong to the left group.
    pub position: f64,
    /// First rank of the bisected group.
    pub first: usize,
    /// First rank of the right daughter group.
    pub mid: usize,
    /// One past the last rank of the bisected group.
    pub end: usize,
}

impl CutNode {
    /// Ranks of the left daughter group.
    pub fn left_range(&self) -> Range<usize> {
        self.first..self.mid
    }

    /// Ranks of the right daughter group.
    pub fn right_range(&self) -> Range<usize> {
        self.mid..self.end
    }
}

/// The replicated record of all cuts of a partitioning run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PartitionTree {
    num_parts: usize,
    // Sorted by `mid`, so the node with boundary `m` sits at index `m - 1`.
    nodes: Vec<CutNode>,
}

impl PartitionTree {
    /// Assemble a tree from its nodes, in any order.
    ///
    /// Fails with an invariant violation unless the nodes describe exactly
    /// the bisections of `num_parts` processes.
    pub fn from_nodes(num_parts: usize, mut nodes: Vec<CutNode>) -> RcbResult<Self> {
        nodes.sort_by_key(|node| node.mid);
        let tree = Self { num_parts, nodes };
        tree.validate()?;
        Ok(tree)
    }

    /// Check the structure of the tree.
    pub fn validate(&self) -> RcbResult<()> {
        if self.num_parts == 0 {
            return Err(RcbError::InvariantViolation(
                "a partition tree needs at least one part".to_string(),
            ));
        }

        if self.nodes.len() != self.num_parts - 1 {
            return Err(RcbError::InvariantViolation(format!(
                "tree over {} parts has {} nodes, expected {}",
                self.num_parts,
                self.nodes.len(),
                self.num_parts - 1
            )));
        }

        // Walk every group from the root and check that its node matches.
        let mut stack = vec![(0, self.num_parts)];
        while let Some((first, end)) = stack.pop() {
            if end - first <= 1 {
                continue;
            }
            let node = self.node_for_group(first, end)?;
            if !node.position.is_finite() {
                return Err(RcbError::InvariantViolation(format!(
                    "cut of group [{}, {}) has non-finite position",
                    first, end
                )));
            }
            stack.push((first, node.mid));
            stack.push((node.mid, end));
        }

        Ok(())
    }

    /// Look up the node that bisects the group `[first, end)`.
    fn node_for_group(&self, first: usize, end: usize) -> RcbResult<&CutNode> {
        let (left, _) = split_sizes(end - first);
        let mid = first + left;

        let node = self.nodes.get(mid - 1).ok_or_else(|| {
            RcbError::InvariantViolation(format!("missing cut for group [{}, {})", first, end))
        })?;

        if node.first != first || node.mid != mid || node.end != end {
            return Err(RcbError::InvariantViolation(format!(
                "cut stored for boundary {} covers [{}, {}) instead of [{}, {})",
                mid, node.first, node.end, first, end
            )));
        }

        Ok(node)
    }

    /// Number of processes the tree partitions into.
    pub fn num_parts(&self) -> usize {
        self.num_parts
    }

    /// The cuts, ordered by the boundary rank they introduce.
    pub fn nodes(&self) -> &[CutNode] {
        &self.nodes
    }

    /// Length of the longest root-to-leaf path.
    pub fn height(&self) -> usize {
        fn depth(first: usize, end: usize) -> usize {
            if end - first <= 1 {
                return 0;
            }
            let (left, _) = split_sizes(end - first);
            1 + usize::max(depth(first, first + left), depth(first + left, end))
        }
        depth(0, self.num_parts)
    }

    /// Return the process owning `point`.
    pub fn classify(&self, point: &[f64]) -> RcbResult<usize> {
        let mut first = 0;
        let mut end = self.num_parts;

        while end - first > 1 {
            let node = self.node_for_group(first, end)?;
            let coord = point.get(node.dim).ok_or_else(|| {
                RcbError::Input(format!(
                    "point with {} coordinates cannot be compared along dimension {}",
                    point.len(),
                    node.dim
                ))
            })?;

            if *coord <= node.position {
                end = node.mid;
            } else {
                first = node.mid;
            }
        }

        Ok(first)
    }

    /// Return all processes whose region intersects the closed box `[min, max]`.
    ///
    /// The result is sorted by rank.
    pub fn box_assign(&self, min: &[f64], max: &[f64]) -> RcbResult<Vec<usize>> {
        let mut parts = Vec::<usize>::new();
        let mut stack = vec![(0, self.num_parts)];

        while let Some((first, end)) = stack.pop() {
            if end - first <= 1 {
                parts.push(first);
                continue;
            }

            let node = self.node_for_group(first, end)?;
            let (Some(&lower), Some(&upper)) = (min.get(node.dim), max.get(node.dim)) else {
                return Err(RcbError::Input(format!(
                    "query box cannot be compared along dimension {}",
                    node.dim
                )));
            };

            if lower <= node.position {
                stack.push((first, node.mid));
            }
            if upper > node.position {
                stack.push((node.mid, end));
            }
        }

        parts.sort_unstable();
        Ok(parts)
    }

    /// Encode the tree for transport or storage.
    pub fn serialize(&self) -> RcbResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode and validate a tree.
    pub fn deserialize(bytes: &[u8]) -> RcbResult<Self> {
        let tree: PartitionTree = serde_json::from_slice(bytes)?;
        tree.validate()?;
        Ok(tree)
    }

    /// Assemble the tree on every rank from the nodes each rank recorded.
    pub fn gather<C: Coordinator>(local_nodes: &[CutNode], comm: &C) -> RcbResult<Self> {
        let bytes = serde_json::to_vec(local_nodes)?;

        let nodes = comm
            .gather_bytes(&bytes)
            .iter()
            .map(|bytes| serde_json::from_slice::<Vec<CutNode>>(bytes))
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .flatten()
            .collect_vec();

        Self::from_nodes(comm.size(), nodes)
    }

    /// Replicate the tree held by `root` on all ranks.
    ///
    /// Only `root` needs to pass a tree. If it passes `None` every rank fails.
    pub fn broadcast<C: Coordinator>(
        tree: Option<&Self>,
        root: usize,
        comm: &C,
    ) -> RcbResult<Self> {
        let mut bytes = if comm.rank() == root {
            match tree {
                Some(tree) => tree.serialize()?,
                None => Vec::new(),
            }
        } else {
            Vec::new()
        };

        comm.broadcast_bytes(root, &mut bytes);

        Self::deserialize(&bytes)
    }
}

#[cfg(test)]
mod test {
    use super::{split_sizes, CutNode, PartitionTree};
    use crate::{
        comm::{run_threaded, Coordinator},
        error::RcbError,
    };

    /// Tree over 3 parts: x <= 1 is part 0, otherwise y <= 2 is part 1, else part 2.
    fn three_part_tree() -> PartitionTree {
        PartitionTree::from_nodes(
            3,
            vec![
                CutNode {
                    dim: 1,
                    position: 2.0,
                    first: 1,
                    mid: 2,
                    end: 3,
                },
                CutNode {
                    dim: 0,
                    position: 1.0,
                    first: 0,
                    mid: 1,
                    end: 3,
                },
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_split_sizes() {
        assert_eq!(split_sizes(2), (1, 1));
        assert_eq!(split_sizes(3), (1, 2));
        assert_eq!(split_sizes(8), (4, 4));
    }

    #[test]
    fn test_classify() {
        let tree = three_part_tree();
        assert_eq!(tree.classify(&[0.5, 10.0]).unwrap(), 0);
        assert_eq!(tree.classify(&[1.0, 10.0]).unwrap(), 0);
        assert_eq!(tree.classify(&[1.5, 2.0]).unwrap(), 1);
        assert_eq!(tree.classify(&[1.5, 2.5]).unwrap(), 2);

        // Classification is a pure function.
        assert_eq!(
            tree.classify(&[1.5, 2.5]).unwrap(),
            tree.classify(&[1.5, 2.5]).unwrap()
        );

        assert!(matches!(tree.classify(&[1.5]), Err(RcbError::Input(_))));
        assert_eq!(tree.height(), 2);
    }

    #[test]
    fn test_box_assign() {
        let tree = three_part_tree();
        assert_eq!(tree.box_assign(&[0.0, 0.0], &[0.5, 5.0]).unwrap(), vec![0]);
        assert_eq!(
            tree.box_assign(&[0.0, 0.0], &[2.0, 1.0]).unwrap(),
            vec![0, 1]
        );
        assert_eq!(
            tree.box_assign(&[-1.0, -1.0], &[5.0, 5.0]).unwrap(),
            vec![0, 1, 2]
        );
        assert_eq!(tree.box_assign(&[3.0, 3.0], &[4.0, 4.0]).unwrap(), vec![2]);
    }

    #[test]
    fn test_malformed_trees() {
        // Missing node.
        assert!(matches!(
            PartitionTree::from_nodes(
                3,
                vec![CutNode {
                    dim: 0,
                    position: 1.0,
                    first: 0,
                    mid: 1,
                    end: 3,
                }],
            ),
            Err(RcbError::InvariantViolation(_))
        ));

        // Node covering the wrong group.
        assert!(matches!(
            PartitionTree::from_nodes(
                2,
                vec![CutNode {
                    dim: 0,
                    position: 1.0,
                    first: 0,
                    mid: 1,
                    end: 3,
                }],
            ),
            Err(RcbError::InvariantViolation(_))
        ));

        let single = PartitionTree::from_nodes(1, Vec::new()).unwrap();
        assert_eq!(single.classify(&[42.0]).unwrap(), 0);
        assert_eq!(single.height(), 0);
    }

    #[test]
    fn test_serialize() {
        let tree = three_part_tree();
        let bytes = tree.serialize().unwrap();
        assert_eq!(PartitionTree::deserialize(&bytes).unwrap(), tree);

        assert!(matches!(
            PartitionTree::deserialize(b"{\"num_parts\": 3, \"nodes\": []}"),
            Err(RcbError::InvariantViolation(_))
        ));
        assert!(matches!(
            PartitionTree::deserialize(b"not a tree"),
            Err(RcbError::Serialization(_))
        ));
    }

    #[test]
    fn test_gather_and_broadcast() {
        let results = run_threaded(3, |comm| {
            let local = three_part_tree()
                .nodes()
                .iter()
                .copied()
                .filter(|node| node.first == comm.rank())
                .collect::<Vec<_>>();
            let gathered = PartitionTree::gather(&local, &comm).unwrap();

            let own = (comm.rank() == 2).then(three_part_tree);
            let broadcast = PartitionTree::broadcast(own.as_ref(), 2, &comm).unwrap();
            (gathered, broadcast)
        });

        for (gathered, broadcast) in results {
            assert_eq!(gathered, three_part_tree());
            assert_eq!(broadcast, three_part_tree());
        }
    }
}
