// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

//! Chunk placement: which node owns a chunk position.

use std::fmt::Debug;

use crate::consistent_hash::node::{InstanceNode, Node};
use crate::consistent_hash::ConsistentHash;
use crate::error::{LatticeError, Result};
use crate::schema::{ArrayDesc, Coordinate, NodeId};

/// Virtual replicas per node on the consistent hash ring.
const RING_REPLICAS: usize = 64;

/// Maps a chunk position to the node or nodes owning it.
///
/// Must be deterministic given the same schema on every node.
pub trait PartitionFunction: Debug + Send + Sync {
    /// The single owner of `position`. Fails for replicated placements.
    fn destination(&self, position: &[Coordinate]) -> Result<NodeId>;

    /// Every node receiving a copy of `position`, in ascending order.
    fn destinations(&self, position: &[Coordinate]) -> Result<Vec<NodeId>> {
        Ok(vec![self.destination(position)?])
    }

    fn num_nodes(&self) -> usize;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitioningScheme {
    /// Hash of the chunk indexes modulo the node count.
    HashPartitioned,
    /// Contiguous bands of chunks along the first dimension.
    ByRow,
    /// Contiguous bands of chunks along the second dimension.
    ByCol,
    /// Every chunk goes to one node.
    LocalInstance(NodeId),
    /// Consistent hash ring over all nodes.
    ConsistentHash,
    /// Every node gets a copy of every chunk.
    Replication,
}

/// Partitioning of one array over `num_nodes` nodes.
pub struct SchemePartitioner {
    desc: ArrayDesc,
    num_nodes: usize,
    scheme: PartitioningScheme,
    /// Rotates every destination, used to spread replicas.
    shift: usize,
    ring: Option<ConsistentHash<InstanceNode>>,
}

impl Debug for SchemePartitioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemePartitioner")
            .field("array", &self.desc.name)
            .field("num_nodes", &self.num_nodes)
            .field("scheme", &self.scheme)
            .field("shift", &self.shift)
            .finish()
    }
}

impl SchemePartitioner {
    pub fn try_new(
        desc: ArrayDesc,
        num_nodes: usize,
        scheme: PartitioningScheme,
    ) -> Result<Self> {
        if num_nodes == 0 {
            return Err(LatticeError::Configuration(
                "cannot partition over zero nodes".to_string(),
            ));
        }
        if let PartitioningScheme::LocalInstance(node) = scheme {
            if node >= num_nodes {
                return Err(LatticeError::Configuration(format!(
                    "local instance {node} is not one of {num_nodes} nodes"
                )));
            }
        }
        let ring = (scheme == PartitioningScheme::ConsistentHash).then(|| {
            ConsistentHash::new(
                (0..num_nodes)
                    .map(|id| (InstanceNode::new(id), RING_REPLICAS))
                    .collect(),
            )
        });
        Ok(Self {
            desc,
            num_nodes,
            scheme,
            shift: 0,
            ring,
        })
    }

    pub fn with_shift(mut self, shift: usize) -> Self {
        self.shift = shift;
        self
    }

    pub fn scheme(&self) -> PartitioningScheme {
        self.scheme
    }

    /// Mark a node unavailable on the ring so its chunks move to the next
    /// available node. Only meaningful for the consistent hash scheme.
    pub fn set_available(&mut self, node: NodeId, available: bool) -> bool {
        match self.ring.as_mut() {
            Some(ring) => ring.update(InstanceNode::new(node).name(), |n| {
                n.available = available
            }),
            None => false,
        }
    }

    fn band(&self, dim: usize, position: &[Coordinate]) -> NodeId {
        let d = &self.desc.dimensions[dim];
        let chunk_index = ((position[dim] - d.start_min) / d.chunk_interval) as u64;
        let per_node = d.num_chunks().div_ceil(self.num_nodes as u64);
        (chunk_index / per_node) as NodeId
    }
}

impl PartitionFunction for SchemePartitioner {
    fn destination(&self, position: &[Coordinate]) -> Result<NodeId> {
        if !self.desc.is_chunk_aligned(position) {
            return Err(LatticeError::Internal(format!(
                "{position:?} is not a chunk position of array '{}'",
                self.desc.name
            )));
        }
        let node = match self.scheme {
            PartitioningScheme::HashPartitioned => {
                (self.desc.hashed_chunk_number(position) % self.num_nodes as u64)
                    as NodeId
            }
            PartitioningScheme::ByRow => self.band(0, position),
            PartitioningScheme::ByCol if self.desc.num_dimensions() > 1 => {
                self.band(1, position)
            }
            PartitioningScheme::ByCol => 0,
            PartitioningScheme::LocalInstance(node) => node,
            PartitioningScheme::Replication => {
                return Err(LatticeError::Configuration(format!(
                    "replicated array '{}' has no single owner of {position:?}",
                    self.desc.name
                )))
            }
            PartitioningScheme::ConsistentHash => {
                let key = position
                    .iter()
                    .flat_map(|c| c.to_le_bytes())
                    .collect::<Vec<_>>();
                self.ring
                    .as_ref()
                    .and_then(|ring| ring.get_with_tolerance(&key, usize::MAX))
                    .map(|n| n.id)
                    .ok_or_else(|| {
                        LatticeError::General(
                            "no available node on the hash ring".to_string(),
                        )
                    })?
            }
        };
        Ok((node + self.shift) % self.num_nodes)
    }

    fn destinations(&self, position: &[Coordinate]) -> Result<Vec<NodeId>> {
        if self.scheme != PartitioningScheme::Replication {
            return Ok(vec![self.destination(position)?]);
        }
        if !self.desc.is_chunk_aligned(position) {
            return Err(LatticeError::Internal(format!(
                "{position:?} is not a chunk position of array '{}'",
                self.desc.name
            )));
        }
        Ok((0..self.num_nodes).collect())
    }

    fn num_nodes(&self) -> usize {
        self.num_nodes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::DimensionDesc;

    fn desc() -> ArrayDesc {
        ArrayDesc::try_new(
            "m",
            vec![
                DimensionDesc::try_new("i", 0, 39, 4, 0).unwrap(),
                DimensionDesc::try_new("j", 0, 19, 5, 0).unwrap(),
            ],
            &["v"],
            true,
        )
        .unwrap()
    }

    fn positions() -> Vec<Vec<i64>> {
        let mut out = vec![];
        for i in (0..40).step_by(4) {
            for j in (0..20).step_by(5) {
                out.push(vec![i, j]);
            }
        }
        out
    }

    #[test]
    fn test_by_row_bands() -> Result<()> {
        let p = SchemePartitioner::try_new(desc(), 3, PartitioningScheme::ByRow)?;
        // 10 row chunks over 3 nodes, 4 per node
        assert_eq!(p.destination(&[0, 5])?, 0);
        assert_eq!(p.destination(&[12, 0])?, 0);
        assert_eq!(p.destination(&[16, 0])?, 1);
        assert_eq!(p.destination(&[36, 15])?, 2);
        Ok(())
    }

    #[test]
    fn test_by_col_and_local() -> Result<()> {
        let p = SchemePartitioner::try_new(desc(), 2, PartitioningScheme::ByCol)?;
        assert_eq!(p.destination(&[8, 0])?, 0);
        assert_eq!(p.destination(&[8, 10])?, 1);
        let p = SchemePartitioner::try_new(desc(), 4, PartitioningScheme::LocalInstance(2))?
            .with_shift(3);
        assert_eq!(p.destination(&[8, 10])?, 1);
        assert!(
            SchemePartitioner::try_new(desc(), 2, PartitioningScheme::LocalInstance(2))
                .is_err()
        );
        Ok(())
    }

    #[test]
    fn test_hash_is_deterministic_and_in_range() -> Result<()> {
        for scheme in [
            PartitioningScheme::HashPartitioned,
            PartitioningScheme::ConsistentHash,
        ] {
            let a = SchemePartitioner::try_new(desc(), 3, scheme)?;
            let b = SchemePartitioner::try_new(desc(), 3, scheme)?;
            for p in positions() {
                let node = a.destination(&p)?;
                assert!(node < 3);
                assert_eq!(node, b.destination(&p)?);
            }
        }
        Ok(())
    }

    #[test]
    fn test_consistent_hash_failover() -> Result<()> {
        let mut p =
            SchemePartitioner::try_new(desc(), 3, PartitioningScheme::ConsistentHash)?;
        assert!(p.set_available(1, false));
        for pos in positions() {
            assert_ne!(p.destination(&pos)?, 1);
        }
        Ok(())
    }

    #[test]
    fn test_replication_reaches_every_node() -> Result<()> {
        let p = SchemePartitioner::try_new(desc(), 3, PartitioningScheme::Replication)?
            .with_shift(1);
        for pos in positions() {
            assert_eq!(p.destinations(&pos)?, vec![0, 1, 2]);
            assert!(p.destination(&pos).is_err());
        }
        assert!(p.destinations(&[1, 0]).is_err());
        let hashed = SchemePartitioner::try_new(desc(), 3, PartitioningScheme::HashPartitioned)?;
        assert_eq!(hashed.destinations(&[4, 5])?, vec![hashed.destination(&[4, 5])?]);
        Ok(())
    }

    #[test]
    fn test_rejects_unaligned() -> Result<()> {
        let p = SchemePartitioner::try_new(desc(), 3, PartitioningScheme::HashPartitioned)?;
        assert!(p.destination(&[1, 0]).is_err());
        Ok(())
    }
}
