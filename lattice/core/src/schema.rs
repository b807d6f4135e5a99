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

//! Array schema: dimensions, attributes and chunk geometry.

use crate::coordinates::CoordinatesMapper;
use crate::error::{LatticeError, Result};

/// A single cell coordinate along one dimension.
pub type Coordinate = i64;

/// A cell coordinate or a chunk position, one entry per dimension.
pub type Coordinates = Vec<Coordinate>;

/// Identifies a compute node participating in a redistribution.
pub type NodeId = usize;

/// Identifies an attribute of an array.
pub type AttributeId = usize;

/// Dimension metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DimensionDesc {
    pub name: String,
    pub start_min: Coordinate,
    pub end_max: Coordinate,
    pub chunk_interval: Coordinate,
    pub chunk_overlap: Coordinate,
}

impl DimensionDesc {
    pub fn try_new(
        name: impl Into<String>,
        start_min: Coordinate,
        end_max: Coordinate,
        chunk_interval: Coordinate,
        chunk_overlap: Coordinate,
    ) -> Result<Self> {
        let name = name.into();
        if end_max < start_min {
            return Err(LatticeError::Configuration(format!(
                "dimension '{name}' ends at {end_max} before it starts at {start_min}"
            )));
        }
        if chunk_interval <= 0 {
            return Err(LatticeError::Configuration(format!(
                "dimension '{name}' has non-positive chunk interval {chunk_interval}"
            )));
        }
        if chunk_overlap < 0 {
            return Err(LatticeError::Configuration(format!(
                "dimension '{name}' has negative chunk overlap {chunk_overlap}"
            )));
        }
        Ok(Self {
            name,
            start_min,
            end_max,
            chunk_interval,
            chunk_overlap,
        })
    }

    /// Number of logical cells along this dimension.
    pub fn length(&self) -> u64 {
        (self.end_max - self.start_min + 1) as u64
    }

    /// Number of chunks along this dimension.
    pub fn num_chunks(&self) -> u64 {
        (self.length() + self.chunk_interval as u64 - 1) / self.chunk_interval as u64
    }

    /// The chunk start that contains `coord`.
    pub fn chunk_start_for(&self, coord: Coordinate) -> Coordinate {
        coord - (coord - self.start_min).rem_euclid(self.chunk_interval)
    }
}

/// Attribute metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeDesc {
    pub id: AttributeId,
    pub name: String,
}

/// Array schema.
///
/// An emptyable array tracks which cells are present with a sparsity bitmap
/// per chunk position. A non-emptyable array is dense: every cell of every
/// chunk is present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArrayDesc {
    pub name: String,
    pub dimensions: Vec<DimensionDesc>,
    pub attributes: Vec<AttributeDesc>,
    pub emptyable: bool,
}

impl ArrayDesc {
    pub fn try_new(
        name: impl Into<String>,
        dimensions: Vec<DimensionDesc>,
        attribute_names: &[&str],
        emptyable: bool,
    ) -> Result<Self> {
        let name = name.into();
        if dimensions.is_empty() {
            return Err(LatticeError::Configuration(format!(
                "array '{name}' has no dimensions"
            )));
        }
        if attribute_names.is_empty() {
            return Err(LatticeError::Configuration(format!(
                "array '{name}' has no attributes"
            )));
        }
        let attributes = attribute_names
            .iter()
            .enumerate()
            .map(|(id, n)| AttributeDesc {
                id,
                name: n.to_string(),
            })
            .collect();
        Ok(Self {
            name,
            dimensions,
            attributes,
            emptyable,
        })
    }

    pub fn num_dimensions(&self) -> usize {
        self.dimensions.len()
    }

    pub fn num_attributes(&self) -> usize {
        self.attributes.len()
    }

    pub fn attribute(&self, id: AttributeId) -> Option<&AttributeDesc> {
        self.attributes.get(id)
    }

    /// Total number of chunk positions in the chunk grid.
    pub fn num_chunk_positions(&self) -> u64 {
        self.dimensions.iter().map(|d| d.num_chunks()).product()
    }

    pub fn mapper(&self) -> CoordinatesMapper {
        CoordinatesMapper::new(self.dimensions.clone())
    }

    /// Whether `cell` lies within the array bounds.
    pub fn contains(&self, cell: &[Coordinate]) -> bool {
        cell.len() == self.dimensions.len()
            && self
                .dimensions
                .iter()
                .zip(cell)
                .all(|(d, c)| *c >= d.start_min && *c <= d.end_max)
    }

    /// Whether `position` is the start of a chunk of this array.
    pub fn is_chunk_aligned(&self, position: &[Coordinate]) -> bool {
        self.contains(position)
            && self
                .dimensions
                .iter()
                .zip(position)
                .all(|(d, c)| (c - d.start_min) % d.chunk_interval == 0)
    }

    /// The chunk position that contains `cell`.
    pub fn chunk_position_for(&self, cell: &[Coordinate]) -> Coordinates {
        self.dimensions
            .iter()
            .zip(cell)
            .map(|(d, c)| d.chunk_start_for(*c))
            .collect()
    }

    /// Chunk number that does not depend on dimension lengths, used for hash
    /// partitioning so that unbounded arrays hash stably.
    pub fn hashed_chunk_number(&self, position: &[Coordinate]) -> u64 {
        // 1013 is a prime close to 1024
        self.dimensions
            .iter()
            .zip(position)
            .fold(0u64, |no, (d, c)| {
                no.wrapping_mul(1013)
                    ^ ((c - d.start_min) / d.chunk_interval) as u64
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matrix() -> ArrayDesc {
        ArrayDesc::try_new(
            "m",
            vec![
                DimensionDesc::try_new("i", 0, 9, 4, 0).unwrap(),
                DimensionDesc::try_new("j", -5, 4, 5, 1).unwrap(),
            ],
            &["a", "b"],
            true,
        )
        .unwrap()
    }

    #[test]
    fn test_dimension_validation() {
        assert!(DimensionDesc::try_new("x", 5, 4, 1, 0).is_err());
        assert!(DimensionDesc::try_new("x", 0, 4, 0, 0).is_err());
        assert!(DimensionDesc::try_new("x", 0, 4, 2, -1).is_err());
        let d = DimensionDesc::try_new("x", 0, 9, 4, 0).unwrap();
        assert_eq!(d.length(), 10);
        assert_eq!(d.num_chunks(), 3);
    }

    #[test]
    fn test_chunk_position_for() {
        let desc = matrix();
        assert_eq!(desc.chunk_position_for(&[5, -5]), vec![4, -5]);
        assert_eq!(desc.chunk_position_for(&[9, 3]), vec![8, 0]);
        assert!(desc.is_chunk_aligned(&[8, 0]));
        assert!(!desc.is_chunk_aligned(&[7, 0]));
        assert!(!desc.is_chunk_aligned(&[12, 0]));
        assert_eq!(desc.num_chunk_positions(), 6);
    }

    #[test]
    fn test_hashed_chunk_number() {
        let desc = matrix();
        assert_eq!(desc.hashed_chunk_number(&[0, -5]), 0);
        assert_eq!(desc.hashed_chunk_number(&[4, -5]), 1013);
        assert_eq!(desc.hashed_chunk_number(&[4, 0]), 1013 ^ 1);
    }
}
