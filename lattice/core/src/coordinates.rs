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

//! Mapping between cell coordinates and in-chunk offsets, and between chunk
//! positions and chunk sequence numbers.
//!
//! Out-of-range inputs are logic errors and panic.

use crate::schema::{Coordinate, Coordinates, DimensionDesc};

/// Linearization order of a multi-dimensional index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MajorOrder {
    /// The last dimension varies fastest.
    #[default]
    RowMajor,
    /// The first dimension varies fastest.
    ColumnMajor,
}

impl MajorOrder {
    /// Dimension indexes from the slowest varying to the fastest varying.
    fn slowest_first(self, n: usize) -> Box<dyn Iterator<Item = usize>> {
        match self {
            MajorOrder::RowMajor => Box::new(0..n),
            MajorOrder::ColumnMajor => Box::new((0..n).rev()),
        }
    }

    fn fastest_first(self, n: usize) -> Box<dyn Iterator<Item = usize>> {
        match self {
            MajorOrder::RowMajor => Box::new((0..n).rev()),
            MajorOrder::ColumnMajor => Box::new(0..n),
        }
    }
}

/// The overlap-widened, bounds-clipped box covered by one chunk.
///
/// Derive it once per chunk when converting many cells of the same chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkExtent {
    lows: Coordinates,
    intervals: Vec<Coordinate>,
    order: MajorOrder,
}

impl ChunkExtent {
    pub fn lows(&self) -> &[Coordinate] {
        &self.lows
    }

    pub fn intervals(&self) -> &[Coordinate] {
        &self.intervals
    }

    /// Number of cells, overlap included.
    pub fn num_cells(&self) -> u64 {
        self.intervals.iter().map(|i| *i as u64).product()
    }

    pub fn contains(&self, cell: &[Coordinate]) -> bool {
        cell.len() == self.lows.len()
            && cell
                .iter()
                .zip(self.lows.iter().zip(&self.intervals))
                .all(|(c, (low, interval))| *c >= *low && *c < low + interval)
    }

    pub fn cell_to_offset(&self, cell: &[Coordinate]) -> u64 {
        assert!(
            self.contains(cell),
            "cell {cell:?} is outside chunk extent lows={:?} intervals={:?}",
            self.lows,
            self.intervals
        );
        let mut offset = 0u64;
        for i in self.order.slowest_first(self.lows.len()) {
            offset = offset * self.intervals[i] as u64 + (cell[i] - self.lows[i]) as u64;
        }
        offset
    }

    pub fn offset_to_cell(&self, offset: u64) -> Coordinates {
        assert!(
            offset < self.num_cells(),
            "offset {offset} is outside a chunk of {} cells",
            self.num_cells()
        );
        let mut cell = vec![0; self.lows.len()];
        let mut remaining = offset;
        for i in self.order.fastest_first(self.lows.len()) {
            let interval = self.intervals[i] as u64;
            cell[i] = self.lows[i] + (remaining % interval) as Coordinate;
            remaining /= interval;
        }
        debug_assert_eq!(remaining, 0);
        cell
    }
}

/// Maps coordinates for every chunk of an array with fixed dimensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatesMapper {
    dims: Vec<DimensionDesc>,
    order: MajorOrder,
}

impl CoordinatesMapper {
    pub fn new(dims: Vec<DimensionDesc>) -> Self {
        Self::with_order(dims, MajorOrder::RowMajor)
    }

    pub fn with_order(dims: Vec<DimensionDesc>, order: MajorOrder) -> Self {
        assert!(!dims.is_empty(), "a mapper needs at least one dimension");
        Self { dims, order }
    }

    pub fn dimensions(&self) -> &[DimensionDesc] {
        &self.dims
    }

    pub fn order(&self) -> MajorOrder {
        self.order
    }

    /// Widen the chunk at `position` by the overlap on each side, clipped to
    /// the dimension bounds.
    pub fn chunk_extent(&self, position: &[Coordinate]) -> ChunkExtent {
        assert_eq!(
            position.len(),
            self.dims.len(),
            "chunk position {position:?} has the wrong arity"
        );
        let mut lows = Vec::with_capacity(self.dims.len());
        let mut intervals = Vec::with_capacity(self.dims.len());
        for (d, p) in self.dims.iter().zip(position) {
            let low = (p - d.chunk_overlap).max(d.start_min);
            let high = (p + d.chunk_interval + d.chunk_overlap - 1).min(d.end_max);
            assert!(high >= low, "chunk position {position:?} is out of bounds");
            lows.push(low);
            intervals.push(high - low + 1);
        }
        ChunkExtent {
            lows,
            intervals,
            order: self.order,
        }
    }

    pub fn num_cells(&self, position: &[Coordinate]) -> u64 {
        self.chunk_extent(position).num_cells()
    }

    pub fn cell_to_offset(&self, position: &[Coordinate], cell: &[Coordinate]) -> u64 {
        self.chunk_extent(position).cell_to_offset(cell)
    }

    pub fn offset_to_cell(&self, position: &[Coordinate], offset: u64) -> Coordinates {
        self.chunk_extent(position).offset_to_cell(offset)
    }

    /// Total number of chunks in the chunk grid.
    pub fn num_chunks(&self) -> u64 {
        self.dims.iter().map(|d| d.num_chunks()).product()
    }

    /// Encode a chunk position as its sequence number in the chunk grid.
    pub fn chunk_to_sequence(&self, position: &[Coordinate]) -> u64 {
        assert_eq!(
            position.len(),
            self.dims.len(),
            "chunk position {position:?} has the wrong arity"
        );
        let mut seq = 0u64;
        for i in self.order.slowest_first(self.dims.len()) {
            let d = &self.dims[i];
            let p = position[i];
            assert!(
                p >= d.start_min
                    && p <= d.end_max
                    && (p - d.start_min) % d.chunk_interval == 0,
                "{position:?} is not a chunk position of dimension '{}'",
                d.name
            );
            seq = seq * d.num_chunks() + ((p - d.start_min) / d.chunk_interval) as u64;
        }
        seq
    }

    /// Decode a sequence number produced by [`Self::chunk_to_sequence`].
    pub fn sequence_to_chunk(&self, sequence: u64) -> Coordinates {
        assert!(
            sequence < self.num_chunks(),
            "chunk sequence {sequence} is outside a grid of {} chunks",
            self.num_chunks()
        );
        let mut position = vec![0; self.dims.len()];
        let mut remaining = sequence;
        for i in self.order.fastest_first(self.dims.len()) {
            let d = &self.dims[i];
            let n = d.num_chunks();
            position[i] = (remaining % n) as Coordinate * d.chunk_interval + d.start_min;
            remaining /= n;
        }
        position
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dims() -> Vec<DimensionDesc> {
        vec![
            DimensionDesc::try_new("i", 0, 9, 4, 0).unwrap(),
            DimensionDesc::try_new("j", -3, 7, 3, 1).unwrap(),
            DimensionDesc::try_new("k", 1, 2, 2, 0).unwrap(),
        ]
    }

    fn all_positions(mapper: &CoordinatesMapper) -> Vec<Coordinates> {
        let d = mapper.dimensions();
        let mut out = vec![];
        for i in (d[0].start_min..=d[0].end_max).step_by(d[0].chunk_interval as usize) {
            for j in (d[1].start_min..=d[1].end_max).step_by(d[1].chunk_interval as usize)
            {
                for k in
                    (d[2].start_min..=d[2].end_max).step_by(d[2].chunk_interval as usize)
                {
                    out.push(vec![i, j, k]);
                }
            }
        }
        out
    }

    #[test]
    fn test_sequence_round_trip() {
        for order in [MajorOrder::RowMajor, MajorOrder::ColumnMajor] {
            let mapper = CoordinatesMapper::with_order(dims(), order);
            let positions = all_positions(&mapper);
            assert_eq!(positions.len() as u64, mapper.num_chunks());
            let mut seen = std::collections::HashSet::new();
            for p in positions {
                let seq = mapper.chunk_to_sequence(&p);
                assert!(seen.insert(seq));
                assert_eq!(mapper.sequence_to_chunk(seq), p);
            }
            for n in 0..mapper.num_chunks() {
                let p = mapper.sequence_to_chunk(n);
                assert_eq!(mapper.chunk_to_sequence(&p), n);
            }
        }
    }

    #[test]
    fn test_row_major_sequence_order() {
        let mapper = CoordinatesMapper::new(dims());
        // 3 x 4 x 1 chunk grid, last dimension fastest
        assert_eq!(mapper.chunk_to_sequence(&[0, -3, 1]), 0);
        assert_eq!(mapper.chunk_to_sequence(&[0, 0, 1]), 1);
        assert_eq!(mapper.chunk_to_sequence(&[4, -3, 1]), 4);
        assert_eq!(mapper.chunk_to_sequence(&[8, 6, 1]), 11);
    }

    #[test]
    fn test_offset_round_trip_with_overlap() {
        for order in [MajorOrder::RowMajor, MajorOrder::ColumnMajor] {
            let mapper = CoordinatesMapper::with_order(dims(), order);
            for p in all_positions(&mapper) {
                let extent = mapper.chunk_extent(&p);
                for offset in 0..extent.num_cells() {
                    let cell = extent.offset_to_cell(offset);
                    assert!(extent.contains(&cell));
                    assert_eq!(mapper.cell_to_offset(&p, &cell), offset);
                    assert_eq!(mapper.offset_to_cell(&p, offset), cell);
                }
            }
        }
    }

    #[test]
    fn test_overlap_is_clipped() {
        let mapper = CoordinatesMapper::new(dims());
        let extent = mapper.chunk_extent(&[0, -3, 1]);
        // j is widened by one on the high side only
        assert_eq!(extent.lows(), &[0, -3, 1]);
        assert_eq!(extent.intervals(), &[4, 4, 2]);
        let extent = mapper.chunk_extent(&[8, 3, 1]);
        assert_eq!(extent.lows(), &[8, 2, 1]);
        assert_eq!(extent.intervals(), &[2, 5, 2]);
    }

    #[test]
    #[should_panic(expected = "outside chunk extent")]
    fn test_cell_outside_chunk_panics() {
        let mapper = CoordinatesMapper::new(dims());
        mapper.cell_to_offset(&[0, -3, 1], &[5, -3, 1]);
    }

    #[test]
    #[should_panic(expected = "not a chunk position")]
    fn test_unaligned_position_panics() {
        let mapper = CoordinatesMapper::new(dims());
        mapper.chunk_to_sequence(&[1, -3, 1]);
    }
}
