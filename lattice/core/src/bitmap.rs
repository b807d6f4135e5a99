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

//! Run-length encoded sparsity bitmap.
//!
//! A bitmap describes which cell offsets of one chunk are present. Values of
//! an attribute chunk are stored densely in the order of the present offsets,
//! so the bitmap also maps a logical offset to its physical value index.

use std::sync::Arc;

use bytes::{Buf, BufMut};

use crate::error::{LatticeError, ProtocolViolation, Result};

/// Immutable bitmap shared by every attribute chunk at one position.
pub type SharedBitmap = Arc<SparsityBitmap>;

/// A run of present cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// First present logical offset of the run.
    pub logical_start: u64,
    pub length: u64,
    /// Index of the first value of the run in the dense value vector.
    pub physical_start: u64,
}

impl Segment {
    fn logical_end(&self) -> u64 {
        self.logical_start + self.length
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SparsityBitmap {
    num_cells: u64,
    segments: Vec<Segment>,
}

impl SparsityBitmap {
    /// A bitmap with no present cells.
    pub fn empty(num_cells: u64) -> Self {
        Self {
            num_cells,
            segments: vec![],
        }
    }

    /// A bitmap with every cell present, the implicit bitmap of dense arrays.
    pub fn full(num_cells: u64) -> Self {
        let segments = if num_cells == 0 {
            vec![]
        } else {
            vec![Segment {
                logical_start: 0,
                length: num_cells,
                physical_start: 0,
            }]
        };
        Self {
            num_cells,
            segments,
        }
    }

    /// Build from strictly ascending present offsets.
    pub fn from_offsets(
        num_cells: u64,
        offsets: impl IntoIterator<Item = u64>,
    ) -> Result<Self> {
        let mut builder = BitmapBuilder::new(num_cells);
        for offset in offsets {
            builder.push(offset)?;
        }
        Ok(builder.finish())
    }

    pub fn from_mask(mask: &[bool]) -> Self {
        let mut builder = BitmapBuilder::new(mask.len() as u64);
        for (offset, present) in mask.iter().enumerate() {
            if *present {
                builder.push_unchecked(offset as u64);
            }
        }
        builder.finish()
    }

    pub fn num_cells(&self) -> u64 {
        self.num_cells
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Number of present cells.
    pub fn count(&self) -> u64 {
        self.segments.last().map_or(0, |s| s.physical_start + s.length)
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.count() == self.num_cells
    }

    fn find_segment(&self, offset: u64) -> Option<&Segment> {
        let idx = self
            .segments
            .partition_point(|s| s.logical_end() <= offset);
        self.segments
            .get(idx)
            .filter(|s| s.logical_start <= offset)
    }

    pub fn is_present(&self, offset: u64) -> bool {
        self.find_segment(offset).is_some()
    }

    /// Index of the value of `offset` in the dense value vector.
    pub fn physical_index(&self, offset: u64) -> Option<u64> {
        self.find_segment(offset)
            .map(|s| s.physical_start + (offset - s.logical_start))
    }

    /// Present offsets in ascending order.
    pub fn iter_offsets(&self) -> impl Iterator<Item = u64> + '_ {
        self.segments
            .iter()
            .flat_map(|s| s.logical_start..s.logical_end())
    }

    pub fn union(&self, other: &SparsityBitmap) -> Result<SparsityBitmap> {
        if self.num_cells != other.num_cells {
            return Err(LatticeError::Internal(format!(
                "cannot union bitmaps of {} and {} cells",
                self.num_cells, other.num_cells
            )));
        }
        let mut builder = BitmapBuilder::new(self.num_cells);
        let mut a = self.segments.iter().peekable();
        let mut b = other.segments.iter().peekable();
        loop {
            let next = match (a.peek(), b.peek()) {
                (Some(x), Some(y)) if x.logical_start <= y.logical_start => a.next(),
                (Some(_), Some(_)) => b.next(),
                (Some(_), None) => a.next(),
                (None, Some(_)) => b.next(),
                (None, None) => break,
            };
            if let Some(s) = next {
                builder.push_run(s.logical_start, s.length);
            }
        }
        Ok(builder.finish())
    }

    /// Approximate in-memory footprint.
    pub fn size_bytes(&self) -> usize {
        std::mem::size_of::<Self>() + self.segments.len() * std::mem::size_of::<Segment>()
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u64_le(self.num_cells);
        buf.put_u32_le(self.segments.len() as u32);
        for s in &self.segments {
            buf.put_u64_le(s.logical_start);
            buf.put_u64_le(s.length);
        }
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self> {
        let truncated =
            || ProtocolViolation::MalformedPayload("truncated bitmap".to_string());
        if buf.remaining() < 12 {
            return Err(truncated().into());
        }
        let num_cells = buf.get_u64_le();
        let num_segments = buf.get_u32_le() as usize;
        if buf.remaining() < num_segments * 16 {
            return Err(truncated().into());
        }
        let mut builder = BitmapBuilder::new(num_cells);
        for _ in 0..num_segments {
            let start = buf.get_u64_le();
            let length = buf.get_u64_le();
            if length == 0 || start + length > num_cells || start < builder.next_offset {
                return Err(ProtocolViolation::MalformedPayload(format!(
                    "bitmap segment {start}+{length} is out of order or out of bounds"
                ))
                .into());
            }
            builder.push_run(start, length);
        }
        Ok(builder.finish())
    }
}

/// Incremental construction from ascending offsets or runs.
#[derive(Debug)]
pub struct BitmapBuilder {
    num_cells: u64,
    segments: Vec<Segment>,
    count: u64,
    next_offset: u64,
}

impl BitmapBuilder {
    pub fn new(num_cells: u64) -> Self {
        Self {
            num_cells,
            segments: vec![],
            count: 0,
            next_offset: 0,
        }
    }

    pub fn push(&mut self, offset: u64) -> Result<()> {
        if offset >= self.num_cells {
            return Err(LatticeError::Internal(format!(
                "offset {offset} is outside a chunk of {} cells",
                self.num_cells
            )));
        }
        if !self.segments.is_empty() && offset < self.next_offset {
            return Err(LatticeError::Internal(format!(
                "offset {offset} is not ascending"
            )));
        }
        self.push_unchecked(offset);
        Ok(())
    }

    fn push_unchecked(&mut self, offset: u64) {
        self.push_run(offset, 1);
    }

    /// Runs may overlap the previous run, which is how `union` merges.
    fn push_run(&mut self, start: u64, length: u64) {
        let end = start + length;
        match self.segments.last_mut() {
            Some(last) if start <= last.logical_end() => {
                if end > last.logical_end() {
                    let grow = end - last.logical_end();
                    last.length += grow;
                    self.count += grow;
                }
            }
            _ => {
                self.segments.push(Segment {
                    logical_start: start,
                    length,
                    physical_start: self.count,
                });
                self.count += length;
            }
        }
        self.next_offset = self.next_offset.max(end);
    }

    pub fn finish(self) -> SparsityBitmap {
        SparsityBitmap {
            num_cells: self.num_cells,
            segments: self.segments,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_runs_and_lookup() -> Result<()> {
        let bitmap = SparsityBitmap::from_offsets(12, [1, 2, 3, 7, 9, 10])?;
        assert_eq!(bitmap.segments().len(), 3);
        assert_eq!(bitmap.count(), 6);
        assert!(!bitmap.is_present(0));
        assert!(bitmap.is_present(3));
        assert!(!bitmap.is_present(4));
        assert!(bitmap.is_present(10));
        assert!(!bitmap.is_present(11));
        assert_eq!(bitmap.physical_index(7), Some(3));
        assert_eq!(bitmap.physical_index(10), Some(5));
        assert_eq!(bitmap.physical_index(8), None);
        assert_eq!(
            bitmap.iter_offsets().collect::<Vec<_>>(),
            vec![1, 2, 3, 7, 9, 10]
        );
        Ok(())
    }

    #[test]
    fn test_rejects_bad_offsets() {
        assert!(SparsityBitmap::from_offsets(4, [0, 4]).is_err());
        assert!(SparsityBitmap::from_offsets(4, [2, 1]).is_err());
        assert!(SparsityBitmap::from_offsets(4, [2, 2]).is_err());
    }

    #[test]
    fn test_full_and_mask() {
        let full = SparsityBitmap::full(5);
        assert!(full.is_full());
        assert_eq!(full.count(), 5);
        let masked = SparsityBitmap::from_mask(&[true, false, false, true, true]);
        assert_eq!(masked.iter_offsets().collect::<Vec<_>>(), vec![0, 3, 4]);
        assert!(SparsityBitmap::empty(3).is_empty());
    }

    #[test]
    fn test_union() -> Result<()> {
        let a = SparsityBitmap::from_offsets(10, [0, 1, 5])?;
        let b = SparsityBitmap::from_offsets(10, [1, 2, 8, 9])?;
        let u = a.union(&b)?;
        assert_eq!(u.iter_offsets().collect::<Vec<_>>(), vec![0, 1, 2, 5, 8, 9]);
        assert_eq!(u.segments().len(), 3);
        assert_eq!(u.physical_index(8), Some(4));
        assert!(a.union(&SparsityBitmap::full(3)).is_err());
        Ok(())
    }

    #[test]
    fn test_encode_decode() -> Result<()> {
        let bitmap = SparsityBitmap::from_offsets(100, [3, 4, 5, 50, 99])?;
        let mut buf = BytesMut::new();
        bitmap.encode(&mut buf);
        let decoded = SparsityBitmap::decode(&mut buf.freeze())?;
        assert_eq!(decoded, bitmap);

        let mut short = BytesMut::new();
        short.put_u64_le(3);
        assert!(SparsityBitmap::decode(&mut short.freeze()).is_err());
        Ok(())
    }
}
