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

//! Materialized attribute chunks and the payloads they travel as.

use std::sync::Arc;

use bytes::{Buf, BufMut};

use crate::aggregate::Aggregate;
use crate::bitmap::{BitmapBuilder, SharedBitmap, SparsityBitmap};
use crate::error::{LatticeError, ProtocolViolation, Result};
use crate::schema::{Coordinate, Coordinates};

/// A single attribute value of a cell.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int64(i64),
    Float64(f64),
    Utf8(String),
}

impl Value {
    pub fn size_bytes(&self) -> usize {
        std::mem::size_of::<Value>()
            + match self {
                Value::Utf8(s) => s.len(),
                _ => 0,
            }
    }

    fn encode(&self, buf: &mut impl BufMut) {
        match self {
            Value::Null => buf.put_u8(0),
            Value::Bool(v) => {
                buf.put_u8(1);
                buf.put_u8(*v as u8);
            }
            Value::Int64(v) => {
                buf.put_u8(2);
                buf.put_i64_le(*v);
            }
            Value::Float64(v) => {
                buf.put_u8(3);
                buf.put_f64_le(*v);
            }
            Value::Utf8(v) => {
                buf.put_u8(4);
                buf.put_u32_le(v.len() as u32);
                buf.put_slice(v.as_bytes());
            }
        }
    }

    fn decode(buf: &mut impl Buf) -> Result<Self> {
        need(buf, 1)?;
        let value = match buf.get_u8() {
            0 => Value::Null,
            1 => {
                need(buf, 1)?;
                Value::Bool(buf.get_u8() != 0)
            }
            2 => {
                need(buf, 8)?;
                Value::Int64(buf.get_i64_le())
            }
            3 => {
                need(buf, 8)?;
                Value::Float64(buf.get_f64_le())
            }
            4 => {
                need(buf, 4)?;
                let len = buf.get_u32_le() as usize;
                need(buf, len)?;
                let bytes = buf.copy_to_bytes(len);
                Value::Utf8(
                    String::from_utf8(bytes.to_vec())
                        .map_err(|e| malformed(&e.to_string()))?,
                )
            }
            tag => return Err(malformed(&format!("unknown value tag {tag}"))),
        };
        Ok(value)
    }
}

fn need(buf: &mut impl Buf, n: usize) -> Result<()> {
    if buf.remaining() < n {
        Err(malformed("truncated value"))
    } else {
        Ok(())
    }
}

fn malformed(desc: &str) -> LatticeError {
    ProtocolViolation::MalformedPayload(desc.to_string()).into()
}

/// One attribute of one chunk position.
///
/// `values` holds one entry per present cell of `bitmap`, in ascending
/// offset order.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    position: Coordinates,
    bitmap: SharedBitmap,
    values: Vec<Value>,
}

impl Chunk {
    pub fn try_new(
        position: Coordinates,
        bitmap: SharedBitmap,
        values: Vec<Value>,
    ) -> Result<Self> {
        if values.len() as u64 != bitmap.count() {
            return Err(malformed(&format!(
                "chunk at {position:?} has {} values but its bitmap has {} present cells",
                values.len(),
                bitmap.count()
            )));
        }
        Ok(Self {
            position,
            bitmap,
            values,
        })
    }

    /// A chunk of a non-emptyable array, every cell present.
    pub fn dense(position: Coordinates, values: Vec<Value>) -> Self {
        let bitmap = Arc::new(SparsityBitmap::full(values.len() as u64));
        Self {
            position,
            bitmap,
            values,
        }
    }

    /// A chunk with no present cells.
    pub fn empty(position: Coordinates, num_cells: u64) -> Self {
        Self {
            position,
            bitmap: Arc::new(SparsityBitmap::empty(num_cells)),
            values: vec![],
        }
    }

    pub fn position(&self) -> &[Coordinate] {
        &self.position
    }

    pub fn bitmap(&self) -> &SharedBitmap {
        &self.bitmap
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn count(&self) -> usize {
        self.values.len()
    }

    pub fn num_cells(&self) -> u64 {
        self.bitmap.num_cells()
    }

    pub fn value_at(&self, offset: u64) -> Option<&Value> {
        self.bitmap
            .physical_index(offset)
            .and_then(|i| self.values.get(i as usize))
    }

    /// Present cells as (offset, value) in ascending offset order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, &Value)> {
        self.bitmap.iter_offsets().zip(self.values.iter())
    }

    /// Union of present cells; where both chunks have a cell, `incoming` wins.
    pub fn merge(&self, incoming: &Chunk) -> Result<Chunk> {
        self.merge_with(incoming, |_, new| Ok(new.clone()))
    }

    /// Union of present cells; where both chunks have a cell, the values are
    /// combined with `aggregate`.
    pub fn aggregate_merge(
        &self,
        incoming: &Chunk,
        aggregate: &dyn Aggregate,
    ) -> Result<Chunk> {
        self.merge_with(incoming, |old, new| aggregate.combine(old, new))
    }

    fn merge_with(
        &self,
        incoming: &Chunk,
        combine: impl Fn(&Value, &Value) -> Result<Value>,
    ) -> Result<Chunk> {
        if self.position != incoming.position {
            return Err(LatticeError::Internal(format!(
                "cannot merge chunk at {:?} into chunk at {:?}",
                incoming.position, self.position
            )));
        }
        if incoming.bitmap.is_empty() {
            return Ok(self.clone());
        }
        if self.bitmap.is_empty() {
            return Ok(incoming.clone());
        }
        let bitmap = self.bitmap.union(&incoming.bitmap)?;
        let mut values = Vec::with_capacity(bitmap.count() as usize);
        for offset in bitmap.iter_offsets() {
            let value = match (self.value_at(offset), incoming.value_at(offset)) {
                (Some(old), Some(new)) => combine(old, new)?,
                (Some(old), None) => old.clone(),
                (None, Some(new)) => new.clone(),
                (None, None) => {
                    return Err(LatticeError::Internal(format!(
                        "offset {offset} present in union but in neither input"
                    )))
                }
            };
            values.push(value);
        }
        Ok(Chunk {
            position: self.position.clone(),
            bitmap: Arc::new(bitmap),
            values,
        })
    }

    /// Approximate in-memory footprint, the unit of the chunk cache budget.
    ///
    /// The shared bitmap is counted by every chunk that holds it.
    pub fn size_bytes(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.position.len() * std::mem::size_of::<Coordinate>()
            + self.bitmap.size_bytes()
            + self.values.iter().map(Value::size_bytes).sum::<usize>()
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.position.len() as u32);
        for c in &self.position {
            buf.put_i64_le(*c);
        }
        self.bitmap.encode(buf);
        buf.put_u64_le(self.values.len() as u64);
        for v in &self.values {
            v.encode(buf);
        }
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < 4 {
            return Err(malformed("truncated chunk header"));
        }
        let ndims = buf.get_u32_le() as usize;
        if buf.remaining() < ndims * 8 {
            return Err(malformed("truncated chunk position"));
        }
        let position = (0..ndims).map(|_| buf.get_i64_le()).collect::<Vec<_>>();
        let bitmap = SparsityBitmap::decode(buf)?;
        if buf.remaining() < 8 {
            return Err(malformed("truncated value count"));
        }
        let count = buf.get_u64_le();
        let values = (0..count)
            .map(|_| Value::decode(buf))
            .collect::<Result<Vec<_>>>()?;
        Self::try_new(position, Arc::new(bitmap), values)
    }
}

/// Cell data of one attribute chunk as sent over the wire.
///
/// A payload carries its own bitmap when the sender embeds it, or is bare
/// when the bitmap travels separately and must be attached by the receiver.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkPayload {
    values: Vec<Value>,
    bitmap: Option<SharedBitmap>,
}

impl ChunkPayload {
    pub fn with_bitmap(values: Vec<Value>, bitmap: SharedBitmap) -> Self {
        Self {
            values,
            bitmap: Some(bitmap),
        }
    }

    pub fn bare(values: Vec<Value>) -> Self {
        Self {
            values,
            bitmap: None,
        }
    }

    /// The payload of a bitmap-only chunk.
    pub fn bitmap_only(bitmap: SharedBitmap) -> Self {
        Self {
            values: vec![],
            bitmap: Some(bitmap),
        }
    }

    pub fn from_chunk(chunk: &Chunk, embed_bitmap: bool) -> Self {
        Self {
            values: chunk.values.clone(),
            bitmap: embed_bitmap.then(|| chunk.bitmap.clone()),
        }
    }

    pub fn count(&self) -> usize {
        self.values.len()
    }

    pub fn bitmap(&self) -> Option<&SharedBitmap> {
        self.bitmap.as_ref()
    }

    pub fn size_bytes(&self) -> usize {
        self.values.iter().map(Value::size_bytes).sum::<usize>()
            + self.bitmap.as_ref().map_or(0, |b| b.size_bytes())
    }

    /// Materialize at `position`, using the embedded bitmap if any and
    /// `fallback` otherwise.
    pub fn close(
        self,
        position: Coordinates,
        fallback: Option<SharedBitmap>,
    ) -> Result<Chunk> {
        let bitmap = match (self.bitmap, fallback) {
            (Some(b), _) | (None, Some(b)) => b,
            (None, None) => {
                return Err(malformed(&format!(
                    "payload at {position:?} has no bitmap to close over"
                )))
            }
        };
        Chunk::try_new(position, bitmap, self.values)
    }

    /// Materialize a dense payload without a bitmap.
    pub fn close_dense(self, position: Coordinates, num_cells: u64) -> Result<Chunk> {
        match self.bitmap {
            Some(b) => Chunk::try_new(position, b, self.values),
            None if self.values.len() as u64 == num_cells => {
                Ok(Chunk::dense(position, self.values))
            }
            None => Err(malformed(&format!(
                "dense payload at {position:?} has {} values for {num_cells} cells",
                self.values.len()
            ))),
        }
    }
}

/// Build a chunk from (offset, value) pairs with ascending offsets.
pub fn chunk_from_cells(
    position: Coordinates,
    num_cells: u64,
    cells: impl IntoIterator<Item = (u64, Value)>,
) -> Result<Chunk> {
    let mut builder = BitmapBuilder::new(num_cells);
    let mut values = vec![];
    for (offset, value) in cells {
        builder.push(offset)?;
        values.push(value);
    }
    Chunk::try_new(position, Arc::new(builder.finish()), values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::Sum;
    use bytes::BytesMut;

    fn ints(position: &[i64], cells: &[(u64, i64)]) -> Chunk {
        chunk_from_cells(
            position.to_vec(),
            8,
            cells.iter().map(|(o, v)| (*o, Value::Int64(*v))),
        )
        .unwrap()
    }

    #[test]
    fn test_merge_overwrites() -> Result<()> {
        let a = ints(&[0, 0], &[(0, 1), (2, 2), (5, 3)]);
        let b = ints(&[0, 0], &[(2, 20), (6, 30)]);
        let merged = a.merge(&b)?;
        assert_eq!(
            merged.iter().map(|(o, v)| (o, v.clone())).collect::<Vec<_>>(),
            vec![
                (0, Value::Int64(1)),
                (2, Value::Int64(20)),
                (5, Value::Int64(3)),
                (6, Value::Int64(30))
            ]
        );
        Ok(())
    }

    #[test]
    fn test_aggregate_merge() -> Result<()> {
        let a = ints(&[0, 0], &[(1, 1), (2, 2)]);
        let b = ints(&[0, 0], &[(2, 5), (3, 7)]);
        let merged = a.aggregate_merge(&b, &Sum)?;
        assert_eq!(merged.value_at(1), Some(&Value::Int64(1)));
        assert_eq!(merged.value_at(2), Some(&Value::Int64(7)));
        assert_eq!(merged.value_at(3), Some(&Value::Int64(7)));
        assert_eq!(merged.count(), 3);
        Ok(())
    }

    #[test]
    fn test_merge_rejects_other_position() {
        let a = ints(&[0, 0], &[(1, 1)]);
        let b = ints(&[0, 4], &[(1, 1)]);
        assert!(a.merge(&b).is_err());
    }

    #[test]
    fn test_close_payload() -> Result<()> {
        let bitmap = Arc::new(SparsityBitmap::from_offsets(4, [1, 3])?);
        let bare = ChunkPayload::bare(vec![Value::Int64(1), Value::Int64(2)]);
        assert!(bare.clone().close(vec![0], None).is_err());
        let chunk = bare.close(vec![0], Some(bitmap.clone()))?;
        assert!(Arc::ptr_eq(chunk.bitmap(), &bitmap));
        assert_eq!(chunk.value_at(3), Some(&Value::Int64(2)));

        let too_many = ChunkPayload::bare(vec![Value::Null; 3]);
        assert!(too_many.close(vec![0], Some(bitmap)).is_err());

        let dense = ChunkPayload::bare(vec![Value::Bool(true); 4]);
        assert!(dense.close_dense(vec![0], 4)?.bitmap().is_full());
        Ok(())
    }

    #[test]
    fn test_encode_decode() -> Result<()> {
        let chunk = chunk_from_cells(
            vec![-3, 8],
            6,
            vec![
                (0, Value::Utf8("x".into())),
                (3, Value::Float64(1.5)),
                (4, Value::Null),
                (5, Value::Bool(true)),
            ],
        )?;
        let mut buf = BytesMut::new();
        chunk.encode(&mut buf);
        let decoded = Chunk::decode(&mut buf.freeze())?;
        assert_eq!(decoded, chunk);
        Ok(())
    }
}
