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

//! In-memory array whose chunks live in a [`ChunkCache`].

use std::collections::BTreeSet;
use std::sync::Arc;

use lattice_core::aggregate::Aggregate;
use lattice_core::chunk::{Chunk, Value};
use lattice_core::coordinates::CoordinatesMapper;
use lattice_core::error::{LatticeError, Result};
use lattice_core::schema::{ArrayDesc, AttributeId, Coordinate, Coordinates};
use log::warn;
use parking_lot::Mutex;

use crate::chunk_cache::{ArrayId, ChunkCache, ChunkHandle, ChunkKey};

/// An array backed by a shared [`ChunkCache`].
///
/// The array only records which chunk positions exist per attribute; chunk
/// data is owned by the cache and may be spilled to overflow storage at any
/// time it is not pinned. Dropping the array invalidates its chunks.
#[derive(Debug)]
pub struct MemArray {
    id: ArrayId,
    desc: ArrayDesc,
    mapper: CoordinatesMapper,
    cache: Arc<ChunkCache>,
    sequences: Mutex<Vec<BTreeSet<u64>>>,
}

impl MemArray {
    pub fn new(desc: ArrayDesc, cache: Arc<ChunkCache>) -> Self {
        let mapper = desc.mapper();
        let sequences = Mutex::new(vec![BTreeSet::new(); desc.num_attributes()]);
        Self {
            id: cache.register_array(),
            desc,
            mapper,
            cache,
            sequences,
        }
    }

    pub fn id(&self) -> ArrayId {
        self.id
    }

    pub fn desc(&self) -> &ArrayDesc {
        &self.desc
    }

    pub fn mapper(&self) -> &CoordinatesMapper {
        &self.mapper
    }

    pub fn cache(&self) -> &Arc<ChunkCache> {
        &self.cache
    }

    /// Cache key of the chunk of `attribute` at `position`.
    pub fn key(&self, attribute: AttributeId, position: &[Coordinate]) -> Result<ChunkKey> {
        if attribute >= self.desc.num_attributes() {
            return Err(LatticeError::Internal(format!(
                "array '{}' has no attribute {attribute}",
                self.desc.name
            )));
        }
        if !self.desc.is_chunk_aligned(position) {
            return Err(LatticeError::Internal(format!(
                "{position:?} is not a chunk position of array '{}'",
                self.desc.name
            )));
        }
        Ok(ChunkKey::new(
            self.id,
            attribute,
            self.mapper.chunk_to_sequence(position),
        ))
    }

    /// Pin the chunk of `attribute` at `position`, if it was written.
    pub fn get_chunk(
        &self,
        attribute: AttributeId,
        position: &[Coordinate],
    ) -> Result<Option<ChunkHandle>> {
        let key = self.key(attribute, position)?;
        if !self.sequences.lock()[attribute].contains(&key.sequence) {
            return Ok(None);
        }
        self.cache.get(&key)
    }

    /// Store `chunk`, replacing any chunk of `attribute` at its position.
    pub fn write_chunk(&self, attribute: AttributeId, chunk: Chunk) -> Result<()> {
        let key = self.checked_key(attribute, &chunk)?;
        self.cache.put(key, chunk)?;
        self.sequences.lock()[attribute].insert(key.sequence);
        Ok(())
    }

    /// Merge `chunk` into the chunk of `attribute` at its position.
    ///
    /// Overlapping cells are combined with `aggregate` when given, otherwise
    /// the incoming value wins.
    pub fn merge_chunk(
        &self,
        attribute: AttributeId,
        chunk: Chunk,
        aggregate: Option<&dyn Aggregate>,
    ) -> Result<()> {
        let key = self.checked_key(attribute, &chunk)?;
        let existing = if self.sequences.lock()[attribute].contains(&key.sequence) {
            self.cache.get(&key)?
        } else {
            None
        };
        match existing {
            Some(mut handle) => {
                let merged = match aggregate {
                    Some(aggregate) => handle.aggregate_merge(&chunk, aggregate)?,
                    None => handle.merge(&chunk)?,
                };
                handle.update(merged)
            }
            None => self.write_chunk(attribute, chunk),
        }
    }

    /// Written chunk positions of `attribute` in ascending sequence order.
    pub fn positions(&self, attribute: AttributeId) -> Vec<Coordinates> {
        self.sequences
            .lock()
            .get(attribute)
            .map(|seqs| {
                seqs.iter()
                    .map(|s| self.mapper.sequence_to_chunk(*s))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of written chunks over all attributes.
    pub fn chunk_count(&self) -> usize {
        self.sequences.lock().iter().map(BTreeSet::len).sum()
    }

    /// Value of `attribute` at `cell`, `None` when the cell is empty.
    pub fn cell_value(&self, attribute: AttributeId, cell: &[Coordinate]) -> Result<Option<Value>> {
        if !self.desc.contains(cell) {
            return Err(LatticeError::Internal(format!(
                "{cell:?} is outside array '{}'",
                self.desc.name
            )));
        }
        let position = self.desc.chunk_position_for(cell);
        let Some(handle) = self.get_chunk(attribute, &position)? else {
            return Ok(None);
        };
        let offset = self.mapper.cell_to_offset(&position, cell);
        Ok(handle.value_at(offset).cloned())
    }

    fn checked_key(&self, attribute: AttributeId, chunk: &Chunk) -> Result<ChunkKey> {
        let key = self.key(attribute, chunk.position())?;
        let expected = self.mapper.num_cells(chunk.position());
        if chunk.num_cells() != expected {
            return Err(LatticeError::Internal(format!(
                "chunk at {:?} has {} cells, array '{}' expects {expected}",
                chunk.position(),
                chunk.num_cells(),
                self.desc.name
            )));
        }
        Ok(key)
    }
}

impl Drop for MemArray {
    fn drop(&mut self) {
        if let Err(e) = self.cache.invalidate_array(self.id) {
            warn!("Failed to release chunks of array '{}': {e}", self.desc.name);
        }
    }
}
