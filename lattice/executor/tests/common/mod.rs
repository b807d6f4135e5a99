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

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use lattice_cache::overflow::MemoryOverflowStore;
use lattice_cache::{ChunkCache, MemArray};
use lattice_core::bitmap::SparsityBitmap;
use lattice_core::chunk::{chunk_from_cells, ChunkPayload, Value};
use lattice_core::config::LatticeConfig;
use lattice_core::error::Result;
use lattice_core::schema::{ArrayDesc, AttributeId, Coordinate, DimensionDesc};
use lattice_core::transport::LocalTransport;
use lattice_executor::ShuffleService;

/// Cells per chunk of [`line`].
pub const CHUNK_CELLS: u64 = 4;

/// One dimension of three chunks, two attributes.
pub fn line() -> ArrayDesc {
    ArrayDesc::try_new(
        "line",
        vec![DimensionDesc::try_new("i", 0, 11, CHUNK_CELLS as i64, 0).unwrap()],
        &["a", "b"],
        true,
    )
    .unwrap()
}

/// A 2-d array of 4 x 4 chunks.
pub fn grid() -> ArrayDesc {
    ArrayDesc::try_new(
        "grid",
        vec![
            DimensionDesc::try_new("i", 0, 15, 4, 0).unwrap(),
            DimensionDesc::try_new("j", 0, 15, 4, 0).unwrap(),
        ],
        &["value", "weight"],
        true,
    )
    .unwrap()
}

pub fn memory_cache(capacity: usize) -> Arc<ChunkCache> {
    ChunkCache::new(capacity, Arc::new(MemoryOverflowStore::default()))
}

pub fn payload(offsets: &[u64], values: &[i64]) -> ChunkPayload {
    let bitmap = SparsityBitmap::from_offsets(CHUNK_CELLS, offsets.iter().copied()).unwrap();
    ChunkPayload::with_bitmap(
        values.iter().map(|v| Value::Int64(*v)).collect(),
        Arc::new(bitmap),
    )
}

pub fn cells(array: &MemArray, attribute: AttributeId, position: &[Coordinate]) -> Vec<(u64, Value)> {
    array
        .get_chunk(attribute, position)
        .unwrap()
        .map(|chunk| chunk.iter().map(|(o, v)| (o, v.clone())).collect())
        .unwrap_or_default()
}

/// Cells of every chunk keyed by (attribute, position).
pub type Snapshot = BTreeMap<(AttributeId, Vec<Coordinate>), Vec<(u64, Value)>>;

pub fn snapshot(array: &MemArray) -> Snapshot {
    let mut out = BTreeMap::new();
    for attribute in 0..array.desc().num_attributes() {
        for position in array.positions(attribute) {
            let c = cells(array, attribute, &position);
            out.insert((attribute, position), c);
        }
    }
    out
}

/// Fill a 2-d `array` with cells where `(i * 31 + j * 17) % 3 == 0`, attribute 0
/// holding the linear cell number and attribute 1 a weight of one.
pub fn fill_sparse(array: &MemArray, positions: impl IntoIterator<Item = Vec<Coordinate>>) -> Result<u64> {
    let mapper = array.mapper().clone();
    let mut total = 0;
    for position in positions {
        let extent = mapper.chunk_extent(&position);
        let present = (0..extent.num_cells())
            .map(|offset| (offset, extent.offset_to_cell(offset)))
            .filter(|(_, cell)| (cell[0] * 31 + cell[1] * 17) % 3 == 0)
            .collect::<Vec<_>>();
        if present.is_empty() {
            continue;
        }
        total += present.len() as u64;
        let values = present
            .iter()
            .map(|(offset, cell)| (*offset, Value::Int64(cell[0] * 16 + cell[1])));
        array.write_chunk(0, chunk_from_cells(position.clone(), extent.num_cells(), values)?)?;
        let weights = present.iter().map(|(offset, _)| (*offset, Value::Float64(1.0)));
        array.write_chunk(1, chunk_from_cells(position, extent.num_cells(), weights)?)?;
    }
    Ok(total)
}

pub fn count_cells(array: &MemArray, attribute: AttributeId) -> u64 {
    snapshot(array)
        .into_iter()
        .filter(|((a, _), _)| *a == attribute)
        .map(|(_, cells)| cells.len() as u64)
        .sum()
}

/// Started shuffle services over an in-process mesh, plus a transport handle
/// per node for injecting faults.
pub fn cluster(
    nodes: usize,
    config: &LatticeConfig,
) -> Result<(Vec<ShuffleService>, Vec<LocalTransport>)> {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut services = vec![];
    let mut transports = vec![];
    for (transport, inbox) in LocalTransport::mesh(nodes, config.event_buffer_size()) {
        transports.push(transport.clone());
        let cache = ChunkCache::try_from_config(config)?;
        let mut service = ShuffleService::new(Arc::new(transport), cache, config.clone());
        service.start(inbox)?;
        services.push(service);
    }
    Ok((services, transports))
}
