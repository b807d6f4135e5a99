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

//! Secondary storage for chunks evicted from the chunk cache.
//!
//! Stores serialized chunks addressed by [`ChunkKey`]. Calls are synchronous
//! because eviction writes through before the cache slot is reused.

mod disk;
mod memory;

use std::fmt::Debug;
use std::sync::Arc;

use bytes::Bytes;
use lattice_core::config::LatticeConfig;
use lattice_core::error::Result;
use log::info;

use crate::chunk_cache::{ArrayId, ChunkKey};

pub use disk::DiskOverflowStore;
pub use memory::MemoryOverflowStore;

pub trait OverflowStore: Debug + Send + Sync {
    /// Store `data` under `key`, replacing an older version.
    fn write(&self, key: &ChunkKey, data: Bytes) -> Result<()>;

    fn read(&self, key: &ChunkKey) -> Result<Option<Bytes>>;

    fn contains(&self, key: &ChunkKey) -> bool;

    /// Removing a missing key is not an error.
    fn remove(&self, key: &ChunkKey) -> Result<()>;

    /// Remove every chunk of `array`.
    fn remove_array(&self, array: ArrayId) -> Result<()>;
}

/// Disk overflow under `lattice.overflow.dir` when set, in-memory otherwise.
pub fn create_overflow_store(config: &LatticeConfig) -> Result<Arc<dyn OverflowStore>> {
    match config.overflow_dir() {
        Some(dir) => {
            info!("Chunk cache spills to {dir}");
            Ok(Arc::new(DiskOverflowStore::try_new(dir)?))
        }
        None => Ok(Arc::new(MemoryOverflowStore::default())),
    }
}
