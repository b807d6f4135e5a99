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

use bytes::Bytes;
use dashmap::DashMap;
use lattice_core::error::Result;

use super::OverflowStore;
use crate::chunk_cache::{ArrayId, ChunkKey};

/// Keeps spilled chunks in serialized form in memory.
#[derive(Debug, Default)]
pub struct MemoryOverflowStore {
    chunks: DashMap<ChunkKey, Bytes>,
}

impl MemoryOverflowStore {
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

impl OverflowStore for MemoryOverflowStore {
    fn write(&self, key: &ChunkKey, data: Bytes) -> Result<()> {
        self.chunks.insert(*key, data);
        Ok(())
    }

    fn read(&self, key: &ChunkKey) -> Result<Option<Bytes>> {
        Ok(self.chunks.get(key).map(|v| v.value().clone()))
    }

    fn contains(&self, key: &ChunkKey) -> bool {
        self.chunks.contains_key(key)
    }

    fn remove(&self, key: &ChunkKey) -> Result<()> {
        self.chunks.remove(key);
        Ok(())
    }

    fn remove_array(&self, array: ArrayId) -> Result<()> {
        self.chunks.retain(|k, _| k.array != array);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_overflow() -> Result<()> {
        let store = MemoryOverflowStore::default();
        let a = ChunkKey::new(1, 0, 3);
        let b = ChunkKey::new(2, 0, 3);
        store.write(&a, Bytes::from_static(b"one"))?;
        store.write(&b, Bytes::from_static(b"two"))?;
        store.write(&a, Bytes::from_static(b"uno"))?;
        assert_eq!(store.read(&a)?, Some(Bytes::from_static(b"uno")));
        store.remove_array(1)?;
        assert!(!store.contains(&a));
        assert!(store.contains(&b));
        store.remove(&b)?;
        store.remove(&b)?;
        assert!(store.is_empty());
        Ok(())
    }
}
