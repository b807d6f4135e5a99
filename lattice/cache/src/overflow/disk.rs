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

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use lattice_core::error::{LatticeError, Result};
use log::error;

use super::OverflowStore;
use crate::chunk_cache::{ArrayId, ChunkKey};

/// One file per spilled chunk, grouped in a directory per array.
#[derive(Debug)]
pub struct DiskOverflowStore {
    root: PathBuf,
}

impl DiskOverflowStore {
    pub fn try_new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(|e| {
            error!("Failed to create overflow directory {}: {e:?}", root.display());
            LatticeError::IoError(e)
        })?;
        Ok(Self { root })
    }

    fn array_dir(&self, array: ArrayId) -> PathBuf {
        self.root.join(format!("array-{array}"))
    }

    fn chunk_path(&self, key: &ChunkKey) -> PathBuf {
        self.array_dir(key.array)
            .join(format!("{}-{}.chunk", key.attribute, key.sequence))
    }
}

fn ignore_not_found(result: std::io::Result<()>) -> Result<()> {
    match result {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(LatticeError::IoError(e)),
        _ => Ok(()),
    }
}

impl OverflowStore for DiskOverflowStore {
    fn write(&self, key: &ChunkKey, data: Bytes) -> Result<()> {
        let path = self.chunk_path(key);
        fs::create_dir_all(self.array_dir(key.array))?;
        fs::write(&path, &data).map_err(|e| {
            error!("Failed to spill chunk to {}: {e:?}", path.display());
            LatticeError::IoError(e)
        })
    }

    fn read(&self, key: &ChunkKey) -> Result<Option<Bytes>> {
        match fs::read(self.chunk_path(key)) {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(LatticeError::IoError(e)),
        }
    }

    fn contains(&self, key: &ChunkKey) -> bool {
        self.chunk_path(key).is_file()
    }

    fn remove(&self, key: &ChunkKey) -> Result<()> {
        ignore_not_found(fs::remove_file(self.chunk_path(key)))
    }

    fn remove_array(&self, array: ArrayId) -> Result<()> {
        ignore_not_found(fs::remove_dir_all(self.array_dir(array)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disk_overflow() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = DiskOverflowStore::try_new(dir.path().join("spill"))?;
        let key = ChunkKey::new(7, 1, 42);
        assert_eq!(store.read(&key)?, None);
        store.write(&key, Bytes::from_static(b"payload"))?;
        assert!(store.contains(&key));
        assert_eq!(store.read(&key)?, Some(Bytes::from_static(b"payload")));

        store.remove_array(7)?;
        assert!(!store.contains(&key));
        store.remove(&key)?;
        store.remove_array(7)?;
        Ok(())
    }
}
