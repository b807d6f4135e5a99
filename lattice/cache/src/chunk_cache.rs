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

//! Process-wide bounded cache of materialized chunks.
//!
//! Unpinned chunks live in one LRU list shared by all arrays and attributes.
//! A chunk is pinned while a [`ChunkHandle`] for it exists; pinned chunks
//! are kept outside the LRU list so they can never be evicted, but their
//! bytes still count against the capacity. Evicting a chunk that was written
//! since it was last loaded writes it to overflow storage first.

use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use lattice_core::chunk::Chunk;
use lattice_core::config::LatticeConfig;
use lattice_core::error::{LatticeError, Result};
use lattice_core::schema::AttributeId;
use log::{debug, warn};
use parking_lot::Mutex;

use crate::backend::policy::lru::lru_cache::LruCache;
use crate::backend::policy::lru::{ByteSizeCounter, Weighted};
use crate::backend::policy::CachePolicy;
use crate::metrics::CacheMetrics;
use crate::overflow::{create_overflow_store, OverflowStore};

/// Identifies an array registered with a [`ChunkCache`].
pub type ArrayId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkKey {
    pub array: ArrayId,
    pub attribute: AttributeId,
    /// Chunk sequence number of the position.
    pub sequence: u64,
}

impl ChunkKey {
    pub fn new(array: ArrayId, attribute: AttributeId, sequence: u64) -> Self {
        Self {
            array,
            attribute,
            sequence,
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    chunk: Arc<Chunk>,
    size: usize,
    /// Not yet in overflow storage in its current version.
    dirty: bool,
}

impl CacheEntry {
    fn new(chunk: Arc<Chunk>, dirty: bool) -> Self {
        let size = chunk.size_bytes();
        Self { chunk, size, dirty }
    }
}

impl Weighted for CacheEntry {
    fn weight(&self) -> usize {
        self.size
    }
}

#[derive(Debug)]
struct PinnedEntry {
    entry: CacheEntry,
    pins: usize,
    /// Dropped instead of returned to the LRU list on the last unpin.
    invalidated: bool,
}

#[derive(Debug)]
struct CacheState {
    lru: LruCache<ChunkKey, CacheEntry>,
    pinned: HashMap<ChunkKey, PinnedEntry>,
    pinned_bytes: usize,
    /// Bumped whenever overflow storage changes, so a load done outside the
    /// lock can tell whether it read a current version.
    overflow_epoch: u64,
}

enum Lookup {
    Hit(ChunkHandle),
    Invalidated,
    Miss,
}

pub struct ChunkCache {
    state: Mutex<CacheState>,
    overflow: Arc<dyn OverflowStore>,
    metrics: Arc<CacheMetrics>,
    next_array_id: AtomicU64,
}

impl Debug for ChunkCache {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ChunkCache")
            .field("capacity", &state.lru.capacity())
            .field("used", &state.lru.used())
            .field("pinned", &state.pinned.len())
            .field("unpinned", &state.lru.len())
            .finish()
    }
}

impl ChunkCache {
    pub fn new(capacity_bytes: usize, overflow: Arc<dyn OverflowStore>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(CacheState {
                lru: LruCache::with_resource_counter(ByteSizeCounter::new(capacity_bytes)),
                pinned: HashMap::new(),
                pinned_bytes: 0,
                overflow_epoch: 0,
            }),
            overflow,
            metrics: Arc::new(CacheMetrics::default()),
            next_array_id: AtomicU64::new(1),
        })
    }

    pub fn try_from_config(config: &LatticeConfig) -> Result<Arc<Self>> {
        let overflow = create_overflow_store(config)?;
        Ok(Self::new(config.cache_capacity_bytes(), overflow))
    }

    /// Allocate an id for a new array backed by this cache.
    pub fn register_array(&self) -> ArrayId {
        self.next_array_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn metrics(&self) -> Arc<CacheMetrics> {
        self.metrics.clone()
    }

    /// Pin the chunk at `key`, loading it from overflow storage on a miss.
    ///
    /// Returns `None` when the chunk has never been written.
    pub fn get(self: &Arc<Self>, key: &ChunkKey) -> Result<Option<ChunkHandle>> {
        let mut epoch = {
            let mut state = self.state.lock();
            match self.pin_cached(&mut state, key) {
                Lookup::Hit(handle) => return Ok(Some(handle)),
                Lookup::Invalidated => return Ok(None),
                Lookup::Miss => state.overflow_epoch,
            }
        };
        self.metrics.miss_count.inc(1);
        loop {
            // overflow reads run without the lock
            let loaded = match self.overflow.read(key)? {
                Some(mut data) => Some(Arc::new(Chunk::decode(&mut data)?)),
                None => None,
            };
            let mut state = self.state.lock();
            match self.pin_cached(&mut state, key) {
                Lookup::Hit(handle) => return Ok(Some(handle)),
                Lookup::Invalidated => return Ok(None),
                Lookup::Miss => {}
            }
            if state.overflow_epoch != epoch {
                epoch = state.overflow_epoch;
                continue;
            }
            let Some(chunk) = loaded else {
                return Ok(None);
            };
            self.metrics.load_count.inc(1);
            debug!("Loaded chunk {key:?} from overflow storage");
            self.admit(&mut state, *key, CacheEntry::new(chunk.clone(), false))?;
            return Ok(Some(self.handle(*key, chunk)));
        }
    }

    /// Store `chunk` at `key` and pin it.
    ///
    /// Fails with [`LatticeError::ResourceExhausted`] when the chunk does not
    /// fit next to the chunks pinned already. A single chunk larger than the
    /// whole capacity is admitted when nothing else is pinned.
    pub fn put(self: &Arc<Self>, key: ChunkKey, chunk: Chunk) -> Result<ChunkHandle> {
        self.metrics.put_count.inc(1);
        let chunk = Arc::new(chunk);
        let entry = CacheEntry::new(chunk.clone(), true);
        let mut state = self.state.lock();
        if state.pinned.contains_key(&key) {
            self.replace_pinned(&mut state, &key, entry, true)?;
            return Ok(self.handle(key, chunk));
        }
        let previous = state.lru.remove(&key);
        if let Err(e) = self.admit(&mut state, key, entry) {
            // the cached version stays readable
            if let Some(previous) = previous {
                state.lru.insert(key, previous);
            }
            return Err(e);
        }
        Ok(self.handle(key, chunk))
    }

    /// Release a pinned chunk. Equivalent to dropping the handle.
    pub fn release(&self, handle: ChunkHandle) {
        drop(handle)
    }

    /// Change the byte budget, evicting unpinned chunks as needed.
    ///
    /// Pinned chunks stay; usage above a lowered capacity is tolerated until
    /// they are released.
    pub fn set_capacity_bytes(&self, capacity: usize) -> Result<()> {
        let mut state = self.state.lock();
        state.lru.set_capacity(capacity);
        self.evict_overflowing(&mut state)
    }

    pub fn capacity_bytes(&self) -> usize {
        self.state.lock().lru.capacity()
    }

    /// Bytes of all cached chunks, pinned or not.
    pub fn used_bytes(&self) -> usize {
        self.state.lock().lru.used()
    }

    pub fn pinned_bytes(&self) -> usize {
        self.state.lock().pinned_bytes
    }

    /// Number of chunks held in memory.
    pub fn len(&self) -> usize {
        let state = self.state.lock();
        state.lru.len() + state.pinned.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a chunk is stored at `key`, in memory or in overflow storage.
    pub fn contains(&self, key: &ChunkKey) -> bool {
        {
            let state = self.state.lock();
            if state.lru.contains_key(key) {
                return true;
            }
            if let Some(pinned) = state.pinned.get(key) {
                return !pinned.invalidated;
            }
        }
        self.overflow.contains(key)
    }

    /// Drop the chunk at `key` from memory and overflow storage.
    pub fn invalidate(&self, key: &ChunkKey) -> Result<()> {
        let mut state = self.state.lock();
        state.lru.remove(key);
        if let Some(pinned) = state.pinned.get_mut(key) {
            pinned.invalidated = true;
        }
        state.overflow_epoch += 1;
        self.overflow.remove(key)
    }

    /// Drop every chunk of `array` from memory and overflow storage.
    pub fn invalidate_array(&self, array: ArrayId) -> Result<()> {
        let mut state = self.state.lock();
        let removed = state.lru.remove_where(|k| k.array == array);
        for (key, pinned) in state.pinned.iter_mut() {
            if key.array == array {
                pinned.invalidated = true;
            }
        }
        debug!(
            "Invalidated array {array}, {} unpinned chunks dropped",
            removed.len()
        );
        state.overflow_epoch += 1;
        self.overflow.remove_array(array)
    }

    /// Pin `key` if it is held in memory.
    fn pin_cached(self: &Arc<Self>, state: &mut CacheState, key: &ChunkKey) -> Lookup {
        if let Some(pinned) = state.pinned.get_mut(key) {
            if pinned.invalidated {
                return Lookup::Invalidated;
            }
            pinned.pins += 1;
            self.metrics.hit_count.inc(1);
            return Lookup::Hit(self.handle(*key, pinned.entry.chunk.clone()));
        }
        let Some(entry) = state.lru.remove(key) else {
            return Lookup::Miss;
        };
        self.metrics.hit_count.inc(1);
        let chunk = entry.chunk.clone();
        // the bytes move from the list to the reservation
        state.lru.reserve(entry.size);
        state.pinned_bytes += entry.size;
        state.pinned.insert(
            *key,
            PinnedEntry {
                entry,
                pins: 1,
                invalidated: false,
            },
        );
        Lookup::Hit(self.handle(*key, chunk))
    }

    fn handle(self: &Arc<Self>, key: ChunkKey, chunk: Arc<Chunk>) -> ChunkHandle {
        ChunkHandle {
            cache: self.clone(),
            key,
            chunk,
        }
    }

    fn admit(&self, state: &mut CacheState, key: ChunkKey, entry: CacheEntry) -> Result<()> {
        let capacity = state.lru.capacity();
        if state.pinned_bytes > 0 && state.pinned_bytes + entry.size > capacity {
            return Err(LatticeError::ResourceExhausted {
                requested: entry.size,
                capacity,
                pinned: state.pinned_bytes,
            });
        }
        state.lru.reserve(entry.size);
        if let Err(e) = self.evict_overflowing(state) {
            state.lru.unreserve(entry.size);
            return Err(e);
        }
        state.pinned_bytes += entry.size;
        state.pinned.insert(
            key,
            PinnedEntry {
                entry,
                pins: 1,
                invalidated: false,
            },
        );
        Ok(())
    }

    fn replace_pinned(
        &self,
        state: &mut CacheState,
        key: &ChunkKey,
        entry: CacheEntry,
        add_pin: bool,
    ) -> Result<()> {
        let new_size = entry.size;
        let Some(pinned) = state.pinned.get_mut(key) else {
            return Err(LatticeError::Internal(format!("chunk {key:?} is not pinned")));
        };
        let old_size = pinned.entry.size;
        pinned.entry = entry;
        pinned.invalidated = false;
        if add_pin {
            pinned.pins += 1;
        }
        state.pinned_bytes = state.pinned_bytes - old_size + new_size;
        state.lru.unreserve(old_size);
        state.lru.reserve(new_size);
        self.evict_overflowing(state)
    }

    /// Evict from the LRU end until the budget holds or nothing unpinned is
    /// left. A dirty victim leaves the list only after it was written out.
    fn evict_overflowing(&self, state: &mut CacheState) -> Result<()> {
        while state.lru.exceed_capacity() {
            let Some((key, entry)) = state.lru.victim().map(|(k, v)| (*k, v.clone())) else {
                break;
            };
            if entry.dirty {
                let mut buf = BytesMut::with_capacity(entry.size);
                entry.chunk.encode(&mut buf);
                state.overflow_epoch += 1;
                self.overflow.write(&key, buf.freeze())?;
                self.metrics.spill_count.inc(1);
                debug!("Spilled chunk {key:?} of {} bytes", entry.size);
            }
            state.lru.pop();
            self.metrics.eviction_count.inc(1);
        }
        Ok(())
    }

    fn update_pinned(&self, key: &ChunkKey, chunk: Arc<Chunk>) -> Result<()> {
        self.metrics.put_count.inc(1);
        let mut state = self.state.lock();
        self.replace_pinned(&mut state, key, CacheEntry::new(chunk, true), false)
    }

    fn unpin(&self, key: &ChunkKey) {
        let mut state = self.state.lock();
        let Some(pinned) = state.pinned.get_mut(key) else {
            return;
        };
        pinned.pins -= 1;
        if pinned.pins > 0 {
            return;
        }
        let Some(pinned) = state.pinned.remove(key) else {
            return;
        };
        state.pinned_bytes -= pinned.entry.size;
        state.lru.unreserve(pinned.entry.size);
        if pinned.invalidated {
            return;
        }
        state.lru.insert(*key, pinned.entry);
        if let Err(e) = self.evict_overflowing(&mut state) {
            // the failed victim stays cached, only the budget is exceeded
            warn!("Failed to evict after releasing chunk {key:?}: {e}");
        }
    }
}

/// A pinned chunk. Dropping the handle releases the pin.
pub struct ChunkHandle {
    cache: Arc<ChunkCache>,
    key: ChunkKey,
    chunk: Arc<Chunk>,
}

impl ChunkHandle {
    pub fn key(&self) -> &ChunkKey {
        &self.key
    }

    pub fn chunk(&self) -> &Arc<Chunk> {
        &self.chunk
    }

    /// Replace the pinned chunk with a new version.
    pub fn update(&mut self, chunk: Chunk) -> Result<()> {
        let chunk = Arc::new(chunk);
        self.cache.update_pinned(&self.key, chunk.clone())?;
        self.chunk = chunk;
        Ok(())
    }
}

impl Deref for ChunkHandle {
    type Target = Chunk;

    fn deref(&self) -> &Chunk {
        &self.chunk
    }
}

impl Debug for ChunkHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkHandle")
            .field("key", &self.key)
            .field("cells", &self.chunk.count())
            .finish()
    }
}

impl Drop for ChunkHandle {
    fn drop(&mut self) {
        self.cache.unpin(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overflow::MemoryOverflowStore;
    use lattice_core::chunk::Value;

    fn chunk(seq: u64, value: i64) -> Chunk {
        Chunk::dense(vec![seq as i64 * 4], vec![Value::Int64(value); 4])
    }

    fn chunk_size() -> usize {
        chunk(0, 0).size_bytes()
    }

    fn cache(chunks: usize) -> (Arc<ChunkCache>, Arc<MemoryOverflowStore>) {
        let overflow = Arc::new(MemoryOverflowStore::default());
        (ChunkCache::new(chunks * chunk_size(), overflow.clone()), overflow)
    }

    fn value_of(cache: &Arc<ChunkCache>, key: &ChunkKey) -> Result<Option<Value>> {
        Ok(cache.get(key)?.map(|h| h.values()[0].clone()))
    }

    #[test]
    fn test_evicts_least_recently_touched() -> Result<()> {
        let (cache, overflow) = cache(3);
        for seq in 0..3 {
            cache.put(ChunkKey::new(1, 0, seq), chunk(seq, seq as i64))?;
        }
        // touch 0 so 1 becomes the oldest
        value_of(&cache, &ChunkKey::new(1, 0, 0))?;
        cache.put(ChunkKey::new(1, 0, 3), chunk(3, 3))?;

        assert_eq!(cache.len(), 3);
        assert!(overflow.contains(&ChunkKey::new(1, 0, 1)));
        assert!(!overflow.contains(&ChunkKey::new(1, 0, 0)));
        assert!(cache.used_bytes() <= cache.capacity_bytes());
        assert_eq!(cache.metrics().spill_count(), 1);

        // evicted data is reloaded, never lost
        assert_eq!(value_of(&cache, &ChunkKey::new(1, 0, 1))?, Some(Value::Int64(1)));
        assert_eq!(cache.metrics().load_count(), 1);
        assert!(cache.used_bytes() <= cache.capacity_bytes());
        Ok(())
    }

    #[test]
    fn test_clean_chunks_are_not_rewritten() -> Result<()> {
        let (cache, _) = cache(1);
        cache.put(ChunkKey::new(1, 0, 0), chunk(0, 0))?;
        cache.put(ChunkKey::new(1, 0, 1), chunk(1, 1))?;
        assert_eq!(cache.metrics().spill_count(), 1);
        // reload 0 evicts dirty 1; reload 1 evicts clean 0
        value_of(&cache, &ChunkKey::new(1, 0, 0))?;
        value_of(&cache, &ChunkKey::new(1, 0, 1))?;
        assert_eq!(cache.metrics().spill_count(), 2);
        assert_eq!(cache.metrics().eviction_count(), 3);
        Ok(())
    }

    #[test]
    fn test_pinned_chunks_are_never_evicted() -> Result<()> {
        let (cache, overflow) = cache(2);
        let pinned = cache.put(ChunkKey::new(1, 0, 0), chunk(0, 0))?;
        cache.put(ChunkKey::new(1, 0, 1), chunk(1, 1))?;
        cache.put(ChunkKey::new(1, 0, 2), chunk(2, 2))?;
        assert!(!overflow.contains(&ChunkKey::new(1, 0, 0)));
        assert!(overflow.contains(&ChunkKey::new(1, 0, 1)));

        // lowering the capacity below the pinned bytes is tolerated
        cache.set_capacity_bytes(chunk_size() / 2)?;
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.used_bytes(), chunk_size());
        assert!(cache.used_bytes() > cache.capacity_bytes());

        drop(pinned);
        assert_eq!(cache.len(), 0);
        assert!(cache.used_bytes() <= cache.capacity_bytes());
        assert_eq!(value_of(&cache, &ChunkKey::new(1, 0, 0))?, Some(Value::Int64(0)));
        Ok(())
    }

    #[test]
    fn test_resource_exhausted_when_everything_is_pinned() -> Result<()> {
        let (cache, _) = cache(2);
        let _a = cache.put(ChunkKey::new(1, 0, 0), chunk(0, 0))?;
        let _b = cache.put(ChunkKey::new(1, 0, 1), chunk(1, 1))?;
        let err = cache.put(ChunkKey::new(1, 0, 2), chunk(2, 2)).unwrap_err();
        assert!(matches!(err, LatticeError::ResourceExhausted { .. }));
        assert!(!cache.contains(&ChunkKey::new(1, 0, 2)));
        Ok(())
    }

    #[test]
    fn test_failed_put_keeps_previous_version() -> Result<()> {
        let (cache, _) = cache(2);
        let _a = cache.put(ChunkKey::new(1, 0, 0), chunk(0, 0))?;
        drop(cache.put(ChunkKey::new(1, 0, 1), chunk(1, 1))?);

        let bigger = Chunk::dense(vec![4], vec![Value::Utf8("x".repeat(64)); 4]);
        let err = cache.put(ChunkKey::new(1, 0, 1), bigger).unwrap_err();
        assert!(matches!(err, LatticeError::ResourceExhausted { .. }));
        assert_eq!(value_of(&cache, &ChunkKey::new(1, 0, 1))?, Some(Value::Int64(1)));
        assert_eq!(cache.used_bytes(), 2 * chunk_size());
        Ok(())
    }

    #[test]
    fn test_concurrent_readers_reload_spilled_chunks() -> Result<()> {
        let (cache, overflow) = cache(6);
        for seq in 0..12 {
            cache.put(ChunkKey::new(1, 0, seq), chunk(seq, seq as i64))?;
        }
        assert_eq!(overflow.len(), 6);

        let readers = (0..4u64)
            .map(|t| {
                let cache = cache.clone();
                std::thread::spawn(move || -> Result<()> {
                    for round in 0..50 {
                        let seq = (t * 3 + round) % 12;
                        let value = value_of(&cache, &ChunkKey::new(1, 0, seq))?;
                        assert_eq!(value, Some(Value::Int64(seq as i64)));
                    }
                    Ok(())
                })
            })
            .collect::<Vec<_>>();
        for reader in readers {
            reader.join().expect("reader panicked")?;
        }
        assert_eq!(cache.pinned_bytes(), 0);
        assert!(cache.used_bytes() <= cache.capacity_bytes());
        Ok(())
    }

    #[test]
    fn test_handle_update_and_repin() -> Result<()> {
        let (cache, _) = cache(4);
        let key = ChunkKey::new(1, 0, 0);
        let mut a = cache.put(key, chunk(0, 1))?;
        let b = cache.get(&key)?.unwrap();
        a.update(chunk(0, 5))?;
        assert_eq!(a.values()[0], Value::Int64(5));
        drop(a);
        assert_eq!(cache.pinned_bytes(), chunk_size());
        drop(b);
        assert_eq!(cache.pinned_bytes(), 0);
        assert_eq!(value_of(&cache, &key)?, Some(Value::Int64(5)));
        assert_eq!(value_of(&cache, &ChunkKey::new(1, 0, 9))?, None);
        Ok(())
    }

    #[test]
    fn test_invalidate_array() -> Result<()> {
        let (cache, overflow) = cache(1);
        let array = cache.register_array();
        let other = cache.register_array();
        cache.put(ChunkKey::new(array, 0, 0), chunk(0, 0))?;
        cache.put(ChunkKey::new(array, 0, 1), chunk(1, 1))?;
        let pinned = cache.put(ChunkKey::new(other, 0, 0), chunk(0, 7))?;
        cache.set_capacity_bytes(4 * chunk_size())?;
        assert!(cache.get(&ChunkKey::new(array, 1, 0))?.is_none());
        assert_eq!(overflow.len(), 2);

        cache.invalidate_array(array)?;
        assert!(!cache.contains(&ChunkKey::new(array, 0, 0)));
        assert!(!cache.contains(&ChunkKey::new(array, 0, 1)));
        assert!(overflow.is_empty());
        assert!(cache.contains(&ChunkKey::new(other, 0, 0)));
        drop(pinned);
        assert!(cache.contains(&ChunkKey::new(other, 0, 0)));
        Ok(())
    }

    #[test]
    fn test_disk_overflow_round_trip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = LatticeConfig::default()
            .with_cache_capacity_bytes(chunk_size())?
            .with_overflow_dir(&dir.path().to_string_lossy())?;
        let cache = ChunkCache::try_from_config(&config)?;
        for seq in 0..4 {
            cache.put(ChunkKey::new(1, 2, seq), chunk(seq, seq as i64 * 10))?;
        }
        for seq in 0..4 {
            assert_eq!(
                value_of(&cache, &ChunkKey::new(1, 2, seq))?,
                Some(Value::Int64(seq as i64 * 10))
            );
        }
        assert_eq!(cache.metrics().load_count(), 4);
        Ok(())
    }
}
