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

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A monotonic counter
#[derive(Debug, Clone, Default)]
pub struct U64Counter {
    counter: Arc<AtomicU64>,
}

impl U64Counter {
    pub fn inc(&self, count: u64) {
        self.counter.fetch_add(count, Ordering::Relaxed);
    }

    pub fn fetch(&self) -> u64 {
        self.counter.load(Ordering::Relaxed)
    }
}

/// Counters of the chunk cache.
#[derive(Debug, Default)]
pub struct CacheMetrics {
    pub(crate) hit_count: U64Counter,
    pub(crate) miss_count: U64Counter,
    pub(crate) put_count: U64Counter,
    pub(crate) eviction_count: U64Counter,
    pub(crate) spill_count: U64Counter,
    pub(crate) load_count: U64Counter,
}

impl CacheMetrics {
    /// Lookups served from memory.
    pub fn hit_count(&self) -> u64 {
        self.hit_count.fetch()
    }

    /// Lookups not served from memory, whether or not overflow had the chunk.
    pub fn miss_count(&self) -> u64 {
        self.miss_count.fetch()
    }

    pub fn put_count(&self) -> u64 {
        self.put_count.fetch()
    }

    pub fn eviction_count(&self) -> u64 {
        self.eviction_count.fetch()
    }

    /// Evictions of dirty chunks written to overflow storage.
    pub fn spill_count(&self) -> u64 {
        self.spill_count.fetch()
    }

    /// Chunks read back from overflow storage.
    pub fn load_count(&self) -> u64 {
        self.load_count.fetch()
    }
}
