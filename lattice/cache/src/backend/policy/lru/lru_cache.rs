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

use std::fmt;
use std::fmt::Debug;
use std::hash::Hash;

use hashlink::LinkedHashMap;

use crate::backend::policy::lru::ResourceCounter;
use crate::backend::policy::CachePolicy;

/// Entries in insertion order, the oldest evicted first, bounded by a
/// [`ResourceCounter`].
///
/// Re-inserting a key moves it to the back, so releasing a chunk counts as
/// touching it.
pub struct LruCache<K, V>
where
    V: Clone + Debug + Send + 'static,
{
    map: LinkedHashMap<K, V>,
    resource_counter: Box<dyn ResourceCounter<V = V>>,
}

impl<K, V> LruCache<K, V>
where
    K: Clone + Eq + Hash + Debug + Send + 'static,
    V: Clone + Debug + Send + 'static,
{
    pub fn with_resource_counter<R>(resource_counter: R) -> Self
    where
        R: ResourceCounter<V = V>,
    {
        LruCache {
            map: LinkedHashMap::new(),
            resource_counter: Box::new(resource_counter),
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn contains_key(&self, k: &K) -> bool {
        self.map.contains_key(k)
    }

    /// Remove every entry whose key matches `predicate`.
    pub fn remove_where<F: Fn(&K) -> bool>(&mut self, predicate: F) -> Vec<(K, V)> {
        let keys = self
            .map
            .keys()
            .filter(|k| predicate(k))
            .cloned()
            .collect::<Vec<_>>();
        keys.into_iter()
            .filter_map(|k| self.remove(&k).map(|v| (k, v)))
            .collect()
    }

    pub fn reserve(&mut self, amount: usize) {
        self.resource_counter.reserve(amount);
    }

    pub fn unreserve(&mut self, amount: usize) {
        self.resource_counter.unreserve(amount);
    }

    pub fn used(&self) -> usize {
        self.resource_counter.used()
    }

    pub fn capacity(&self) -> usize {
        self.resource_counter.capacity()
    }

    pub fn set_capacity(&mut self, capacity: usize) {
        self.resource_counter.set_capacity(capacity);
    }

    pub fn exceed_capacity(&self) -> bool {
        self.resource_counter.exceed_capacity()
    }
}

impl<K, V> CachePolicy for LruCache<K, V>
where
    K: Clone + Eq + Hash + Debug + Send + 'static,
    V: Clone + Debug + Send + 'static,
{
    type K = K;
    type V = V;

    fn insert(&mut self, k: K, v: V) -> Option<V> {
        self.resource_counter.consume(&v);
        let old = self.map.remove(&k);
        if let Some(old) = &old {
            self.resource_counter.restore(old);
        }
        self.map.insert(k, v);
        old
    }

    fn remove(&mut self, k: &K) -> Option<V> {
        let v = self.map.remove(k)?;
        self.resource_counter.restore(&v);
        Some(v)
    }

    fn victim(&self) -> Option<(&K, &V)> {
        self.map.front()
    }

    fn pop(&mut self) -> Option<(K, V)> {
        let (k, v) = self.map.pop_front()?;
        self.resource_counter.restore(&v);
        Some((k, v))
    }
}

impl<K, V> Debug for LruCache<K, V>
where
    K: Debug,
    V: Clone + Debug + Send + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_map().entries(self.map.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::policy::lru::{ByteSizeCounter, Weighted};

    #[derive(Debug, Clone, PartialEq)]
    struct Blob(usize);

    impl Weighted for Blob {
        fn weight(&self) -> usize {
            self.0
        }
    }

    fn keys(cache: &LruCache<u64, Blob>) -> Vec<u64> {
        cache.map.keys().copied().collect()
    }

    #[test]
    fn test_oldest_entry_is_the_victim() {
        let mut cache = LruCache::with_resource_counter(ByteSizeCounter::new(50));
        cache.insert(1u64, Blob(10));
        cache.insert(2, Blob(20));
        cache.insert(3, Blob(15));
        assert_eq!(45, cache.used());
        assert_eq!(Some((&1, &Blob(10))), cache.victim());

        // re-inserting moves to the back
        assert_eq!(Some(Blob(10)), cache.insert(1, Blob(5)));
        assert_eq!(vec![2, 3, 1], keys(&cache));
        assert_eq!(40, cache.used());

        assert_eq!(Some((2, Blob(20))), cache.pop());
        assert_eq!(Some(Blob(15)), cache.remove(&3));
        assert_eq!(5, cache.used());
        assert!(cache.remove(&3).is_none());
    }

    #[test]
    fn test_insert_never_evicts() {
        let mut cache = LruCache::with_resource_counter(ByteSizeCounter::new(10));
        cache.insert(1u64, Blob(8));
        cache.insert(2, Blob(8));
        assert_eq!(2, cache.len());
        assert!(cache.exceed_capacity());

        cache.set_capacity(20);
        assert!(!cache.exceed_capacity());
        cache.reserve(5);
        assert!(cache.exceed_capacity());
        cache.unreserve(5);
        assert_eq!(16, cache.used());
    }

    #[test]
    fn test_remove_where() {
        let mut cache = LruCache::with_resource_counter(ByteSizeCounter::new(100));
        for k in 0..6u64 {
            cache.insert(k, Blob(1));
        }
        let removed = cache.remove_where(|k| k % 2 == 0);
        assert_eq!(vec![0, 2, 4], removed.iter().map(|(k, _)| *k).collect::<Vec<_>>());
        assert_eq!(vec![1, 3, 5], keys(&cache));
        assert_eq!(3, cache.used());
        assert!(!cache.is_empty());
    }
}
