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

use std::fmt::Debug;
use std::hash::Hash;

pub mod lru;

/// Ordering of the evictable entries of a cache.
///
/// A policy only decides which entry goes next. Writing a victim out before
/// it is dropped is up to the cache owning the policy.
pub trait CachePolicy: Debug + Send + 'static {
    type K: Clone + Eq + Hash + Debug + Send + 'static;

    type V: Clone + Debug + Send + 'static;

    /// Add an entry as the last one to be evicted, returning the value it
    /// replaced. Never evicts by itself.
    fn insert(&mut self, k: Self::K, v: Self::V) -> Option<Self::V>;

    fn remove(&mut self, k: &Self::K) -> Option<Self::V>;

    /// The entry [`pop`](Self::pop) would remove.
    fn victim(&self) -> Option<(&Self::K, &Self::V)>;

    fn pop(&mut self) -> Option<(Self::K, Self::V)>;
}
