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

pub mod lru_cache;

use std::fmt::Debug;
use std::marker::PhantomData;

/// Values that know their own footprint in bytes.
pub trait Weighted {
    fn weight(&self) -> usize;
}

/// Tracks the resource taken by the entries of a policy, plus amounts held
/// outside of it such as pinned chunks.
pub trait ResourceCounter: Debug + Send + 'static {
    type V: Clone + Debug + Send + 'static;

    fn consume(&mut self, v: &Self::V);

    fn restore(&mut self, v: &Self::V);

    fn reserve(&mut self, amount: usize);

    fn unreserve(&mut self, amount: usize);

    /// Reservations included.
    fn used(&self) -> usize;

    fn capacity(&self) -> usize;

    fn set_capacity(&mut self, capacity: usize);

    fn exceed_capacity(&self) -> bool {
        self.used() > self.capacity()
    }
}

/// Sums the [`Weighted::weight`] of the counted values.
#[derive(Debug, Clone, Copy)]
pub struct ByteSizeCounter<V> {
    capacity: usize,
    current: usize,
    reserved: usize,
    _value_marker: PhantomData<V>,
}

impl<V> ByteSizeCounter<V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            current: 0,
            reserved: 0,
            _value_marker: PhantomData,
        }
    }
}

impl<V> ResourceCounter for ByteSizeCounter<V>
where
    V: Weighted + Clone + Debug + Send + 'static,
{
    type V = V;

    fn consume(&mut self, v: &V) {
        self.current += v.weight();
    }

    fn restore(&mut self, v: &V) {
        self.current -= v.weight();
    }

    fn reserve(&mut self, amount: usize) {
        self.reserved += amount;
    }

    fn unreserve(&mut self, amount: usize) {
        self.reserved = self.reserved.saturating_sub(amount);
    }

    fn used(&self) -> usize {
        self.current + self.reserved
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity;
    }
}
