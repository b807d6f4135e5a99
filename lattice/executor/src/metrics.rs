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

use lattice_cache::metrics::U64Counter;

/// Counters of one redistribution receiver.
#[derive(Debug, Default)]
pub struct ReceiverMetrics {
    pub(crate) chunks_received: U64Counter,
    pub(crate) bitmaps_received: U64Counter,
    pub(crate) chunks_merged: U64Counter,
    pub(crate) chunks_buffered: U64Counter,
    pub(crate) bytes_buffered: U64Counter,
    pub(crate) chunks_written: U64Counter,
}

impl ReceiverMetrics {
    /// Attribute chunks accepted, bitmaps excluded.
    pub fn chunks_received(&self) -> u64 {
        self.chunks_received.fetch()
    }

    pub fn bitmaps_received(&self) -> u64 {
        self.bitmaps_received.fetch()
    }

    /// Chunks merged into the output as they arrived.
    pub fn chunks_merged(&self) -> u64 {
        self.chunks_merged.fetch()
    }

    pub fn chunks_buffered(&self) -> u64 {
        self.chunks_buffered.fetch()
    }

    /// Total payload bytes that went through the defer-merge buffers.
    pub fn bytes_buffered(&self) -> u64 {
        self.bytes_buffered.fetch()
    }

    /// Output chunks written by the drain, one per (attribute, position).
    pub fn chunks_written(&self) -> u64 {
        self.chunks_written.fetch()
    }
}
