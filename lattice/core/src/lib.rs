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

#![doc = include_str!("../README.md")]

/// The current version of Lattice, derived from the Cargo package version.
pub const LATTICE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prints the current Lattice version to stdout.
pub fn print_version() {
    println!("Lattice version: {LATTICE_VERSION}")
}

/// Combine functions for partial aggregate results.
pub mod aggregate;
/// Run-length encoded sparsity bitmaps.
pub mod bitmap;
/// Attribute chunks, their merge semantics and wire payloads.
pub mod chunk;
/// Configuration options and settings for Lattice components.
pub mod config;
/// Consistent hashing implementation for chunk placement.
pub mod consistent_hash;
/// Cell and chunk coordinate mapping.
pub mod coordinates;
/// Error types and result definitions for Lattice operations.
pub mod error;
/// Event loop infrastructure for asynchronous message processing.
pub mod event_loop;
/// Partitioning functions mapping chunk positions to nodes.
pub mod partition;
/// Array schema definitions.
pub mod schema;
/// Shuffle messages and the transports that carry them.
pub mod transport;
