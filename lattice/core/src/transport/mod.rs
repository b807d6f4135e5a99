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

//! Point-to-point delivery of shuffle messages between nodes.

use async_trait::async_trait;
use uuid::Uuid;

use crate::chunk::ChunkPayload;
use crate::error::Result;
use crate::schema::{AttributeId, Coordinates, NodeId};

pub mod local;

pub use local::LocalTransport;

/// Identifies one redistribution operation across all nodes.
pub type OperationId = Uuid;

#[derive(Debug, Clone)]
pub enum ShuffleMessage {
    /// An attribute chunk, or the sparsity bitmap of a position when
    /// `is_bitmap` is set.
    Chunk {
        operation: OperationId,
        sender: NodeId,
        attribute: AttributeId,
        position: Coordinates,
        payload: ChunkPayload,
        is_bitmap: bool,
    },
    /// `sender` has no more chunks of `attribute` for this operation.
    EndOfStream {
        operation: OperationId,
        sender: NodeId,
        attribute: AttributeId,
    },
    /// The connection to `peer` is gone.
    Disconnected { peer: NodeId },
}

impl ShuffleMessage {
    pub fn operation(&self) -> Option<OperationId> {
        match self {
            ShuffleMessage::Chunk { operation, .. }
            | ShuffleMessage::EndOfStream { operation, .. } => Some(*operation),
            ShuffleMessage::Disconnected { .. } => None,
        }
    }
}

/// Reliable delivery, ordered per (sender, receiver) pair.
#[async_trait]
pub trait Transport: Send + Sync {
    fn local_node(&self) -> NodeId;

    fn num_nodes(&self) -> usize;

    /// Deliver `message` to node `to`. Fails with a transport error when
    /// either end is disconnected.
    async fn send(&self, to: NodeId, message: ShuffleMessage) -> Result<()>;
}
