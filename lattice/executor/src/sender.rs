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

//! Sending side of a chunk redistribution.

use std::collections::BTreeSet;
use std::sync::Arc;

use lattice_cache::MemArray;
use lattice_core::bitmap::SharedBitmap;
use lattice_core::chunk::ChunkPayload;
use lattice_core::error::{LatticeError, Result};
use lattice_core::partition::PartitionFunction;
use lattice_core::schema::NodeId;
use lattice_core::transport::{OperationId, ShuffleMessage, Transport};
use log::{debug, info};

/// How sparsity bitmaps travel to the receivers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BitmapMode {
    /// Every attribute chunk carries its own copy.
    #[default]
    Embedded,
    /// Bitmap chunks sent ahead of the attribute chunks of a position, one
    /// more whenever an attribute's bitmap differs from the previous one.
    /// Pairs with receivers that cache bitmaps or defer merging.
    Separate,
}

/// What one [`RedistributionSender::send_array`] call shipped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendSummary {
    pub chunks_sent: usize,
    pub bitmaps_sent: usize,
    /// Attribute chunks per destination node. Replicated chunks count once
    /// per copy, as do `chunks_sent` and `bitmaps_sent`.
    pub chunks_per_node: Vec<usize>,
}

pub struct RedistributionSender {
    transport: Arc<dyn Transport>,
    partitioner: Arc<dyn PartitionFunction>,
    bitmap_mode: BitmapMode,
}

impl RedistributionSender {
    pub fn new(transport: Arc<dyn Transport>, partitioner: Arc<dyn PartitionFunction>) -> Self {
        Self {
            transport,
            partitioner,
            bitmap_mode: BitmapMode::default(),
        }
    }

    pub fn with_bitmap_mode(mut self, bitmap_mode: BitmapMode) -> Self {
        self.bitmap_mode = bitmap_mode;
        self
    }

    /// Ship every chunk of `input` to the node owning its position, then end
    /// the stream of every attribute at every node.
    ///
    /// Positions go out in ascending sequence order. At each position a
    /// separately sent bitmap precedes the attribute chunks it covers.
    pub async fn send_array(&self, operation: OperationId, input: &MemArray) -> Result<SendSummary> {
        let from = self.transport.local_node();
        let num_nodes = self.transport.num_nodes();
        if self.partitioner.num_nodes() != num_nodes {
            return Err(LatticeError::Configuration(format!(
                "partitioning over {} nodes on a transport of {num_nodes}",
                self.partitioner.num_nodes()
            )));
        }
        let num_attributes = input.desc().num_attributes();
        let separate = self.bitmap_mode == BitmapMode::Separate && input.desc().emptyable;
        let mut summary = SendSummary {
            chunks_per_node: vec![0; num_nodes],
            ..Default::default()
        };

        let sequences = (0..num_attributes)
            .flat_map(|attribute| input.positions(attribute))
            .map(|position| input.mapper().chunk_to_sequence(&position))
            .collect::<BTreeSet<_>>();
        for sequence in sequences {
            let position = input.mapper().sequence_to_chunk(sequence);
            let targets = self.partitioner.destinations(&position)?;
            let mut messages = vec![];
            let mut chunks = 0;
            let mut last_bitmap: Option<SharedBitmap> = None;
            for attribute in 0..num_attributes {
                let Some(chunk) = input.get_chunk(attribute, &position)? else {
                    continue;
                };
                // a bitmap applies to the following attribute chunks of this
                // position until the next one replaces it
                if separate && last_bitmap.as_ref() != Some(chunk.bitmap()) {
                    last_bitmap = Some(chunk.bitmap().clone());
                    messages.push(ShuffleMessage::Chunk {
                        operation,
                        sender: from,
                        attribute,
                        position: position.clone(),
                        payload: ChunkPayload::bitmap_only(chunk.bitmap().clone()),
                        is_bitmap: true,
                    });
                    summary.bitmaps_sent += targets.len();
                }
                messages.push(ShuffleMessage::Chunk {
                    operation,
                    sender: from,
                    attribute,
                    position: position.clone(),
                    payload: ChunkPayload::from_chunk(&chunk, !separate),
                    is_bitmap: false,
                });
                chunks += 1;
            }
            debug!(
                "Node {from} sending {} messages for {position:?} to nodes {targets:?}",
                messages.len()
            );
            for &to in &targets {
                summary.chunks_sent += chunks;
                summary.chunks_per_node[to] += chunks;
                for message in &messages {
                    self.transport.send(to, message.clone()).await?;
                }
            }
        }

        self.end_streams(operation, num_attributes).await?;
        info!(
            "Node {from} sent {} chunks and {} bitmaps of '{}' for {operation}",
            summary.chunks_sent,
            summary.bitmaps_sent,
            input.desc().name
        );
        Ok(summary)
    }

    /// Send end-of-stream for every attribute to every node.
    pub async fn end_streams(&self, operation: OperationId, num_attributes: usize) -> Result<()> {
        let from: NodeId = self.transport.local_node();
        for to in 0..self.transport.num_nodes() {
            for attribute in 0..num_attributes {
                self.transport
                    .send(
                        to,
                        ShuffleMessage::EndOfStream {
                            operation,
                            sender: from,
                            attribute,
                        },
                    )
                    .await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_cache::overflow::MemoryOverflowStore;
    use lattice_cache::ChunkCache;
    use lattice_core::chunk::{chunk_from_cells, Value};
    use lattice_core::partition::{PartitioningScheme, SchemePartitioner};
    use lattice_core::schema::{ArrayDesc, DimensionDesc};
    use lattice_core::transport::LocalTransport;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    fn input() -> Result<MemArray> {
        let desc = ArrayDesc::try_new(
            "in",
            vec![DimensionDesc::try_new("i", 0, 11, 4, 0)?],
            &["a", "b"],
            true,
        )?;
        let cache = ChunkCache::new(1 << 20, Arc::new(MemoryOverflowStore::default()));
        let array = MemArray::new(desc, cache);
        for (position, attributes) in [(8, 2), (0, 2), (4, 1)] {
            for attribute in 0..attributes {
                let chunk = chunk_from_cells(
                    vec![position],
                    4,
                    [(1, Value::Int64(position)), (3, Value::Int64(attribute as i64))],
                )?;
                array.write_chunk(attribute, chunk)?;
            }
        }
        Ok(array)
    }

    fn drain(rx: &mut mpsc::Receiver<ShuffleMessage>) -> Vec<ShuffleMessage> {
        let mut out = vec![];
        while let Ok(message) = rx.try_recv() {
            out.push(message);
        }
        out
    }

    fn describe(message: &ShuffleMessage) -> String {
        match message {
            ShuffleMessage::Chunk {
                attribute,
                position,
                payload,
                is_bitmap,
                ..
            } => format!(
                "{}{attribute}@{}{}",
                if *is_bitmap { "bitmap" } else { "chunk" },
                position[0],
                if payload.bitmap().is_some() { "+" } else { "" }
            ),
            ShuffleMessage::EndOfStream { attribute, .. } => format!("eos{attribute}"),
            ShuffleMessage::Disconnected { peer } => format!("gone{peer}"),
        }
    }

    #[tokio::test]
    async fn test_separate_bitmaps_precede_chunks() -> Result<()> {
        let mut mesh = LocalTransport::mesh(2, 64);
        let (t1, mut rx1) = mesh.remove(1);
        let (t0, mut rx0) = mesh.remove(0);
        let input = input()?;
        let partitioner =
            SchemePartitioner::try_new(input.desc().clone(), 2, PartitioningScheme::ByRow)?;
        let sender = RedistributionSender::new(Arc::new(t0), Arc::new(partitioner))
            .with_bitmap_mode(BitmapMode::Separate);

        let summary = sender.send_array(Uuid::new_v4(), &input).await?;
        assert_eq!(summary.chunks_sent, 5);
        assert_eq!(summary.bitmaps_sent, 3);
        // 3 row chunks over 2 nodes: positions 0 and 4 go to node 0
        assert_eq!(summary.chunks_per_node, vec![3, 2]);

        let to0 = drain(&mut rx0).iter().map(describe).collect::<Vec<_>>();
        assert_eq!(
            to0,
            vec!["bitmap0@0+", "chunk0@0", "chunk1@0", "bitmap0@4+", "chunk0@4", "eos0", "eos1"]
        );
        let to1 = drain(&mut rx1).iter().map(describe).collect::<Vec<_>>();
        assert_eq!(to1, vec!["bitmap0@8+", "chunk0@8", "chunk1@8", "eos0", "eos1"]);
        drop(t1);
        Ok(())
    }

    #[tokio::test]
    async fn test_embedded_bitmaps() -> Result<()> {
        let mut mesh = LocalTransport::mesh(1, 64);
        let (t0, mut rx0) = mesh.remove(0);
        let input = input()?;
        let partitioner = SchemePartitioner::try_new(
            input.desc().clone(),
            1,
            PartitioningScheme::HashPartitioned,
        )?;
        let sender = RedistributionSender::new(Arc::new(t0), Arc::new(partitioner));
        let summary = sender.send_array(Uuid::new_v4(), &input).await?;
        assert_eq!(summary.bitmaps_sent, 0);
        let messages = drain(&mut rx0).iter().map(describe).collect::<Vec<_>>();
        assert_eq!(
            messages,
            vec!["chunk0@0+", "chunk1@0+", "chunk0@4+", "chunk0@8+", "chunk1@8+", "eos0", "eos1"]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_new_bitmap_when_attributes_differ() -> Result<()> {
        let mut mesh = LocalTransport::mesh(1, 64);
        let (t0, mut rx0) = mesh.remove(0);
        let input = input()?;
        // attribute 1 at position 4 now covers other cells than attribute 0
        input.write_chunk(
            1,
            chunk_from_cells(vec![4], 4, [(0, Value::Int64(7)), (2, Value::Int64(8))])?,
        )?;
        let partitioner =
            SchemePartitioner::try_new(input.desc().clone(), 1, PartitioningScheme::ByRow)?;
        let sender = RedistributionSender::new(Arc::new(t0), Arc::new(partitioner))
            .with_bitmap_mode(BitmapMode::Separate);

        let summary = sender.send_array(Uuid::new_v4(), &input).await?;
        assert_eq!(summary.bitmaps_sent, 4);
        let messages = drain(&mut rx0).iter().map(describe).collect::<Vec<_>>();
        assert_eq!(
            messages,
            vec![
                "bitmap0@0+",
                "chunk0@0",
                "chunk1@0",
                "bitmap0@4+",
                "chunk0@4",
                "bitmap1@4+",
                "chunk1@4",
                "bitmap0@8+",
                "chunk0@8",
                "chunk1@8",
                "eos0",
                "eos1"
            ]
        );
        Ok(())
    }
}
