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

//! In-process transport: a full mesh of bounded tokio channels.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, warn};
use tokio::sync::mpsc;

use crate::error::{LatticeError, Result};
use crate::schema::NodeId;
use crate::transport::{ShuffleMessage, Transport};

struct Mesh {
    inboxes: Vec<mpsc::Sender<ShuffleMessage>>,
    connected: Vec<AtomicBool>,
}

/// One node's end of an in-process mesh.
///
/// Every node has a single inbox, so messages of one sender reach a
/// receiver in sending order.
#[derive(Clone)]
pub struct LocalTransport {
    node: NodeId,
    mesh: Arc<Mesh>,
}

impl LocalTransport {
    /// Build a mesh of `num_nodes` nodes, returning each node's transport and
    /// inbox.
    pub fn mesh(
        num_nodes: usize,
        buffer_size: usize,
    ) -> Vec<(LocalTransport, mpsc::Receiver<ShuffleMessage>)> {
        let (inboxes, receivers): (Vec<_>, Vec<_>) = (0..num_nodes)
            .map(|_| mpsc::channel(buffer_size.max(1)))
            .unzip();
        let mesh = Arc::new(Mesh {
            inboxes,
            connected: (0..num_nodes).map(|_| AtomicBool::new(true)).collect(),
        });
        receivers
            .into_iter()
            .enumerate()
            .map(|(node, rx)| {
                (
                    LocalTransport {
                        node,
                        mesh: mesh.clone(),
                    },
                    rx,
                )
            })
            .collect()
    }

    pub fn is_connected(&self, node: NodeId) -> bool {
        self.mesh
            .connected
            .get(node)
            .is_some_and(|c| c.load(Ordering::SeqCst))
    }

    /// Cut `node` off the mesh and notify every other connected node.
    pub async fn disconnect(&self, node: NodeId) {
        let Some(flag) = self.mesh.connected.get(node) else {
            return;
        };
        if !flag.swap(false, Ordering::SeqCst) {
            return;
        }
        warn!("Node {node} disconnected from the local mesh");
        for (peer, inbox) in self.mesh.inboxes.iter().enumerate() {
            if peer != node && self.is_connected(peer) {
                // a closed inbox means the peer is shutting down
                let _ = inbox.send(ShuffleMessage::Disconnected { peer: node }).await;
            }
        }
    }
}

#[async_trait]
impl Transport for LocalTransport {
    fn local_node(&self) -> NodeId {
        self.node
    }

    fn num_nodes(&self) -> usize {
        self.mesh.inboxes.len()
    }

    async fn send(&self, to: NodeId, message: ShuffleMessage) -> Result<()> {
        if !self.is_connected(self.node) {
            return Err(LatticeError::Transport(
                self.node,
                "local node is disconnected".to_string(),
            ));
        }
        if !self.is_connected(to) {
            return Err(LatticeError::Transport(to, "peer is disconnected".to_string()));
        }
        let inbox = self.mesh.inboxes.get(to).ok_or_else(|| {
            LatticeError::Transport(to, format!("no such node in a mesh of {}", self.num_nodes()))
        })?;
        debug!("Node {} sending {:?} message to {to}", self.node, message.operation());
        inbox
            .send(message)
            .await
            .map_err(|_| LatticeError::Transport(to, "inbox closed".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn eos(sender: NodeId, attribute: usize) -> ShuffleMessage {
        ShuffleMessage::EndOfStream {
            operation: Uuid::nil(),
            sender,
            attribute,
        }
    }

    #[tokio::test]
    async fn test_ordered_delivery() -> Result<()> {
        let mut mesh = LocalTransport::mesh(2, 16);
        let (_, mut rx1) = mesh.remove(1);
        let (t0, _rx0) = mesh.remove(0);
        for a in 0..5 {
            t0.send(1, eos(0, a)).await?;
        }
        for a in 0..5 {
            match rx1.recv().await {
                Some(ShuffleMessage::EndOfStream { attribute, .. }) => assert_eq!(attribute, a),
                other => panic!("unexpected {other:?}"),
            }
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_disconnect_notifies_peers() -> Result<()> {
        let mut mesh = LocalTransport::mesh(3, 16);
        let (t2, _rx2) = mesh.remove(2);
        let (_t1, mut rx1) = mesh.remove(1);
        let (t0, mut rx0) = mesh.remove(0);

        t0.disconnect(2).await;
        t0.disconnect(2).await;
        for rx in [&mut rx0, &mut rx1] {
            assert!(matches!(
                rx.recv().await,
                Some(ShuffleMessage::Disconnected { peer: 2 })
            ));
            assert!(rx.try_recv().is_err());
        }
        let err = t0.send(2, eos(0, 0)).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(t2.send(0, eos(2, 0)).await.is_err());
        Ok(())
    }
}
