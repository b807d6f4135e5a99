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

//! Per-node shuffle service: routes transport messages to the receivers of
//! the redistribution operations active on this node.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use lattice_cache::{ChunkCache, MemArray};
use lattice_core::config::LatticeConfig;
use lattice_core::error::{LatticeError, Result};
use lattice_core::event_loop::{EventAction, EventLoop};
use lattice_core::partition::PartitionFunction;
use lattice_core::schema::{ArrayDesc, AttributeId, NodeId};
use lattice_core::transport::{OperationId, ShuffleMessage, Transport};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::receiver::{ReceiverOptions, RedistributionReceiver};
use crate::sender::{BitmapMode, RedistributionSender, SendSummary};

/// Finished operations remembered after their end-of-stream signals can no
/// longer tell when to forget them.
const MAX_FINISHED_OPERATIONS: usize = 1024;

struct Registry {
    node: NodeId,
    receivers: HashMap<OperationId, Arc<RedistributionReceiver>>,
    /// Messages of operations not registered yet, in arrival order.
    early: HashMap<OperationId, Vec<ShuffleMessage>>,
    early_messages: usize,
    max_early_messages: usize,
    /// End-of-stream signals still on their way to a retired operation.
    /// `None` when the operation retired before it was registered.
    finished: HashMap<OperationId, Option<HashSet<(NodeId, AttributeId)>>>,
    /// Retirement order of `finished`, oldest first. May hold pruned ids.
    finished_order: VecDeque<OperationId>,
    disconnected: HashSet<NodeId>,
}

impl Registry {
    fn new(node: NodeId, max_early_messages: usize) -> Self {
        Self {
            node,
            receivers: HashMap::new(),
            early: HashMap::new(),
            early_messages: 0,
            max_early_messages,
            finished: HashMap::new(),
            finished_order: VecDeque::new(),
            disconnected: HashSet::new(),
        }
    }

    /// Hold `message` until its operation is registered.
    ///
    /// Once the budget is spent the operation is retired instead, together
    /// with everything held for it.
    fn hold(&mut self, operation: OperationId, message: ShuffleMessage) {
        if self.early_messages >= self.max_early_messages {
            let dropped = self.take_early(operation).len() + 1;
            error!(
                "Node {} holds {} messages of unregistered operations, dropping {dropped} of {operation}",
                self.node, self.early_messages
            );
            self.finish(operation, None);
            return;
        }
        self.early_messages += 1;
        self.early.entry(operation).or_default().push(message);
    }

    fn take_early(&mut self, operation: OperationId) -> Vec<ShuffleMessage> {
        let messages = self.early.remove(&operation).unwrap_or_default();
        self.early_messages -= messages.len();
        messages
    }

    fn finish(
        &mut self,
        operation: OperationId,
        pending: Option<HashSet<(NodeId, AttributeId)>>,
    ) {
        let pending = pending.map(|mut pending| {
            pending.retain(|(sender, _)| !self.disconnected.contains(sender));
            pending
        });
        if pending.as_ref().is_some_and(HashSet::is_empty) {
            self.finished.remove(&operation);
            return;
        }
        if self.finished.insert(operation, pending).is_none() {
            self.finished_order.push_back(operation);
        }
        while self.finished_order.len() > MAX_FINISHED_OPERATIONS {
            if let Some(oldest) = self.finished_order.pop_front() {
                self.finished.remove(&oldest);
            }
        }
    }

    /// Account a late message of a retired operation.
    fn on_finished_message(&mut self, operation: OperationId, message: &ShuffleMessage) {
        let ShuffleMessage::EndOfStream {
            sender, attribute, ..
        } = message
        else {
            return;
        };
        if let Some(Some(pending)) = self.finished.get_mut(&operation) {
            pending.remove(&(*sender, *attribute));
            if pending.is_empty() {
                debug!(
                    "Node {} received the last end-of-stream of retired operation {operation}",
                    self.node
                );
                self.finished.remove(&operation);
            }
        }
    }

    fn on_disconnected(&mut self, peer: NodeId) {
        self.disconnected.insert(peer);
        self.finished.retain(|_, pending| match pending {
            Some(pending) => {
                pending.retain(|(sender, _)| *sender != peer);
                !pending.is_empty()
            }
            None => true,
        });
    }
}

struct ShuffleDispatcher {
    node: NodeId,
    registry: Arc<Mutex<Registry>>,
}

#[async_trait]
impl EventAction<ShuffleMessage> for ShuffleDispatcher {
    fn on_start(&self) {
        info!("Starting shuffle dispatcher of node {}", self.node);
    }

    fn on_stop(&self) {
        info!("Stopping shuffle dispatcher of node {}", self.node);
    }

    async fn on_receive(
        &self,
        event: ShuffleMessage,
        _tx_event: &mpsc::Sender<ShuffleMessage>,
    ) -> Result<()> {
        let Some(operation) = event.operation() else {
            if let ShuffleMessage::Disconnected { peer } = event {
                let receivers = {
                    let mut registry = self.registry.lock();
                    registry.on_disconnected(peer);
                    registry.receivers.values().cloned().collect::<Vec<_>>()
                };
                for receiver in receivers {
                    receiver.on_sender_disconnected(peer);
                }
            }
            return Ok(());
        };
        let receiver = {
            let mut registry = self.registry.lock();
            if let Some(receiver) = registry.receivers.get(&operation).cloned() {
                receiver
            } else if registry.finished.contains_key(&operation) {
                warn!(
                    "Node {} dropping message for finished operation {operation}",
                    self.node
                );
                registry.on_finished_message(operation, &event);
                return Ok(());
            } else {
                registry.hold(operation, event);
                return Ok(());
            }
        };
        receiver.on_message(event)
    }

    fn on_error(&self, error: LatticeError) {
        error!("Node {} failed to dispatch shuffle message: {error}", self.node);
    }
}

/// Shuffle endpoint of one node.
///
/// Owns the receivers of the operations this node takes part in. Messages
/// arriving before their operation is registered are held back and replayed
/// on registration, in arrival order, up to
/// `lattice.shuffle.max_early_messages` across all operations. A retired
/// operation is remembered until every end-of-stream it still awaited has
/// arrived, so late messages are dropped instead of held.
pub struct ShuffleService {
    node: NodeId,
    transport: Arc<dyn Transport>,
    cache: Arc<ChunkCache>,
    config: LatticeConfig,
    registry: Arc<Mutex<Registry>>,
    event_loop: EventLoop<ShuffleMessage>,
    forwarder: Option<JoinHandle<()>>,
}

impl ShuffleService {
    pub fn new(
        transport: Arc<dyn Transport>,
        cache: Arc<ChunkCache>,
        config: LatticeConfig,
    ) -> Self {
        let node = transport.local_node();
        let registry = Arc::new(Mutex::new(Registry::new(
            node,
            config.max_early_messages(),
        )));
        let dispatcher = Arc::new(ShuffleDispatcher {
            node,
            registry: registry.clone(),
        });
        let event_loop = EventLoop::new(
            format!("shuffle_dispatcher_{node}"),
            config.event_buffer_size(),
            dispatcher,
        );
        Self {
            node,
            transport,
            cache,
            config,
            registry,
            event_loop,
            forwarder: None,
        }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn cache(&self) -> &Arc<ChunkCache> {
        &self.cache
    }

    pub fn config(&self) -> &LatticeConfig {
        &self.config
    }

    /// Start dispatching the messages of `inbox`.
    pub fn start(&mut self, mut inbox: mpsc::Receiver<ShuffleMessage>) -> Result<()> {
        let events = self.event_loop.start()?;
        let node = self.node;
        self.forwarder = Some(tokio::spawn(async move {
            while let Some(message) = inbox.recv().await {
                if let Err(e) = events.post_event(message).await {
                    warn!("Node {node} stops forwarding shuffle messages: {e}");
                    break;
                }
            }
            debug!("Shuffle inbox of node {node} closed");
        }));
        Ok(())
    }

    /// An empty array in this node's chunk cache.
    pub fn new_output(&self, desc: ArrayDesc) -> Arc<MemArray> {
        Arc::new(MemArray::new(desc, self.cache.clone()))
    }

    /// A receiver expecting every node as a sender, configured from this
    /// service's settings.
    pub fn new_receiver(
        &self,
        operation: OperationId,
        output: Arc<MemArray>,
    ) -> Result<RedistributionReceiver> {
        RedistributionReceiver::try_new(
            operation,
            output,
            self.transport.num_nodes(),
            ReceiverOptions::from_config(&self.config),
        )
    }

    /// Start accepting messages for the receiver's operation.
    pub fn register(&self, receiver: RedistributionReceiver) -> Result<Arc<RedistributionReceiver>> {
        let receiver = Arc::new(receiver);
        let operation = receiver.operation();
        let mut registry = self.registry.lock();
        if registry.receivers.contains_key(&operation)
            || registry.finished.contains_key(&operation)
        {
            return Err(LatticeError::General(format!(
                "operation {operation} is already registered or retired on node {}",
                self.node
            )));
        }
        registry.receivers.insert(operation, receiver.clone());
        // replay under the lock so later messages cannot overtake
        let early = registry.take_early(operation);
        if !early.is_empty() {
            debug!(
                "Node {} replaying {} early messages of {operation}",
                self.node,
                early.len()
            );
        }
        for message in early {
            if let Err(e) = receiver.on_message(message) {
                warn!("Operation {operation} failed while replaying: {e}");
                break;
            }
        }
        for peer in registry.disconnected.iter() {
            receiver.on_sender_disconnected(*peer);
        }
        Ok(receiver)
    }

    pub fn receiver(&self, operation: OperationId) -> Option<Arc<RedistributionReceiver>> {
        self.registry.lock().receivers.get(&operation).cloned()
    }

    /// Send `input` to the nodes owning its chunks under `partitioner`.
    pub async fn redistribute(
        &self,
        operation: OperationId,
        input: &MemArray,
        partitioner: Arc<dyn PartitionFunction>,
    ) -> Result<SendSummary> {
        let bitmap_mode = if self.config.cache_bitmaps() || self.config.defer_merge() {
            BitmapMode::Separate
        } else {
            BitmapMode::Embedded
        };
        RedistributionSender::new(self.transport.clone(), partitioner)
            .with_bitmap_mode(bitmap_mode)
            .send_array(operation, input)
            .await
    }

    /// Flush the receiver of `operation` and retire it.
    pub async fn complete(&self, operation: OperationId) -> Result<Arc<MemArray>> {
        let receiver = self.receiver(operation).ok_or_else(|| {
            LatticeError::General(format!(
                "operation {operation} is not registered on node {}",
                self.node
            ))
        })?;
        let result = receiver.flush().await;
        self.retire(operation);
        result
    }

    /// Abort `operation`, failing any pending flush with a cancellation.
    pub fn abort(&self, operation: OperationId) {
        let receiver = self.retire(operation);
        if let Some(receiver) = receiver {
            receiver.abort();
        }
    }

    /// Stop dispatching and abort every active operation.
    pub fn stop(&mut self) {
        self.event_loop.stop();
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
        let receivers = self
            .registry
            .lock()
            .receivers
            .drain()
            .map(|(_, r)| r)
            .collect::<Vec<_>>();
        for receiver in receivers {
            receiver.abort();
        }
    }

    fn retire(&self, operation: OperationId) -> Option<Arc<RedistributionReceiver>> {
        let mut registry = self.registry.lock();
        registry.take_early(operation);
        let receiver = registry.receivers.remove(&operation);
        match &receiver {
            Some(receiver) => {
                let pending = receiver.pending_end_of_stream().into_iter().collect();
                registry.finish(operation, Some(pending));
            }
            None if !registry.finished.contains_key(&operation) => {
                registry.finish(operation, None)
            }
            None => {}
        }
        receiver
    }
}

impl Drop for ShuffleService {
    fn drop(&mut self) {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
    }
}
