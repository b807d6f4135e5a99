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

//! Receiving side of a chunk redistribution.
//!
//! A [`RedistributionReceiver`] accepts the chunks one redistribution
//! operation delivers to this node, from every sender and for every
//! attribute, in any interleaving. Depending on [`ReceiverOptions`] it either
//! merges each chunk into the output array as it arrives or buffers the
//! chunks per sender and drains them on [`RedistributionReceiver::flush`] in
//! chunk sequence order, then attribute, then sender. The drain writes every
//! (attribute, position) exactly once, so attribute values at a position are
//! never composed from different senders' deliveries.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::time::Duration;

use lattice_cache::MemArray;
use lattice_core::aggregate::Aggregate;
use lattice_core::bitmap::SharedBitmap;
use lattice_core::chunk::{Chunk, ChunkPayload};
use lattice_core::config::LatticeConfig;
use lattice_core::error::{LatticeError, ProtocolViolation, Result};
use lattice_core::schema::{AttributeId, Coordinates, NodeId};
use lattice_core::transport::{OperationId, ShuffleMessage};
use log::{debug, error, info, trace, warn};
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::bitmap_cache::BitmapCache;
use crate::metrics::ReceiverMetrics;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReceiverOptions {
    /// Buffer whole chunks per sender and merge them on flush.
    pub defer_merge: bool,
    /// Senders ship bitmaps separately; reuse the last one per sender.
    pub cache_bitmaps: bool,
    /// Budget of the defer-merge buffers, unbounded when `None`.
    pub max_buffered_bytes: Option<usize>,
    /// How long a flush waits for end-of-stream, forever when `None`.
    pub flush_timeout: Option<Duration>,
}

impl ReceiverOptions {
    pub fn from_config(config: &LatticeConfig) -> Self {
        Self {
            defer_merge: config.defer_merge(),
            cache_bitmaps: config.cache_bitmaps(),
            max_buffered_bytes: config.max_buffered_bytes(),
            flush_timeout: config.flush_timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Accumulating,
    Draining,
    Done,
    Failed,
    Aborted,
}

/// Per (sender, attribute) bookkeeping.
#[derive(Debug, Default)]
struct SenderState {
    /// Sequence numbers of buffered chunks not yet drained, in arrival order.
    queue: VecDeque<u64>,
    seen: HashSet<u64>,
    /// Chunks the local consumer asked for and has not received yet.
    requested: u64,
    last_fetch_id: u64,
    exhausted: bool,
}

#[derive(Debug, Default)]
struct AttributeState {
    buffered_bytes: usize,
    buffered_count: usize,
    exhausted_senders: usize,
}

/// Everything one sender delivered while merging is deferred.
#[derive(Debug, Default)]
struct SenderBuffer {
    /// Keyed by the first attribute a bitmap applies to.
    bitmaps: BTreeMap<(u64, AttributeId), SharedBitmap>,
    payloads: BTreeMap<(u64, AttributeId), ChunkPayload>,
}

impl SenderBuffer {
    /// The bitmap sent last before `attribute` at `sequence`.
    fn bitmap_for(&self, sequence: u64, attribute: AttributeId) -> Option<SharedBitmap> {
        self.bitmaps
            .range((sequence, 0)..=(sequence, attribute))
            .next_back()
            .map(|(_, bitmap)| bitmap.clone())
    }
}

#[derive(Debug)]
enum Mode {
    MergeOnArrival { bitmaps: Option<BitmapCache> },
    DeferAndDrain { buffers: Vec<SenderBuffer> },
}

#[derive(Debug)]
struct ReceiverState {
    phase: Phase,
    mode: Mode,
    /// Indexed by sender, then attribute.
    senders: Vec<Vec<SenderState>>,
    attributes: Vec<AttributeState>,
    failure: Option<LatticeError>,
    next_fetch_id: u64,
}

impl ReceiverState {
    /// Fails once the operation has failed or was aborted.
    fn check_open(&self) -> Result<()> {
        match self.phase {
            Phase::Failed => Err(self
                .failure
                .as_ref()
                .map(replicate)
                .unwrap_or_else(|| LatticeError::Internal("failed without error".into()))),
            Phase::Aborted => Err(LatticeError::Cancelled),
            _ => Ok(()),
        }
    }

    fn is_complete(&self, num_senders: usize) -> bool {
        self.attributes
            .iter()
            .all(|a| a.exhausted_senders == num_senders)
    }

    /// Senders still owing an end-of-stream.
    fn pending_senders(&self) -> Vec<NodeId> {
        self.senders
            .iter()
            .enumerate()
            .filter(|(_, attrs)| attrs.iter().any(|a| !a.exhausted))
            .map(|(sender, _)| sender)
            .collect()
    }

    fn release(&mut self) {
        match &mut self.mode {
            Mode::MergeOnArrival { bitmaps } => {
                if let Some(bitmaps) = bitmaps {
                    bitmaps.clear();
                }
            }
            Mode::DeferAndDrain { buffers } => {
                buffers.iter_mut().for_each(|b| *b = SenderBuffer::default());
            }
        }
        for attribute in self.attributes.iter_mut() {
            attribute.buffered_bytes = 0;
            attribute.buffered_count = 0;
        }
        for sender in self.senders.iter_mut().flatten() {
            sender.queue.clear();
        }
    }
}

/// Copy of a stored failure, for every caller that observes it.
fn replicate(e: &LatticeError) -> LatticeError {
    match e {
        LatticeError::Protocol(v) => LatticeError::Protocol(v.clone()),
        LatticeError::Transport(node, message) => LatticeError::Transport(*node, message.clone()),
        LatticeError::ResourceExhausted {
            requested,
            capacity,
            pinned,
        } => LatticeError::ResourceExhausted {
            requested: *requested,
            capacity: *capacity,
            pinned: *pinned,
        },
        LatticeError::Cancelled => LatticeError::Cancelled,
        other => LatticeError::General(other.to_string()),
    }
}

/// Receiver of one redistribution operation on one node.
///
/// All state changes of an operation happen under one lock, so arrivals are
/// serialized no matter how many tasks deliver them.
pub struct RedistributionReceiver {
    operation: OperationId,
    output: Arc<MemArray>,
    num_senders: usize,
    options: ReceiverOptions,
    aggregates: Vec<Option<Arc<dyn Aggregate>>>,
    state: Mutex<ReceiverState>,
    changes: watch::Sender<u64>,
    metrics: Arc<ReceiverMetrics>,
}

impl Debug for RedistributionReceiver {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedistributionReceiver")
            .field("operation", &self.operation)
            .field("output", &self.output.desc().name)
            .field("num_senders", &self.num_senders)
            .field("options", &self.options)
            .field("phase", &self.phase())
            .finish()
    }
}

impl RedistributionReceiver {
    pub fn try_new(
        operation: OperationId,
        output: Arc<MemArray>,
        num_senders: usize,
        options: ReceiverOptions,
    ) -> Result<Self> {
        if options.defer_merge && options.cache_bitmaps {
            return Err(ProtocolViolation::ConflictingModes.into());
        }
        if num_senders == 0 {
            return Err(LatticeError::Configuration(
                "a redistribution needs at least one sender".to_string(),
            ));
        }
        let num_attributes = output.desc().num_attributes();
        let mode = if options.defer_merge {
            Mode::DeferAndDrain {
                buffers: (0..num_senders).map(|_| SenderBuffer::default()).collect(),
            }
        } else {
            Mode::MergeOnArrival {
                bitmaps: options
                    .cache_bitmaps
                    .then(|| BitmapCache::new(num_senders)),
            }
        };
        let state = ReceiverState {
            phase: Phase::Idle,
            mode,
            senders: (0..num_senders)
                .map(|_| (0..num_attributes).map(|_| SenderState::default()).collect())
                .collect(),
            attributes: (0..num_attributes)
                .map(|_| AttributeState::default())
                .collect(),
            failure: None,
            next_fetch_id: 0,
        };
        let (changes, _) = watch::channel(0);
        Ok(Self {
            operation,
            output,
            num_senders,
            options,
            aggregates: vec![None; num_attributes],
            state: Mutex::new(state),
            changes,
            metrics: Arc::new(ReceiverMetrics::default()),
        })
    }

    /// Combine overlapping cells of `attribute` with `aggregate` instead of
    /// letting the later chunk win.
    pub fn with_aggregate(
        mut self,
        attribute: AttributeId,
        aggregate: Arc<dyn Aggregate>,
    ) -> Result<Self> {
        let slot = self
            .aggregates
            .get_mut(attribute)
            .ok_or(ProtocolViolation::UnknownAttribute(attribute))?;
        *slot = Some(aggregate);
        Ok(self)
    }

    pub fn operation(&self) -> OperationId {
        self.operation
    }

    pub fn output(&self) -> &Arc<MemArray> {
        &self.output
    }

    pub fn num_senders(&self) -> usize {
        self.num_senders
    }

    pub fn phase(&self) -> Phase {
        self.state.lock().phase
    }

    pub fn metrics(&self) -> Arc<ReceiverMetrics> {
        self.metrics.clone()
    }

    /// Whether every sender has ended every attribute.
    pub fn is_complete(&self) -> bool {
        self.state.lock().is_complete(self.num_senders)
    }

    /// (sender, attribute) pairs whose end-of-stream has not arrived yet.
    pub fn pending_end_of_stream(&self) -> Vec<(NodeId, AttributeId)> {
        let state = self.state.lock();
        state
            .senders
            .iter()
            .enumerate()
            .flat_map(|(sender, attrs)| {
                attrs
                    .iter()
                    .enumerate()
                    .filter(|(_, a)| !a.exhausted)
                    .map(move |(attribute, _)| (sender, attribute))
            })
            .collect()
    }

    /// Grant `sender` credit for `count` more chunks of `attribute`.
    ///
    /// Returns the id of this request.
    pub fn request_chunks(
        &self,
        sender: NodeId,
        attribute: AttributeId,
        count: u64,
    ) -> Result<u64> {
        self.check_sender_attribute(sender, attribute)?;
        let mut state = self.state.lock();
        state.next_fetch_id += 1;
        let fetch_id = state.next_fetch_id;
        let sender_state = &mut state.senders[sender][attribute];
        sender_state.requested += count;
        sender_state.last_fetch_id = fetch_id;
        Ok(fetch_id)
    }

    /// Unused credit of (`sender`, `attribute`) and the id of the last
    /// request.
    pub fn outstanding_requests(
        &self,
        sender: NodeId,
        attribute: AttributeId,
    ) -> Result<(u64, u64)> {
        self.check_sender_attribute(sender, attribute)?;
        let state = self.state.lock();
        let sender_state = &state.senders[sender][attribute];
        Ok((sender_state.requested, sender_state.last_fetch_id))
    }

    /// Sequence numbers of buffered, not yet drained chunks of (`sender`,
    /// `attribute`) in arrival order.
    pub fn pending_sequences(&self, sender: NodeId, attribute: AttributeId) -> Result<Vec<u64>> {
        self.check_sender_attribute(sender, attribute)?;
        let state = self.state.lock();
        Ok(state.senders[sender][attribute].queue.iter().copied().collect())
    }

    /// Bytes and count of the chunks of `attribute` currently buffered.
    pub fn buffered(&self, attribute: AttributeId) -> Result<(usize, usize)> {
        let state = self.state.lock();
        let a = state
            .attributes
            .get(attribute)
            .ok_or(ProtocolViolation::UnknownAttribute(attribute))?;
        Ok((a.buffered_bytes, a.buffered_count))
    }

    pub fn on_message(&self, message: ShuffleMessage) -> Result<()> {
        match message {
            ShuffleMessage::Chunk {
                sender,
                attribute,
                position,
                payload,
                is_bitmap,
                ..
            } => self.on_chunk_arrived(sender, attribute, position, payload, is_bitmap),
            ShuffleMessage::EndOfStream {
                sender, attribute, ..
            } => self.on_end_of_stream(sender, attribute),
            ShuffleMessage::Disconnected { peer } => {
                self.on_sender_disconnected(peer);
                Ok(())
            }
        }
    }

    /// Accept a chunk, or the bitmap of a position when `is_bitmap` is set.
    ///
    /// Any error except for data arriving after the operation finished is
    /// fatal to the operation.
    pub fn on_chunk_arrived(
        &self,
        sender: NodeId,
        attribute: AttributeId,
        position: Coordinates,
        payload: ChunkPayload,
        is_bitmap: bool,
    ) -> Result<()> {
        let mut state = self.state.lock();
        state.check_open()?;
        if matches!(state.phase, Phase::Draining | Phase::Done) {
            let e = ProtocolViolation::AlreadyFinalized {
                attribute,
                position,
            };
            error!("Redistribution {}: {e}", self.operation);
            return Err(e.into());
        }
        let result =
            self.accept_chunk(&mut state, sender, attribute, position, payload, is_bitmap);
        if let Err(e) = &result {
            self.fail(&mut state, e);
        }
        result
    }

    /// Mark (`sender`, `attribute`) exhausted. Repeated calls are no-ops.
    pub fn on_end_of_stream(&self, sender: NodeId, attribute: AttributeId) -> Result<()> {
        let mut state = self.state.lock();
        state.check_open()?;
        let result = self.accept_end_of_stream(&mut state, sender, attribute);
        if let Err(e) = &result {
            self.fail(&mut state, e);
        }
        result
    }

    /// Fail the operation if `peer` still owes data, ignore it otherwise.
    pub fn on_sender_disconnected(&self, peer: NodeId) {
        let mut state = self.state.lock();
        if matches!(state.phase, Phase::Done | Phase::Failed | Phase::Aborted) {
            return;
        }
        let Some(attributes) = state.senders.get(peer) else {
            return;
        };
        let pending = attributes
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.exhausted)
            .map(|(a, _)| a)
            .collect::<Vec<_>>();
        if pending.is_empty() {
            debug!(
                "Sender {peer} of redistribution {} disconnected after end-of-stream",
                self.operation
            );
            return;
        }
        let e = LatticeError::Transport(
            peer,
            format!("disconnected before end-of-stream of attributes {pending:?}"),
        );
        self.fail(&mut state, &e);
    }

    /// Wait for end-of-stream from every sender for every attribute, then
    /// drain the buffered chunks into the output array.
    ///
    /// Calling flush again after it succeeded returns the same output.
    pub async fn flush(&self) -> Result<Arc<MemArray>> {
        let wait = self.wait_for_end_of_stream();
        match self.options.flush_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, wait).await {
                Ok(result) => result?,
                Err(_) => {
                    let mut state = self.state.lock();
                    let pending = state.pending_senders();
                    let e = LatticeError::Transport(
                        pending.first().copied().unwrap_or_default(),
                        format!("no end-of-stream within {timeout:?} from senders {pending:?}"),
                    );
                    self.fail(&mut state, &e);
                    return Err(e);
                }
            },
            None => wait.await?,
        }
        self.drain()
    }

    /// Release all buffered data and fail pending and future flushes with
    /// [`LatticeError::Cancelled`].
    pub fn abort(&self) {
        let mut state = self.state.lock();
        if matches!(state.phase, Phase::Done | Phase::Aborted) {
            return;
        }
        warn!("Aborting redistribution {}", self.operation);
        state.phase = Phase::Aborted;
        state.release();
        self.notify();
    }

    fn check_sender_attribute(&self, sender: NodeId, attribute: AttributeId) -> Result<()> {
        if sender >= self.num_senders {
            return Err(ProtocolViolation::UnknownSender(sender).into());
        }
        if attribute >= self.output.desc().num_attributes() {
            return Err(ProtocolViolation::UnknownAttribute(attribute).into());
        }
        Ok(())
    }

    fn accept_chunk(
        &self,
        state: &mut ReceiverState,
        sender: NodeId,
        attribute: AttributeId,
        position: Coordinates,
        payload: ChunkPayload,
        is_bitmap: bool,
    ) -> Result<()> {
        self.check_sender_attribute(sender, attribute)?;
        if !self.output.desc().is_chunk_aligned(&position) {
            return Err(ProtocolViolation::MalformedPayload(format!(
                "{position:?} is not a chunk position of array '{}'",
                self.output.desc().name
            ))
            .into());
        }
        self.start_accumulating(state);
        let sequence = self.output.mapper().chunk_to_sequence(&position);
        let sender_state = &mut state.senders[sender][attribute];
        if sender_state.exhausted {
            return Err(ProtocolViolation::DataAfterEndOfStream { sender, attribute }.into());
        }

        if is_bitmap {
            self.metrics.bitmaps_received.inc(1);
            let bitmap = payload.bitmap().cloned().ok_or_else(|| {
                ProtocolViolation::MalformedPayload(format!(
                    "bitmap chunk at {position:?} carries no bitmap"
                ))
            })?;
            let expected = self.output.mapper().num_cells(&position);
            if bitmap.num_cells() != expected {
                return Err(ProtocolViolation::MalformedPayload(format!(
                    "bitmap at {position:?} covers {} cells instead of {expected}",
                    bitmap.num_cells()
                ))
                .into());
            }
            trace!("Bitmap from sender {sender} at {position:?}");
            return match &mut state.mode {
                Mode::MergeOnArrival {
                    bitmaps: Some(bitmaps),
                } => bitmaps.record_bitmap(sender, position, bitmap),
                Mode::MergeOnArrival { bitmaps: None } => {
                    Err(ProtocolViolation::MalformedPayload(format!(
                        "bitmap chunk at {position:?} while bitmap caching is off"
                    ))
                    .into())
                }
                Mode::DeferAndDrain { buffers } => {
                    buffers[sender].bitmaps.insert((sequence, attribute), bitmap);
                    Ok(())
                }
            };
        }

        if !sender_state.seen.insert(sequence) {
            return Err(ProtocolViolation::DuplicateChunk {
                sender,
                attribute,
                position,
            }
            .into());
        }
        sender_state.requested = sender_state.requested.saturating_sub(1);
        self.metrics.chunks_received.inc(1);

        match &mut state.mode {
            Mode::MergeOnArrival { bitmaps } => {
                let fallback = match (payload.bitmap(), bitmaps.as_ref()) {
                    (None, Some(bitmaps)) => Some(bitmaps.get_bitmap(sender, &position)?),
                    _ => None,
                };
                let chunk = self.close_payload(sender, position, payload, fallback)?;
                trace!(
                    "Merging chunk from sender {sender} for attribute {attribute} at {:?}",
                    chunk.position()
                );
                self.output
                    .merge_chunk(attribute, chunk, self.aggregates[attribute].as_deref())?;
                self.metrics.chunks_merged.inc(1);
            }
            Mode::DeferAndDrain { buffers } => {
                let size = payload.size_bytes();
                let buffered = state
                    .attributes
                    .iter()
                    .map(|a| a.buffered_bytes)
                    .sum::<usize>();
                if let Some(capacity) = self.options.max_buffered_bytes {
                    if buffered + size > capacity {
                        return Err(LatticeError::ResourceExhausted {
                            requested: size,
                            capacity,
                            pinned: buffered,
                        });
                    }
                }
                buffers[sender].payloads.insert((sequence, attribute), payload);
                state.senders[sender][attribute].queue.push_back(sequence);
                let attribute_state = &mut state.attributes[attribute];
                attribute_state.buffered_bytes += size;
                attribute_state.buffered_count += 1;
                self.metrics.chunks_buffered.inc(1);
                self.metrics.bytes_buffered.inc(size as u64);
            }
        }
        Ok(())
    }

    fn accept_end_of_stream(
        &self,
        state: &mut ReceiverState,
        sender: NodeId,
        attribute: AttributeId,
    ) -> Result<()> {
        self.check_sender_attribute(sender, attribute)?;
        self.start_accumulating(state);
        let sender_state = &mut state.senders[sender][attribute];
        if sender_state.exhausted {
            debug!(
                "Repeated end-of-stream from sender {sender} for attribute {attribute} of {}",
                self.operation
            );
            return Ok(());
        }
        sender_state.exhausted = true;
        let attribute_state = &mut state.attributes[attribute];
        attribute_state.exhausted_senders += 1;
        if attribute_state.exhausted_senders == self.num_senders {
            debug!(
                "All senders ended attribute {attribute} of redistribution {}",
                self.operation
            );
        }
        if state.is_complete(self.num_senders) {
            info!("Redistribution {} received all data", self.operation);
        }
        self.notify();
        Ok(())
    }

    fn start_accumulating(&self, state: &mut ReceiverState) {
        if state.phase == Phase::Idle {
            debug!("Redistribution {} is accumulating", self.operation);
            state.phase = Phase::Accumulating;
        }
    }

    /// Attach the sparsity bitmap to `payload`: the embedded one, else
    /// `fallback`, else a full bitmap when the output array is dense.
    fn close_payload(
        &self,
        sender: NodeId,
        position: Coordinates,
        payload: ChunkPayload,
        fallback: Option<SharedBitmap>,
    ) -> Result<Chunk> {
        let num_cells = self.output.mapper().num_cells(&position);
        let chunk = match (payload.bitmap().is_some(), fallback) {
            (true, _) => payload.close(position, None)?,
            (false, Some(bitmap)) => payload.close(position, Some(bitmap))?,
            (false, None) if !self.output.desc().emptyable => {
                payload.close_dense(position, num_cells)?
            }
            (false, None) => {
                return Err(ProtocolViolation::MissingBitmap { sender, position }.into())
            }
        };
        if chunk.num_cells() != num_cells {
            return Err(ProtocolViolation::MalformedPayload(format!(
                "chunk at {:?} covers {} cells instead of {num_cells}",
                chunk.position(),
                chunk.num_cells()
            ))
            .into());
        }
        Ok(chunk)
    }

    async fn wait_for_end_of_stream(&self) -> Result<()> {
        let mut changes = self.changes.subscribe();
        loop {
            {
                let state = self.state.lock();
                state.check_open()?;
                if state.phase == Phase::Done || state.is_complete(self.num_senders) {
                    return Ok(());
                }
            }
            if changes.changed().await.is_err() {
                return Err(LatticeError::Cancelled);
            }
        }
    }

    fn drain(&self) -> Result<Arc<MemArray>> {
        let mut state = self.state.lock();
        state.check_open()?;
        if state.phase == Phase::Done {
            return Ok(self.output.clone());
        }
        state.phase = Phase::Draining;
        let result = match &mut state.mode {
            Mode::MergeOnArrival { .. } => Ok(()),
            Mode::DeferAndDrain { buffers } => {
                info!("Draining redistribution {}", self.operation);
                self.drain_buffers(std::mem::take(buffers))
            }
        };
        match result {
            Ok(()) => {
                state.release();
                state.phase = Phase::Done;
                info!(
                    "Redistribution {} done, {} chunks in '{}'",
                    self.operation,
                    self.output.chunk_count(),
                    self.output.desc().name
                );
                self.notify();
                Ok(self.output.clone())
            }
            Err(e) => {
                self.fail(&mut state, &e);
                Err(e)
            }
        }
    }

    /// Write buffered chunks by ascending position, then attribute, then
    /// sender, merging the contributions to one (attribute, position) before
    /// a single write to the output.
    fn drain_buffers(&self, mut buffers: Vec<SenderBuffer>) -> Result<()> {
        let sequences = buffers
            .iter()
            .flat_map(|b| b.payloads.keys().map(|(sequence, _)| *sequence))
            .collect::<BTreeSet<_>>();
        for sequence in sequences {
            let position = self.output.mapper().sequence_to_chunk(sequence);
            for (attribute, aggregate) in self.aggregates.iter().enumerate() {
                let aggregate = aggregate.as_deref();
                let mut merged: Option<Chunk> = None;
                for (sender, buffer) in buffers.iter_mut().enumerate() {
                    let Some(payload) = buffer.payloads.remove(&(sequence, attribute)) else {
                        continue;
                    };
                    let fallback = buffer.bitmap_for(sequence, attribute);
                    let chunk = self.close_payload(sender, position.clone(), payload, fallback)?;
                    merged = Some(match (merged, aggregate) {
                        (None, _) => chunk,
                        (Some(acc), Some(aggregate)) => acc.aggregate_merge(&chunk, aggregate)?,
                        (Some(acc), None) => acc.merge(&chunk)?,
                    });
                }
                if let Some(chunk) = merged {
                    trace!("Writing attribute {attribute} at {position:?}");
                    self.output.merge_chunk(attribute, chunk, aggregate)?;
                    self.metrics.chunks_written.inc(1);
                }
            }
            for buffer in buffers.iter_mut() {
                buffer.bitmaps = buffer.bitmaps.split_off(&(sequence + 1, 0));
            }
        }
        Ok(())
    }

    fn fail(&self, state: &mut ReceiverState, e: &LatticeError) {
        if !matches!(
            state.phase,
            Phase::Idle | Phase::Accumulating | Phase::Draining
        ) {
            return;
        }
        error!("Redistribution {} failed: {e}", self.operation);
        state.failure = Some(replicate(e));
        state.phase = Phase::Failed;
        state.release();
        self.notify();
    }

    fn notify(&self) {
        self.changes.send_modify(|generation| *generation += 1);
    }
}
