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

//! Lattice error types

use std::{
    error::Error,
    fmt::{Display, Formatter},
    io, result,
};

use futures::future::Aborted;

use crate::schema::{AttributeId, Coordinates, NodeId};

pub type Result<T> = result::Result<T, LatticeError>;

/// Violations of the redistribution protocol.
///
/// These indicate a broken assumption between sender and receiver, never a
/// transient fault, so they are fatal to the redistribution operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolViolation {
    /// Both defer-merge and bitmap caching were requested for one operation.
    ConflictingModes,
    /// An attribute chunk arrived without an embedded bitmap and no bitmap
    /// has been cached for its sender.
    MissingBitmap {
        sender: NodeId,
        position: Coordinates,
    },
    /// The cached bitmap of a sender belongs to another chunk position.
    BitmapPositionMismatch {
        sender: NodeId,
        expected: Coordinates,
        cached: Coordinates,
    },
    /// The same (sender, attribute, position) was delivered twice.
    DuplicateChunk {
        sender: NodeId,
        attribute: AttributeId,
        position: Coordinates,
    },
    /// Data arrived from a sender after its end-of-stream for that attribute.
    DataAfterEndOfStream {
        sender: NodeId,
        attribute: AttributeId,
    },
    /// Data arrived for a position that has already been written out.
    AlreadyFinalized {
        attribute: AttributeId,
        position: Coordinates,
    },
    UnknownSender(NodeId),
    UnknownAttribute(AttributeId),
    /// Chunk payload is inconsistent with its bitmap or its chunk extent.
    MalformedPayload(String),
}

impl Display for ProtocolViolation {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            ProtocolViolation::ConflictingModes => write!(
                f,
                "defer-merge and bitmap caching cannot be enabled together"
            ),
            ProtocolViolation::MissingBitmap { sender, position } => write!(
                f,
                "no sparsity bitmap available from sender {sender} for chunk {position:?}"
            ),
            ProtocolViolation::BitmapPositionMismatch {
                sender,
                expected,
                cached,
            } => write!(
                f,
                "cached bitmap of sender {sender} is at {cached:?} but chunk is at {expected:?}"
            ),
            ProtocolViolation::DuplicateChunk {
                sender,
                attribute,
                position,
            } => write!(
                f,
                "duplicate chunk from sender {sender} for attribute {attribute} at {position:?}"
            ),
            ProtocolViolation::DataAfterEndOfStream { sender, attribute } => write!(
                f,
                "chunk from sender {sender} for attribute {attribute} after end-of-stream"
            ),
            ProtocolViolation::AlreadyFinalized {
                attribute,
                position,
            } => write!(
                f,
                "chunk for attribute {attribute} at {position:?} arrived after it was finalized"
            ),
            ProtocolViolation::UnknownSender(sender) => {
                write!(f, "unknown sender {sender}")
            }
            ProtocolViolation::UnknownAttribute(attribute) => {
                write!(f, "unknown attribute {attribute}")
            }
            ProtocolViolation::MalformedPayload(desc) => {
                write!(f, "malformed chunk payload: {desc}")
            }
        }
    }
}

#[derive(Debug)]
pub enum LatticeError {
    /// Feature is not yet implemented.
    NotImplemented(String),
    /// General error with a descriptive message.
    General(String),
    /// Internal error indicating a bug or unexpected state.
    Internal(String),
    /// Configuration error with invalid settings.
    Configuration(String),
    /// Redistribution protocol violation.
    Protocol(ProtocolViolation),
    /// Peer disconnected or timed out: (node, message).
    Transport(NodeId, String),
    /// The chunk cache cannot admit more pinned data.
    ResourceExhausted {
        requested: usize,
        capacity: usize,
        pinned: usize,
    },
    /// I/O operation error.
    IoError(io::Error),
    /// Tokio task join error.
    TokioError(tokio::task::JoinError),
    /// Operation was cancelled.
    Cancelled,
}

impl LatticeError {
    /// Whether the owning query may retry the whole operation.
    ///
    /// Individual chunks are never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LatticeError::Transport(..) | LatticeError::IoError(_))
    }
}

#[allow(clippy::from_over_into)]
impl<T> Into<Result<T>> for LatticeError {
    fn into(self) -> Result<T> {
        Err(self)
    }
}

pub fn lattice_error(message: &str) -> LatticeError {
    LatticeError::General(message.to_owned())
}

impl From<String> for LatticeError {
    fn from(e: String) -> Self {
        LatticeError::General(e)
    }
}

impl From<ProtocolViolation> for LatticeError {
    fn from(e: ProtocolViolation) -> Self {
        LatticeError::Protocol(e)
    }
}

impl From<io::Error> for LatticeError {
    fn from(e: io::Error) -> Self {
        LatticeError::IoError(e)
    }
}

impl From<tokio::task::JoinError> for LatticeError {
    fn from(e: tokio::task::JoinError) -> Self {
        LatticeError::TokioError(e)
    }
}

impl From<Aborted> for LatticeError {
    fn from(_: Aborted) -> Self {
        LatticeError::Cancelled
    }
}

impl Display for LatticeError {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            LatticeError::NotImplemented(desc) => {
                write!(f, "Not implemented: {desc}")
            }
            LatticeError::General(desc) => write!(f, "General error: {desc}"),
            LatticeError::Internal(desc) => {
                write!(f, "Internal Lattice error: {desc}")
            }
            LatticeError::Configuration(desc) => {
                write!(f, "Configuration error: {desc}")
            }
            LatticeError::Protocol(violation) => {
                write!(f, "Redistribution protocol violation: {violation}")
            }
            LatticeError::Transport(node, desc) => {
                write!(f, "Transport error from node {node}: {desc}")
            }
            LatticeError::ResourceExhausted {
                requested,
                capacity,
                pinned,
            } => write!(
                f,
                "Chunk cache exhausted: {requested} bytes requested, \
                {pinned} of {capacity} bytes pinned"
            ),
            LatticeError::IoError(desc) => write!(f, "IO error: {desc}"),
            LatticeError::TokioError(desc) => write!(f, "Tokio join error: {desc}"),
            LatticeError::Cancelled => write!(f, "Operation cancelled"),
        }
    }
}

impl Error for LatticeError {}
