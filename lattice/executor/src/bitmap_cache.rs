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

//! Per-sender cache of the last received sparsity bitmap.

use lattice_core::bitmap::SharedBitmap;
use lattice_core::error::{ProtocolViolation, Result};
use lattice_core::schema::{Coordinate, Coordinates, NodeId};

/// Holds at most one bitmap per sender.
///
/// A sender in separate-bitmap mode ships the bitmap of a chunk position
/// before the attribute chunks at that position, so the bitmap is only valid
/// for attribute chunks of the same sender at the same position.
#[derive(Debug)]
pub struct BitmapCache {
    slots: Vec<Option<(Coordinates, SharedBitmap)>>,
}

impl BitmapCache {
    pub fn new(num_senders: usize) -> Self {
        Self {
            slots: vec![None; num_senders],
        }
    }

    /// Store the bitmap of `sender` at `position`, replacing its previous one.
    pub fn record_bitmap(
        &mut self,
        sender: NodeId,
        position: Coordinates,
        bitmap: SharedBitmap,
    ) -> Result<()> {
        let slot = self
            .slots
            .get_mut(sender)
            .ok_or(ProtocolViolation::UnknownSender(sender))?;
        *slot = Some((position, bitmap));
        Ok(())
    }

    /// The bitmap of `sender`, provided it was recorded for `expected`.
    pub fn get_bitmap(&self, sender: NodeId, expected: &[Coordinate]) -> Result<SharedBitmap> {
        let slot = self
            .slots
            .get(sender)
            .ok_or(ProtocolViolation::UnknownSender(sender))?;
        match slot {
            Some((position, bitmap)) if position.as_slice() == expected => Ok(bitmap.clone()),
            Some((position, _)) => Err(ProtocolViolation::BitmapPositionMismatch {
                sender,
                expected: expected.to_vec(),
                cached: position.clone(),
            }
            .into()),
            None => Err(ProtocolViolation::MissingBitmap {
                sender,
                position: expected.to_vec(),
            }
            .into()),
        }
    }

    /// Number of senders with a cached bitmap.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|s| *s = None);
    }
}
