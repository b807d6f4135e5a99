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

mod common;

use std::sync::Arc;

use common::{cells, line, memory_cache, payload, snapshot, Snapshot, CHUNK_CELLS};
use lattice_cache::MemArray;
use lattice_core::aggregate::Sum;
use lattice_core::chunk::Value;
use lattice_core::error::Result;
use lattice_core::schema::{AttributeId, Coordinate, NodeId};
use lattice_executor::{ReceiverOptions, RedistributionReceiver};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use uuid::Uuid;

fn receiver(num_senders: usize, options: ReceiverOptions, capacity: usize) -> RedistributionReceiver {
    let output = Arc::new(MemArray::new(line(), memory_cache(capacity)));
    RedistributionReceiver::try_new(Uuid::new_v4(), output, num_senders, options).unwrap()
}

fn defer() -> ReceiverOptions {
    ReceiverOptions {
        defer_merge: true,
        ..Default::default()
    }
}

/// Attribute `a` of a sender's cell; attribute `b` always holds its negation,
/// so a cell whose `b` is not `-a` mixes two senders' deliveries.
fn value_of(sender: NodeId, position: Coordinate, offset: u64) -> i64 {
    (sender as i64 + 1) * 1000 + position * 10 + offset as i64
}

fn send(
    r: &RedistributionReceiver,
    sender: NodeId,
    attribute: AttributeId,
    position: Coordinate,
    offsets: &[u64],
) -> Result<()> {
    let values = offsets
        .iter()
        .map(|o| {
            let v = value_of(sender, position, *o);
            if attribute == 0 {
                v
            } else {
                -v
            }
        })
        .collect::<Vec<_>>();
    r.on_chunk_arrived(sender, attribute, vec![position], payload(offsets, &values), false)
}

fn end_all(r: &RedistributionReceiver, num_senders: usize) -> Result<()> {
    for sender in (0..num_senders).rev() {
        for attribute in 0..2 {
            r.on_end_of_stream(sender, attribute)?;
            r.on_end_of_stream(sender, attribute)?;
        }
    }
    Ok(())
}

/// Two senders and two attributes over three positions. At position 0 the
/// senders deliver the attributes in opposite orders.
fn feed_scenario(r: &RedistributionReceiver) -> Result<()> {
    send(r, 0, 1, 0, &[0, 1])?;
    send(r, 1, 0, 0, &[0, 1])?;
    send(r, 1, 1, 0, &[0, 1])?;
    send(r, 0, 0, 0, &[0, 1])?;

    send(r, 0, 0, 4, &[0])?;
    send(r, 0, 1, 4, &[0])?;
    send(r, 1, 1, 8, &[3])?;
    send(r, 1, 0, 8, &[3])?;
    send(r, 0, 0, 8, &[2])?;
    send(r, 0, 1, 8, &[2])?;
    end_all(r, 2)
}

fn is_paired(array: &MemArray, position: Coordinate) -> bool {
    let a = cells(array, 0, &[position]);
    let b = cells(array, 1, &[position]);
    a.len() == b.len()
        && a.iter().zip(&b).all(|((oa, va), (ob, vb))| {
            oa == ob
                && match (va, vb) {
                    (Value::Int64(x), Value::Int64(y)) => *y == -*x,
                    _ => false,
                }
        })
}

#[tokio::test]
async fn deferred_merge_keeps_attributes_of_one_sender_together() -> Result<()> {
    let r = receiver(2, defer(), 1 << 20);
    feed_scenario(&r)?;
    let out = r.flush().await?;

    for position in [0, 4, 8] {
        assert!(is_paired(&out, position), "position {position} is scrambled");
    }
    // the later sender wins overlapping cells, for both attributes alike
    assert_eq!(
        cells(&out, 0, &[0]),
        vec![
            (0, Value::Int64(value_of(1, 0, 0))),
            (1, Value::Int64(value_of(1, 0, 1)))
        ]
    );
    assert_eq!(cells(&out, 0, &[8]).len(), 2);
    // one write per (attribute, position)
    assert_eq!(r.metrics().chunks_written(), 6);
    assert_eq!(r.metrics().chunks_buffered(), 10);
    Ok(())
}

#[tokio::test]
async fn merge_on_arrival_scrambles_opposite_attribute_orders() -> Result<()> {
    let r = receiver(2, ReceiverOptions::default(), 1 << 20);
    feed_scenario(&r)?;
    let out = r.flush().await?;
    assert!(!is_paired(&out, 0));
    assert!(is_paired(&out, 8));
    Ok(())
}

type Message = (NodeId, AttributeId, Coordinate, Vec<u64>);

async fn run(messages: &[Message], num_senders: usize, capacity: usize) -> Result<(Snapshot, u64)> {
    let r = receiver(num_senders, defer(), capacity).with_aggregate(0, Arc::new(Sum))?;
    for (sender, attribute, position, offsets) in messages {
        send(&r, *sender, *attribute, *position, offsets)?;
    }
    end_all(&r, num_senders)?;
    let out = r.flush().await?;
    Ok((snapshot(&out), r.metrics().chunks_written()))
}

#[tokio::test]
async fn randomized_interleavings_converge() -> Result<()> {
    const SENDERS: usize = 3;
    let mut rng = StdRng::seed_from_u64(42);
    let mut messages: Vec<Message> = vec![];
    for sender in 0..SENDERS {
        for attribute in 0..2 {
            for position in [0, 4, 8] {
                let offsets = (0..CHUNK_CELLS)
                    .filter(|_| rng.random_bool(0.6))
                    .collect::<Vec<_>>();
                messages.push((sender, attribute, position, offsets));
            }
        }
    }

    let (canonical, written) = run(&messages, SENDERS, 1 << 20).await?;
    assert_eq!(written, 6);
    for seed in 0..20 {
        let mut shuffled = messages.clone();
        shuffled.shuffle(&mut StdRng::seed_from_u64(seed));
        // a tiny cache forces every output chunk through overflow storage
        let capacity = if seed % 2 == 0 { 1 << 20 } else { 1 };
        let (result, written) = run(&shuffled, SENDERS, capacity).await?;
        assert_eq!(result, canonical, "interleaving {seed} diverged");
        assert_eq!(written, 6);
    }
    Ok(())
}
