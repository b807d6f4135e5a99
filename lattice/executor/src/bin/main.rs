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

//! Lattice redistribution demo: shuffles a generated sparse array between
//! in-process nodes and checks that no cell is lost.

use std::sync::Arc;

use clap::{Parser, ValueEnum};
use futures::future::try_join_all;
use lattice_cache::{ChunkCache, MemArray};
use lattice_core::chunk::{chunk_from_cells, Value};
use lattice_core::config::LatticeConfig;
use lattice_core::error::{LatticeError, Result};
use lattice_core::partition::{PartitionFunction, PartitioningScheme, SchemePartitioner};
use lattice_core::schema::{ArrayDesc, DimensionDesc};
use lattice_core::transport::LocalTransport;
use lattice_executor::ShuffleService;
use log::info;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Scheme {
    Hash,
    ByRow,
    ByCol,
    ConsistentHash,
    Replication,
}

impl From<Scheme> for PartitioningScheme {
    fn from(scheme: Scheme) -> Self {
        match scheme {
            Scheme::Hash => PartitioningScheme::HashPartitioned,
            Scheme::ByRow => PartitioningScheme::ByRow,
            Scheme::ByCol => PartitioningScheme::ByCol,
            Scheme::ConsistentHash => PartitioningScheme::ConsistentHash,
            Scheme::Replication => PartitioningScheme::Replication,
        }
    }
}

#[derive(Debug, Parser)]
#[clap(author, version, about, long_about = None)]
struct Args {
    #[clap(short, long, default_value_t = 4, help = "Number of in-process nodes")]
    nodes: usize,

    #[clap(long, default_value_t = 64)]
    rows: i64,

    #[clap(long, default_value_t = 64)]
    cols: i64,

    #[clap(short, long, default_value_t = 8, help = "Chunk interval of both dimensions")]
    chunk: i64,

    #[clap(long, default_value_t = 3, help = "Keep one cell in every <density>")]
    density: i64,

    #[clap(short, long, value_enum, default_value_t = Scheme::Hash)]
    scheme: Scheme,

    #[clap(long, help = "Buffer chunks per sender and merge them on flush")]
    defer_merge: bool,

    #[clap(long, conflicts_with = "defer_merge", help = "Send bitmaps once per chunk")]
    cache_bitmaps: bool,

    #[clap(long, help = "Chunk cache budget of each node")]
    cache_capacity_bytes: Option<usize>,

    #[clap(long, help = "Spill evicted chunks to this directory")]
    overflow_dir: Option<String>,
}

fn is_present(cell: &[i64], density: i64) -> bool {
    (cell[0] * 31 + cell[1] * 17) % density.max(1) == 0
}

/// Fill every node's input with the chunks it owns under `source`. Returns
/// the number of generated cells per attribute.
fn generate(
    desc: &ArrayDesc,
    source: &dyn PartitionFunction,
    inputs: &[Arc<MemArray>],
    density: i64,
) -> Result<u64> {
    let mapper = desc.mapper();
    let cols = desc.dimensions[1].length() as i64;
    let mut cells = 0;
    for sequence in 0..mapper.num_chunks() {
        let position = mapper.sequence_to_chunk(sequence);
        let extent = mapper.chunk_extent(&position);
        let present = (0..extent.num_cells())
            .map(|offset| (offset, extent.offset_to_cell(offset)))
            .filter(|(_, cell)| is_present(cell, density))
            .collect::<Vec<_>>();
        if present.is_empty() {
            continue;
        }
        cells += present.len() as u64;
        let input = &inputs[source.destination(&position)?];
        let values = present
            .iter()
            .map(|(offset, cell)| (*offset, Value::Int64(cell[0] * cols + cell[1])));
        input.write_chunk(0, chunk_from_cells(position.clone(), extent.num_cells(), values)?)?;
        let weights = present
            .iter()
            .map(|(offset, _)| (*offset, Value::Float64(1.0)));
        input.write_chunk(1, chunk_from_cells(position, extent.num_cells(), weights)?)?;
    }
    Ok(cells)
}

fn count_cells(array: &MemArray, attribute: usize) -> Result<u64> {
    let mut cells = 0;
    for position in array.positions(attribute) {
        if let Some(chunk) = array.get_chunk(attribute, &position)? {
            cells += chunk.count() as u64;
        }
    }
    Ok(cells)
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = LatticeConfig::default()
        .with_defer_merge(args.defer_merge)?
        .with_cache_bitmaps(args.cache_bitmaps)?;
    if let Some(bytes) = args.cache_capacity_bytes {
        config = config.with_cache_capacity_bytes(bytes)?;
    }
    if let Some(dir) = &args.overflow_dir {
        config = config.with_overflow_dir(dir)?;
    }

    let desc = ArrayDesc::try_new(
        "generated",
        vec![
            DimensionDesc::try_new("i", 0, args.rows - 1, args.chunk, 0)?,
            DimensionDesc::try_new("j", 0, args.cols - 1, args.chunk, 0)?,
        ],
        &["value", "weight"],
        true,
    )?;

    let mut services = vec![];
    for (transport, inbox) in LocalTransport::mesh(args.nodes, config.event_buffer_size()) {
        let cache = ChunkCache::try_from_config(&config)?;
        let mut service = ShuffleService::new(Arc::new(transport), cache, config.clone());
        service.start(inbox)?;
        services.push(service);
    }

    // every node starts out with one band of rows
    let source = SchemePartitioner::try_new(desc.clone(), args.nodes, PartitioningScheme::ByRow)?;
    let inputs = services
        .iter()
        .map(|s| s.new_output(desc.clone()))
        .collect::<Vec<_>>();
    let generated = generate(&desc, &source, &inputs, args.density)?;
    info!(
        "Generated {generated} cells in {} chunks",
        inputs.iter().map(|i| i.chunk_count()).sum::<usize>()
    );

    let operation = Uuid::new_v4();
    for service in &services {
        let output = service.new_output(desc.clone());
        service.register(service.new_receiver(operation, output)?)?;
    }
    let target: Arc<dyn PartitionFunction> = Arc::new(SchemePartitioner::try_new(
        desc.clone(),
        args.nodes,
        args.scheme.into(),
    )?);
    let summaries = try_join_all(
        services
            .iter()
            .zip(&inputs)
            .map(|(service, input)| service.redistribute(operation, input, target.clone())),
    )
    .await?;
    let outputs = try_join_all(services.iter().map(|s| s.complete(operation))).await?;

    let mut received = 0;
    for ((service, summary), output) in services.iter().zip(&summaries).zip(&outputs) {
        let cells = count_cells(output, 0)?;
        let metrics = service.cache().metrics();
        println!(
            "node {}: sent {} chunks, holds {} chunks with {cells} cells \
             (cache hits {}, misses {}, spills {})",
            service.node(),
            summary.chunks_sent,
            output.chunk_count(),
            metrics.hit_count(),
            metrics.miss_count(),
            metrics.spill_count(),
        );
        received += cells;
    }

    for service in services.iter_mut() {
        service.stop();
    }
    let copies = match args.scheme {
        Scheme::Replication => args.nodes as u64,
        _ => 1,
    };
    if received != generated * copies {
        return Err(LatticeError::Internal(format!(
            "generated {generated} cells in {copies} copies but {received} arrived"
        )));
    }
    println!("redistributed {generated} cells over {} nodes", args.nodes);
    Ok(())
}
