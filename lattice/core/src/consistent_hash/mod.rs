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

//! Consistent hash ring with virtual replicas, used to place chunk
//! positions on nodes so that membership changes move few chunks.

use crate::consistent_hash::node::Node;
use md5::{Digest, Md5};
use std::collections::{BTreeMap, HashMap};

pub mod node;

pub type HashFunction = fn(&[u8]) -> Vec<u8>;

pub struct ConsistentHash<N>
where
    N: Node,
{
    virtual_nodes: BTreeMap<Vec<u8>, String>,
    node_replicas: HashMap<String, (N, usize)>,
    hash_func: HashFunction,
}

impl<N> ConsistentHash<N>
where
    N: Node,
{
    pub fn new(node_replicas: Vec<(N, usize)>) -> Self {
        Self::new_with_hash(node_replicas, md5_hash)
    }

    pub fn new_with_hash(
        node_replicas: Vec<(N, usize)>,
        hash_func: HashFunction,
    ) -> Self {
        let mut ring = Self {
            virtual_nodes: BTreeMap::new(),
            node_replicas: HashMap::new(),
            hash_func,
        };
        for (node, num_replicas) in node_replicas {
            ring.add(node, num_replicas);
        }
        ring
    }

    pub fn len(&self) -> usize {
        self.node_replicas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.node_replicas.is_empty()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &N> {
        self.node_replicas.values().map(|(node, _)| node)
    }

    fn vnode_key(&self, node_name: &str, replica: usize) -> Vec<u8> {
        (self.hash_func)(format!("{node_name}:{replica}").as_bytes())
    }

    /// Add a node, replacing any node with the same name.
    pub fn add(&mut self, node: N, num_replicas: usize) {
        self.remove(node.name());

        for i in 0..num_replicas {
            let vnode_key = self.vnode_key(node.name(), i);
            self.virtual_nodes.insert(vnode_key, node.name().to_string());
        }
        self.node_replicas
            .insert(node.name().to_string(), (node, num_replicas));
    }

    pub fn remove(&mut self, node_name: &str) -> Option<(N, usize)> {
        let (node, num_replicas) = self.node_replicas.remove(node_name)?;
        for i in 0..num_replicas {
            let vnode_key = self.vnode_key(node_name, i);
            self.virtual_nodes.remove(&vnode_key);
        }
        Some((node, num_replicas))
    }

    /// Update a node in place, e.g. to mark it unavailable.
    pub fn update<F: FnOnce(&mut N)>(&mut self, node_name: &str, f: F) -> bool {
        match self.node_replicas.get_mut(node_name) {
            Some((node, _)) => {
                f(node);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, key: &[u8]) -> Option<&N> {
        self.get_with_tolerance(key, 0)
    }

    /// Walk clockwise from the hash of `key`, skipping up to `tolerance`
    /// virtual nodes that belong to invalid nodes.
    pub fn get_with_tolerance(&self, key: &[u8], tolerance: usize) -> Option<&N> {
        if self.virtual_nodes.is_empty() {
            return None;
        }
        let tolerance = tolerance.min(self.virtual_nodes.len() - 1);
        let hashed_key = (self.hash_func)(key);
        self.virtual_nodes
            .range(hashed_key..)
            .chain(self.virtual_nodes.iter())
            .take(tolerance + 1)
            .filter_map(|(_, node_name)| self.node_replicas.get(node_name))
            .map(|(node, _)| node)
            .find(|node| node.is_valid())
    }
}

pub fn md5_hash(data: &[u8]) -> Vec<u8> {
    let mut digest = Md5::default();
    digest.update(data);
    digest.finalize().to_vec()
}
