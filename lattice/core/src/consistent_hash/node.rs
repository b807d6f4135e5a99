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

use crate::schema::NodeId;

/// A member of a hash ring.
pub trait Node {
    /// Stable name hashed to place the node's virtual replicas.
    fn name(&self) -> &str;

    /// Invalid nodes keep their ring slots but are skipped on lookup.
    fn is_valid(&self) -> bool;
}

/// A compute node taking part in redistributions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceNode {
    pub id: NodeId,
    name: String,
    pub available: bool,
}

impl InstanceNode {
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            name: format!("instance-{id}"),
            available: true,
        }
    }
}

impl Node for InstanceNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_valid(&self) -> bool {
        self.available
    }
}
