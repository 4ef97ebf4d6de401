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

//! Shared fixtures for the integration tests.

use std::sync::Arc;

use ferry_core::config::FerryConfig;
use ferry_core::data::{BlockPool, ChannelId, InMemoryStorage, Multiplexer};
use ferry_core::dispatcher::Dispatcher;
use ferry_core::error::Result;
use ferry_core::net::Group;

/// Installs a test logger once; honours `RUST_LOG`.
#[allow(dead_code)]
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Unlimited in-memory pool with small blocks.
#[allow(dead_code)]
pub fn memory_pool(dispatcher: &Dispatcher, block_size: usize) -> BlockPool {
    BlockPool::new(
        dispatcher.clone(),
        Arc::new(InMemoryStorage::new()),
        None,
        block_size,
    )
}

/// `num_workers` multiplexers connected by an in-process mesh, each with
/// its own pool.
#[allow(dead_code)]
pub fn local_workers(num_workers: usize) -> Result<Vec<Multiplexer>> {
    init_logging();
    let dispatcher = Dispatcher::new("workers", 4)?;
    Ok(Group::local_mesh_from_config(num_workers, &FerryConfig::default())
        .into_iter()
        .map(|group| Multiplexer::new(memory_pool(&dispatcher, 4096), group))
        .collect())
}

/// Allocates a channel on every worker, as every worker of a job would.
#[allow(dead_code)]
pub fn allocate_channel(workers: &[Multiplexer]) -> ChannelId {
    let ids: Vec<ChannelId> = workers.iter().map(|w| w.allocate_channel()).collect();
    assert!(ids.windows(2).all(|w| w[0] == w[1]), "channel ids diverged: {ids:?}");
    ids[0]
}
