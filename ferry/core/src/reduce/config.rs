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

//! Configuration for reduce pre-stages.

use crate::config::FerryConfig;

/// Memory budget and table geometry of a reduce pre-stage.
#[derive(Debug, Clone)]
pub struct ReduceConfig {
    /// Byte budget of the in-memory table across all partitions (default: 64MB)
    pub limit_memory_bytes: usize,
    /// Entries per bucket block of the bucket table (default: 64)
    pub bucket_block_size: usize,
    /// Fraction of a partition's probing slots that may be filled (default: 0.5)
    pub probing_fill_rate: f64,
}

impl Default for ReduceConfig {
    fn default() -> Self {
        Self {
            limit_memory_bytes: 64 * 1024 * 1024, // 64 MB
            bucket_block_size: 64,
            probing_fill_rate: 0.5,
        }
    }
}

impl ReduceConfig {
    pub fn new(limit_memory_bytes: usize) -> Self {
        Self {
            limit_memory_bytes,
            ..Default::default()
        }
    }

    /// Bytes one partition's share of the table may occupy.
    pub fn partition_budget(&self, num_partitions: usize) -> usize {
        self.limit_memory_bytes / num_partitions.max(1)
    }

    /// Fill rate clamped into (0, 1).
    pub(crate) fn fill_rate(&self) -> f64 {
        if self.probing_fill_rate > 0.0 && self.probing_fill_rate < 1.0 {
            self.probing_fill_rate
        } else {
            ReduceConfig::default().probing_fill_rate
        }
    }
}

impl From<&FerryConfig> for ReduceConfig {
    fn from(config: &FerryConfig) -> Self {
        Self {
            limit_memory_bytes: config.reduce_limit_memory(),
            bucket_block_size: config.reduce_bucket_block_size(),
            probing_fill_rate: config.reduce_probing_fill_rate(),
        }
    }
}
