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

//! Reduce table with separate chaining over fixed-size bucket blocks.

use std::mem::size_of;

use crate::reduce::config::ReduceConfig;
use crate::reduce::index::TableIndex;
use crate::reduce::table::{InsertOutcome, ReduceTable};

type Chain<K, T> = Vec<Vec<(K, T)>>;

/// Every bucket is a chain of blocks of `bucket_block_size` entries.
pub struct BucketTable<K, T> {
    num_partitions: usize,
    buckets_per_partition: usize,
    block_size: usize,
    limit: usize,
    buckets: Vec<Chain<K, T>>,
    partition_items: Vec<usize>,
    num_items: usize,
    num_blocks: usize,
}

impl<K, T> BucketTable<K, T> {
    /// Sizes a partition so that its buckets and blocks fit its share of
    /// the byte budget. Every bucket may hold one partly filled block, so
    /// half of the share goes to bucket heads and their last block, the
    /// rest bounds the number of entries.
    pub fn new(num_partitions: usize, config: &ReduceConfig) -> Self {
        let num_partitions = num_partitions.max(1);
        let block_size = config.bucket_block_size.max(1);
        let entry_size = size_of::<(K, T)>().max(1);
        let per_bucket = block_size * entry_size + size_of::<Chain<K, T>>();
        let budget = config.partition_budget(num_partitions);
        let buckets_per_partition = (budget / (2 * per_bucket)).max(1);
        let limit =
            (budget.saturating_sub(buckets_per_partition * per_bucket) / entry_size).max(1);
        Self {
            num_partitions,
            buckets_per_partition,
            block_size,
            limit,
            buckets: Vec::new(),
            partition_items: vec![0; num_partitions],
            num_items: 0,
            num_blocks: 0,
        }
    }

    fn bucket_range(&self, partition_id: usize) -> std::ops::Range<usize> {
        let first = partition_id * self.buckets_per_partition;
        first..first + self.buckets_per_partition
    }
}

impl<K: Eq + Send, T: Send> ReduceTable<K, T> for BucketTable<K, T> {
    fn initialize(&mut self) {
        self.buckets = (0..self.num_partitions * self.buckets_per_partition)
            .map(|_| Vec::new())
            .collect();
        self.partition_items = vec![0; self.num_partitions];
        self.num_items = 0;
        self.num_blocks = 0;
    }

    fn insert(
        &mut self,
        index: TableIndex,
        key: K,
        item: T,
        reduce: &dyn Fn(&T, &T) -> T,
    ) -> InsertOutcome<K, T> {
        if self.buckets.is_empty() {
            self.initialize();
        }
        let slot = index.partition_id * self.buckets_per_partition
            + index.bucket % self.buckets_per_partition;
        let chain = &mut self.buckets[slot];
        if let Some(entry) = chain
            .iter_mut()
            .flat_map(|block| block.iter_mut())
            .find(|(k, _)| *k == key)
        {
            entry.1 = reduce(&entry.1, &item);
            return InsertOutcome::Combined;
        }
        if self.partition_items[index.partition_id] >= self.limit {
            return InsertOutcome::PartitionFull(key, item);
        }
        match chain.last_mut() {
            Some(block) if block.len() < self.block_size => block.push((key, item)),
            _ => {
                let mut block = Vec::with_capacity(self.block_size);
                block.push((key, item));
                chain.push(block);
                self.num_blocks += 1;
            }
        }
        self.partition_items[index.partition_id] += 1;
        self.num_items += 1;
        InsertOutcome::Inserted
    }

    fn take_partition(&mut self, partition_id: usize) -> Vec<(K, T)> {
        if self.buckets.is_empty() {
            return Vec::new();
        }
        let mut entries = Vec::with_capacity(self.partition_items[partition_id]);
        for slot in self.bucket_range(partition_id) {
            let chain = std::mem::take(&mut self.buckets[slot]);
            self.num_blocks -= chain.len();
            entries.extend(chain.into_iter().flatten());
        }
        self.num_items -= entries.len();
        self.partition_items[partition_id] = 0;
        entries
    }

    fn num_partitions(&self) -> usize {
        self.num_partitions
    }

    fn buckets_per_partition(&self) -> usize {
        self.buckets_per_partition
    }

    fn partition_limit(&self) -> usize {
        self.limit
    }

    fn partition_items(&self, partition_id: usize) -> usize {
        self.partition_items[partition_id]
    }

    fn num_items(&self) -> usize {
        self.num_items
    }

    fn mem_usage(&self) -> usize {
        self.num_blocks * self.block_size * size_of::<(K, T)>()
            + self.buckets.len() * size_of::<Chain<K, T>>()
    }
}
