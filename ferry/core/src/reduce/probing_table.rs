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

//! Reduce table with open addressing and linear probing.

use std::mem::size_of;

use crate::reduce::config::ReduceConfig;
use crate::reduce::index::TableIndex;
use crate::reduce::table::{InsertOutcome, ReduceTable};

/// Each partition owns a contiguous range of slots, its share of the byte
/// budget, of which at most `probing_fill_rate` are filled. Probing wraps
/// around within the partition's range.
pub struct ProbingTable<K, T> {
    num_partitions: usize,
    slots_per_partition: usize,
    limit: usize,
    slots: Vec<Option<(K, T)>>,
    partition_items: Vec<usize>,
    num_items: usize,
}

impl<K, T> ProbingTable<K, T> {
    pub fn new(num_partitions: usize, config: &ReduceConfig) -> Self {
        let num_partitions = num_partitions.max(1);
        // slots are allocated up front and count fully against the budget
        let slots_per_partition = (config.partition_budget(num_partitions)
            / size_of::<Option<(K, T)>>().max(1))
        .max(2);
        // at least one free slot so that probing for a new key terminates
        let limit = ((slots_per_partition as f64 * config.fill_rate()) as usize)
            .clamp(1, slots_per_partition - 1);
        Self {
            num_partitions,
            slots_per_partition,
            limit,
            slots: Vec::new(),
            partition_items: vec![0; num_partitions],
            num_items: 0,
        }
    }
}

impl<K: Eq + Send, T: Send> ReduceTable<K, T> for ProbingTable<K, T> {
    fn initialize(&mut self) {
        self.slots = (0..self.num_partitions * self.slots_per_partition)
            .map(|_| None)
            .collect();
        self.partition_items = vec![0; self.num_partitions];
        self.num_items = 0;
    }

    fn insert(
        &mut self,
        index: TableIndex,
        key: K,
        item: T,
        reduce: &dyn Fn(&T, &T) -> T,
    ) -> InsertOutcome<K, T> {
        if self.slots.is_empty() {
            self.initialize();
        }
        let first = index.partition_id * self.slots_per_partition;
        let home = index.bucket % self.slots_per_partition;
        for probe in 0..self.slots_per_partition {
            let slot = first + (home + probe) % self.slots_per_partition;
            match &mut self.slots[slot] {
                Some((k, stored)) if *k == key => {
                    *stored = reduce(stored, &item);
                    return InsertOutcome::Combined;
                }
                Some(_) => continue,
                None => {
                    if self.partition_items[index.partition_id] >= self.limit {
                        return InsertOutcome::PartitionFull(key, item);
                    }
                    self.slots[slot] = Some((key, item));
                    self.partition_items[index.partition_id] += 1;
                    self.num_items += 1;
                    return InsertOutcome::Inserted;
                }
            }
        }
        // unreachable while the partition keeps a free slot
        InsertOutcome::PartitionFull(key, item)
    }

    fn take_partition(&mut self, partition_id: usize) -> Vec<(K, T)> {
        if self.slots.is_empty() {
            return Vec::new();
        }
        let first = partition_id * self.slots_per_partition;
        let entries: Vec<(K, T)> = self.slots[first..first + self.slots_per_partition]
            .iter_mut()
            .filter_map(Option::take)
            .collect();
        self.num_items -= entries.len();
        self.partition_items[partition_id] = 0;
        entries
    }

    fn num_partitions(&self) -> usize {
        self.num_partitions
    }

    fn buckets_per_partition(&self) -> usize {
        self.slots_per_partition
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
        self.slots.len() * size_of::<Option<(K, T)>>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add(a: &u64, b: &u64) -> u64 {
        a + b
    }

    fn at(partition_id: usize, bucket: usize) -> TableIndex {
        TableIndex {
            partition_id,
            bucket,
        }
    }

    #[test]
    fn probes_past_collisions_and_wraps() {
        let config = ReduceConfig {
            limit_memory_bytes: 3 * 8 * size_of::<Option<(u32, u64)>>(),
            probing_fill_rate: 0.5,
            ..Default::default()
        };
        let mut table = ProbingTable::<u32, u64>::new(3, &config);
        assert_eq!(4, table.partition_limit());
        assert_eq!(8, table.buckets_per_partition());
        table.initialize();
        assert_eq!(24 * size_of::<Option<(u32, u64)>>(), table.mem_usage());
        assert!(table.mem_usage() <= config.limit_memory_bytes);

        // all keys share the last home slot of partition 2
        for key in 0..4 {
            assert_eq!(InsertOutcome::Inserted, table.insert(at(2, 7), key, 1, &add));
        }
        assert_eq!(InsertOutcome::Combined, table.insert(at(2, 7), 3, 10, &add));
        assert_eq!(
            InsertOutcome::PartitionFull(4, 1),
            table.insert(at(2, 7), 4, 1, &add)
        );
        assert_eq!(0, table.partition_items(1));

        let mut entries = table.take_partition(2);
        entries.sort();
        assert_eq!(vec![(0, 1), (1, 1), (2, 1), (3, 11)], entries);
        assert_eq!(0, table.num_items());
        assert_eq!(InsertOutcome::Inserted, table.insert(at(2, 7), 4, 1, &add));
    }

    #[test]
    fn slots_stay_within_the_byte_budget() {
        for limit_memory_bytes in [1024, 4096, 100_000] {
            let config = ReduceConfig::new(limit_memory_bytes);
            let mut table = ProbingTable::<u64, u64>::new(1, &config);
            table.initialize();
            assert!(table.mem_usage() <= limit_memory_bytes);
            assert!(table.partition_limit() < table.buckets_per_partition());
        }
        let mut table = ProbingTable::<u64, u64>::new(1, &ReduceConfig::new(1024));
        table.initialize();
        assert_eq!(1024 / size_of::<Option<(u64, u64)>>(), table.buckets_per_partition());
    }

    #[test]
    fn partition_limit_is_at_least_one() {
        let config = ReduceConfig::new(1);
        let mut table = ProbingTable::<u64, u64>::new(13, &config);
        assert_eq!(1, table.partition_limit());
        assert!(table.buckets_per_partition() >= 2);
        table.initialize();
        assert_eq!(InsertOutcome::Inserted, table.insert(at(5, 0), 1, 1, &add));
        assert_eq!(
            InsertOutcome::PartitionFull(2, 2),
            table.insert(at(5, 0), 2, 2, &add)
        );
    }
}
