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

//! Index functions mapping keys to table partitions and buckets.

use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash};
use std::marker::PhantomData;

use log::warn;

/// Position of a key in a reduce table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableIndex {
    pub partition_id: usize,
    /// Bucket or home slot, local to the partition.
    pub bucket: usize,
}

/// Maps a key to a partition and a bucket within that partition.
pub trait IndexFunction<K>: Send + Sync {
    fn index(&self, key: &K, num_partitions: usize, buckets_per_partition: usize) -> TableIndex;

    /// True if smaller keys never land in a later partition than larger ones.
    fn is_order_preserving(&self) -> bool {
        false
    }
}

/// Partitions by a hash of the key. No order between partitions.
pub struct ReduceByHash<K> {
    hasher: RandomState,
    _marker: PhantomData<fn(&K)>,
}

impl<K> ReduceByHash<K> {
    pub fn new() -> Self {
        Self::with_hasher(RandomState::new())
    }

    pub fn with_hasher(hasher: RandomState) -> Self {
        Self {
            hasher,
            _marker: PhantomData,
        }
    }
}

impl<K> Default for ReduceByHash<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Hash> IndexFunction<K> for ReduceByHash<K> {
    fn index(&self, key: &K, num_partitions: usize, buckets_per_partition: usize) -> TableIndex {
        let hash = self.hasher.hash_one(key) as usize;
        let num_partitions = num_partitions.max(1);
        TableIndex {
            partition_id: hash % num_partitions,
            bucket: (hash / num_partitions) % buckets_per_partition.max(1),
        }
    }
}

/// Maps keys of `[begin, end)` onto consecutive ranges of partitions and
/// buckets, preserving key order. Keys outside the range are clamped to
/// the first or last partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReduceByIndex {
    begin: usize,
    end: usize,
}

impl ReduceByIndex {
    pub fn new(begin: usize, end: usize) -> Self {
        Self {
            begin,
            end: end.max(begin + 1),
        }
    }

    pub fn begin(&self) -> usize {
        self.begin
    }

    pub fn end(&self) -> usize {
        self.end
    }

    /// First key offset of `partition_id`.
    fn partition_begin(&self, partition_id: usize, num_partitions: usize) -> usize {
        let range = self.end - self.begin;
        (partition_id * range).div_ceil(num_partitions)
    }
}

impl IndexFunction<usize> for ReduceByIndex {
    fn index(&self, key: &usize, num_partitions: usize, buckets_per_partition: usize) -> TableIndex {
        let num_partitions = num_partitions.max(1);
        let buckets_per_partition = buckets_per_partition.max(1);
        let range = self.end - self.begin;
        if *key < self.begin || *key >= self.end {
            warn!(
                "Key {key} outside index range [{}, {})",
                self.begin, self.end
            );
        }
        let offset = key.saturating_sub(self.begin).min(range - 1);
        let partition_id = (offset * num_partitions / range).min(num_partitions - 1);
        let first = self.partition_begin(partition_id, num_partitions);
        let width = (self.partition_begin(partition_id + 1, num_partitions) - first).max(1);
        TableIndex {
            partition_id,
            bucket: ((offset - first) * buckets_per_partition / width)
                .min(buckets_per_partition - 1),
        }
    }

    fn is_order_preserving(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_index_is_in_range_and_stable() {
        let index = ReduceByHash::<String>::new();
        for key in ["a", "b", "hello", ""] {
            let first = index.index(&key.to_string(), 13, 7);
            assert!(first.partition_id < 13);
            assert!(first.bucket < 7);
            assert_eq!(first, index.index(&key.to_string(), 13, 7));
        }
    }

    #[test]
    fn index_partitions_are_monotonic() {
        let index = ReduceByIndex::new(0, 601);
        let mut last = TableIndex {
            partition_id: 0,
            bucket: 0,
        };
        let mut counts = [0usize; 13];
        for key in 0..601 {
            let current = index.index(&key, 13, 10);
            assert!(current.partition_id < 13);
            assert!(current.bucket < 10);
            assert!(
                (current.partition_id, current.bucket) >= (last.partition_id, last.bucket),
                "key {key} moved backwards"
            );
            counts[current.partition_id] += 1;
            last = current;
        }
        // every partition gets a share of the range
        assert!(counts.iter().all(|c| (46..=47).contains(c)));
        assert_eq!(0, index.index(&0, 13, 10).partition_id);
        assert_eq!(12, index.index(&600, 13, 10).partition_id);
    }

    #[test]
    fn index_clamps_out_of_range_keys() {
        let index = ReduceByIndex::new(10, 20);
        assert_eq!(0, index.index(&3, 4, 4).partition_id);
        assert_eq!(3, index.index(&99, 4, 4).partition_id);
    }
}
