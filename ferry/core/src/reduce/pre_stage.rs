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

//! Reduce pre-stage: groups and combines records by key before they are
//! shuffled, spilling partitions that outgrow their share of memory.

use std::hash::Hash;
use std::sync::Arc;

use log::{debug, info};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::data::block_pool::{BlockPool, RequesterId};
use crate::error::{FerryError, Result};
use crate::reduce::bucket_table::BucketTable;
use crate::reduce::config::ReduceConfig;
use crate::reduce::index::{IndexFunction, ReduceByHash, ReduceByIndex};
use crate::reduce::output::{HashOutput, OrderedOutput, PartitionOutput, PartitionWriter};
use crate::reduce::probing_table::ProbingTable;
use crate::reduce::table::{InsertOutcome, ReduceTable, TableKind};
use crate::reduce::{KeyExtractor, ReduceFunction};

/// Partitioned pre-aggregation of a record stream.
///
/// Every inserted record is combined with the stored record of the same
/// key. When a new key arrives at a partition that is at its item limit,
/// the partition is spilled to its output first. After
/// [`close_all`](Self::close_all), folding the records written to all
/// partition writers by key gives the same result as folding the input.
///
/// With an order-preserving index function a flushed partition is sealed:
/// its writer already holds the merged, ordered records, so inserting into
/// it again fails until the stage is initialized anew.
pub struct ReducePreStage<K, T> {
    num_partitions: usize,
    key_fn: KeyExtractor<K, T>,
    reduce_fn: ReduceFunction<T>,
    index_fn: Arc<dyn IndexFunction<K>>,
    table: Box<dyn ReduceTable<K, T>>,
    output: Box<dyn PartitionOutput<K, T>>,
    num_spills: usize,
    sealed: Vec<bool>,
    closed: bool,
}

impl<K, T> ReducePreStage<K, T>
where
    K: Eq + Send + 'static,
    T: Send + 'static,
{
    pub fn new(
        kind: TableKind,
        key_fn: KeyExtractor<K, T>,
        reduce_fn: ReduceFunction<T>,
        index_fn: Arc<dyn IndexFunction<K>>,
        output: Box<dyn PartitionOutput<K, T>>,
        config: &ReduceConfig,
    ) -> Self {
        let num_partitions = output.num_partitions();
        let table: Box<dyn ReduceTable<K, T>> = match kind {
            TableKind::Bucket => Box::new(BucketTable::new(num_partitions, config)),
            TableKind::Probing => Box::new(ProbingTable::new(num_partitions, config)),
        };
        debug!(
            "Reduce pre-stage with {num_partitions} partitions ({kind:?}), {} entries per partition",
            table.partition_limit()
        );
        Self {
            num_partitions,
            key_fn,
            reduce_fn,
            index_fn,
            table,
            output,
            num_spills: 0,
            sealed: vec![false; num_partitions],
            closed: false,
        }
    }

    /// Allocates the table and resets the counters.
    pub fn initialize(&mut self) {
        self.table.initialize();
        self.num_spills = 0;
        self.sealed = vec![false; self.num_partitions];
        self.closed = false;
    }

    pub fn insert(&mut self, item: T) -> Result<()> {
        if self.closed {
            return Err(FerryError::Internal(
                "insert into a closed reduce pre-stage".to_string(),
            ));
        }
        let key = (self.key_fn)(&item);
        let index = self.index_fn.index(
            &key,
            self.num_partitions,
            self.table.buckets_per_partition(),
        );
        if self.sealed.get(index.partition_id).copied().unwrap_or(false) {
            return Err(FerryError::Internal(format!(
                "insert into partition {} after it was flushed in key order",
                index.partition_id
            )));
        }
        match self.table.insert(index, key, item, &*self.reduce_fn) {
            InsertOutcome::Combined | InsertOutcome::Inserted => Ok(()),
            InsertOutcome::PartitionFull(key, item) => {
                self.spill(index.partition_id)?;
                match self.table.insert(index, key, item, &*self.reduce_fn) {
                    InsertOutcome::PartitionFull(..) => Err(FerryError::Internal(format!(
                        "partition {} rejected an entry after spilling",
                        index.partition_id
                    ))),
                    _ => Ok(()),
                }
            }
        }
    }

    /// Writes out every partition without closing the writers. Seals the
    /// partitions of an order-preserving stage.
    pub fn flush_all(&mut self) -> Result<()> {
        (0..self.num_partitions).try_for_each(|partition_id| self.flush_partition(partition_id))
    }

    pub fn flush_partition(&mut self, partition_id: usize) -> Result<()> {
        if self.index_fn.is_order_preserving() {
            if let Some(sealed) = self.sealed.get_mut(partition_id) {
                *sealed = true;
            }
        }
        let entries = self.table.take_partition(partition_id);
        self.output
            .flush(partition_id, entries, &*self.reduce_fn)
            .map_err(|e| FerryError::PartitionWriteFailure(partition_id, Box::new(e)))
    }

    /// Flushes the remaining entries and closes every writer. Further calls do nothing.
    pub fn close_all(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.flush_all()?;
        self.closed = true;
        for partition_id in 0..self.num_partitions {
            self.output
                .close(partition_id)
                .map_err(|e| FerryError::PartitionWriteFailure(partition_id, Box::new(e)))?;
        }
        info!(
            "Reduce pre-stage closed {} partitions after {} spills",
            self.num_partitions, self.num_spills
        );
        Ok(())
    }

    /// Entries currently held in memory.
    pub fn num_items(&self) -> usize {
        self.table.num_items()
    }

    pub fn num_spills(&self) -> usize {
        self.num_spills
    }

    /// Approximate bytes of the in-memory table.
    pub fn mem_usage(&self) -> usize {
        self.table.mem_usage()
    }

    pub fn num_partitions(&self) -> usize {
        self.num_partitions
    }

    pub fn partition_limit(&self) -> usize {
        self.table.partition_limit()
    }

    fn spill(&mut self, partition_id: usize) -> Result<()> {
        let entries = self.table.take_partition(partition_id);
        debug!(
            "Spilling partition {partition_id} with {} entries",
            entries.len()
        );
        self.output
            .spill(partition_id, entries)
            .map_err(|e| FerryError::PartitionWriteFailure(partition_id, Box::new(e)))?;
        self.num_spills += 1;
        Ok(())
    }
}

impl<K, T> ReducePreStage<K, T>
where
    K: Hash + Eq + Send + 'static,
    T: Send + 'static,
{
    /// Hash-partitioned stage writing one writer per partition.
    pub fn by_hash(
        kind: TableKind,
        key_fn: KeyExtractor<K, T>,
        reduce_fn: ReduceFunction<T>,
        writers: Vec<Box<dyn PartitionWriter<T>>>,
        config: &ReduceConfig,
    ) -> Self {
        Self::new(
            kind,
            key_fn,
            reduce_fn,
            Arc::new(ReduceByHash::<K>::new()),
            Box::new(HashOutput::new(writers)),
            config,
        )
    }
}

impl<T> ReducePreStage<usize, T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    /// Order-preserving stage over keys in the range of `index`. Spill runs
    /// are allocated from `pool` for `requester`.
    #[allow(clippy::too_many_arguments)]
    pub fn by_index(
        kind: TableKind,
        key_fn: KeyExtractor<usize, T>,
        reduce_fn: ReduceFunction<T>,
        index: ReduceByIndex,
        pool: BlockPool,
        requester: RequesterId,
        writers: Vec<Box<dyn PartitionWriter<T>>>,
        config: &ReduceConfig,
    ) -> Self {
        Self::new(
            kind,
            key_fn,
            reduce_fn,
            Arc::new(index),
            Box::new(OrderedOutput::new(pool, requester, writers)),
            config,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Collects the records written to one partition.
    #[derive(Clone, Default)]
    struct VecWriter {
        items: Arc<Mutex<Vec<(u64, u64)>>>,
        flushes: Arc<Mutex<usize>>,
        closed: Arc<Mutex<bool>>,
    }

    impl PartitionWriter<(u64, u64)> for VecWriter {
        fn put(&mut self, item: &(u64, u64)) -> Result<()> {
            self.items.lock().push(*item);
            Ok(())
        }

        fn flush(&mut self) -> Result<()> {
            *self.flushes.lock() += 1;
            Ok(())
        }

        fn close(&mut self) -> Result<()> {
            let mut closed = self.closed.lock();
            if *closed {
                return Err(FerryError::Internal("closed twice".to_string()));
            }
            *closed = true;
            Ok(())
        }
    }

    struct BrokenWriter;

    impl PartitionWriter<(u64, u64)> for BrokenWriter {
        fn put(&mut self, _item: &(u64, u64)) -> Result<()> {
            Err(FerryError::IoError(std::io::Error::other("broken pipe")))
        }

        fn flush(&mut self) -> Result<()> {
            Ok(())
        }

        fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn key_fn() -> KeyExtractor<u64, (u64, u64)> {
        Arc::new(|item: &(u64, u64)| item.0)
    }

    fn sum_fn() -> ReduceFunction<(u64, u64)> {
        Arc::new(|a: &(u64, u64), b: &(u64, u64)| (a.0, a.1 + b.1))
    }

    fn writers(n: usize) -> (Vec<VecWriter>, Vec<Box<dyn PartitionWriter<(u64, u64)>>>) {
        let collectors: Vec<VecWriter> = (0..n).map(|_| VecWriter::default()).collect();
        let boxed = collectors
            .iter()
            .map(|w| Box::new(w.clone()) as Box<dyn PartitionWriter<(u64, u64)>>)
            .collect();
        (collectors, boxed)
    }

    fn fold(items: impl IntoIterator<Item = (u64, u64)>) -> Vec<(u64, u64)> {
        let mut folded = std::collections::BTreeMap::new();
        for (key, value) in items {
            *folded.entry(key).or_insert(0) += value;
        }
        folded.into_iter().collect()
    }

    #[test]
    fn combines_without_spilling() -> Result<()> {
        for kind in [TableKind::Bucket, TableKind::Probing] {
            let (collectors, boxed) = writers(3);
            let mut stage =
                ReducePreStage::by_hash(kind, key_fn(), sum_fn(), boxed, &ReduceConfig::default());
            stage.initialize();
            for i in 0..100u64 {
                stage.insert((i % 10, 1))?;
            }
            assert_eq!(10, stage.num_items());
            assert!(stage.mem_usage() > 0);
            assert!(stage.mem_usage() <= ReduceConfig::default().limit_memory_bytes);
            stage.close_all()?;
            stage.close_all()?;

            assert_eq!(0, stage.num_spills());
            assert_eq!(0, stage.num_items());
            let output: Vec<(u64, u64)> = collectors
                .iter()
                .flat_map(|c| c.items.lock().clone())
                .collect();
            assert_eq!(10, output.len());
            assert_eq!((0..10).map(|k| (k, 10)).collect::<Vec<_>>(), fold(output));
            assert!(collectors.iter().all(|c| *c.closed.lock()));
            assert!(collectors.iter().all(|c| *c.flushes.lock() == 1));
        }
        Ok(())
    }

    #[test]
    fn spills_full_partitions() -> Result<()> {
        for kind in [TableKind::Bucket, TableKind::Probing] {
            let (collectors, boxed) = writers(2);
            let config = ReduceConfig {
                limit_memory_bytes: 2 * 512,
                bucket_block_size: 2,
                probing_fill_rate: 0.5,
            };
            let mut stage = ReducePreStage::by_hash(kind, key_fn(), sum_fn(), boxed, &config);
            // fewer entries than the ~18 keys each partition receives
            assert!(stage.partition_limit() < 16);
            stage.initialize();
            let input: Vec<(u64, u64)> = (0..500u64).map(|i| ((i * 7) % 37, i)).collect();
            for item in &input {
                stage.insert(*item)?;
                assert!(stage.num_items() <= 2 * stage.partition_limit());
                assert!(stage.mem_usage() <= config.limit_memory_bytes);
            }
            stage.close_all()?;

            assert!(stage.num_spills() > 0);
            let output: Vec<(u64, u64)> = collectors
                .iter()
                .flat_map(|c| c.items.lock().clone())
                .collect();
            assert!(output.len() > 37);
            assert_eq!(fold(input), fold(output));
        }
        Ok(())
    }

    #[test]
    fn insert_after_close_fails() -> Result<()> {
        let (_, boxed) = writers(1);
        let mut stage = ReducePreStage::by_hash(
            TableKind::Bucket,
            key_fn(),
            sum_fn(),
            boxed,
            &ReduceConfig::default(),
        );
        stage.close_all()?;
        assert!(stage.insert((1, 1)).is_err());
        Ok(())
    }

    #[test]
    fn write_failure_names_the_partition() {
        let config = ReduceConfig::new(1);
        let mut stage = ReducePreStage::by_hash(
            TableKind::Probing,
            key_fn(),
            sum_fn(),
            vec![Box::new(BrokenWriter) as Box<dyn PartitionWriter<(u64, u64)>>],
            &config,
        );
        stage.initialize();
        assert!(stage.insert((1, 1)).is_ok());
        let err = stage.insert((2, 1)).unwrap_err();
        assert!(matches!(err, FerryError::PartitionWriteFailure(0, _)));
    }
}
