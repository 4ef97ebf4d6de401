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

//! Partition outputs of a reduce pre-stage.
//!
//! [`HashOutput`] writes spilled entries straight to the partition writer,
//! so a key may appear in several partial aggregates. [`OrderedOutput`]
//! keeps spilled entries in sorted runs and merges them with the in-memory
//! entries when the partition is flushed, producing one record per key in
//! key order.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use log::debug;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::data::block_pool::{BlockPool, RequesterId};
use crate::data::block_writer::{BlockSink, BlockWriter};
use crate::data::channel::Emitter;
use crate::data::file::File;
use crate::error::{FerryError, Result};

/// Record writer of one partition.
pub trait PartitionWriter<T>: Send {
    fn put(&mut self, item: &T) -> Result<()>;

    fn flush(&mut self) -> Result<()>;

    fn close(&mut self) -> Result<()>;
}

impl<T: Serialize, S: BlockSink> PartitionWriter<T> for BlockWriter<T, S> {
    fn put(&mut self, item: &T) -> Result<()> {
        BlockWriter::put(self, item)
    }

    fn flush(&mut self) -> Result<()> {
        BlockWriter::flush(self)
    }

    fn close(&mut self) -> Result<()> {
        BlockWriter::close(self)
    }
}

impl<T: Serialize> PartitionWriter<T> for Emitter<T> {
    fn put(&mut self, item: &T) -> Result<()> {
        self.emit(item)
    }

    fn flush(&mut self) -> Result<()> {
        Emitter::flush(self)
    }

    fn close(&mut self) -> Result<()> {
        Emitter::close(self)
    }
}

/// Where the entries of a partition go on spill and on flush.
pub trait PartitionOutput<K, T>: Send {
    fn num_partitions(&self) -> usize;

    /// Takes the entries of a partition that is being emptied to make room.
    fn spill(&mut self, partition_id: usize, entries: Vec<(K, T)>) -> Result<()>;

    /// Writes the remaining entries of a partition and flushes its writer.
    fn flush(
        &mut self,
        partition_id: usize,
        entries: Vec<(K, T)>,
        reduce: &dyn Fn(&T, &T) -> T,
    ) -> Result<()>;

    fn close(&mut self, partition_id: usize) -> Result<()>;
}

fn writer_mut<T>(
    writers: &mut [Box<dyn PartitionWriter<T>>],
    partition_id: usize,
) -> Result<&mut Box<dyn PartitionWriter<T>>> {
    writers
        .get_mut(partition_id)
        .ok_or_else(|| FerryError::Internal(format!("No writer for partition {partition_id}")))
}

/// Output for hash-partitioned stages.
pub struct HashOutput<T> {
    writers: Vec<Box<dyn PartitionWriter<T>>>,
}

impl<T> HashOutput<T> {
    pub fn new(writers: Vec<Box<dyn PartitionWriter<T>>>) -> Self {
        Self { writers }
    }
}

impl<K: Send, T: Send> PartitionOutput<K, T> for HashOutput<T> {
    fn num_partitions(&self) -> usize {
        self.writers.len()
    }

    fn spill(&mut self, partition_id: usize, entries: Vec<(K, T)>) -> Result<()> {
        let writer = writer_mut(&mut self.writers, partition_id)?;
        entries
            .iter()
            .try_for_each(|(_, item)| writer.put(item))
    }

    fn flush(
        &mut self,
        partition_id: usize,
        entries: Vec<(K, T)>,
        _reduce: &dyn Fn(&T, &T) -> T,
    ) -> Result<()> {
        let writer = writer_mut(&mut self.writers, partition_id)?;
        for (_, item) in &entries {
            writer.put(item)?;
        }
        writer.flush()
    }

    fn close(&mut self, partition_id: usize) -> Result<()> {
        writer_mut(&mut self.writers, partition_id)?.close()
    }
}

/// Output for order-preserving stages: spills become sorted runs in the
/// block pool, merged into the writer on flush.
pub struct OrderedOutput<K, T> {
    writers: Vec<Box<dyn PartitionWriter<T>>>,
    pool: BlockPool,
    requester: RequesterId,
    runs: Vec<Vec<File>>,
    _marker: std::marker::PhantomData<fn(K)>,
}

impl<K, T> OrderedOutput<K, T> {
    pub fn new(
        pool: BlockPool,
        requester: RequesterId,
        writers: Vec<Box<dyn PartitionWriter<T>>>,
    ) -> Self {
        let runs = writers.iter().map(|_| Vec::new()).collect();
        Self {
            writers,
            pool,
            requester,
            runs,
            _marker: std::marker::PhantomData,
        }
    }

    /// Spill runs waiting to be merged into a partition.
    pub fn num_runs(&self, partition_id: usize) -> usize {
        self.runs.get(partition_id).map_or(0, Vec::len)
    }
}

/// Next entry of one merge source. Ordered so that the heap pops the
/// smallest key first, earlier sources first among equal keys.
struct Head<K, T> {
    key: K,
    item: T,
    source: usize,
}

impl<K: Ord, T> Ord for Head<K, T> {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .key
            .cmp(&self.key)
            .then_with(|| other.source.cmp(&self.source))
    }
}

impl<K: Ord, T> PartialOrd for Head<K, T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K: Ord, T> PartialEq for Head<K, T> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<K: Ord, T> Eq for Head<K, T> {}

type MergeSource<'a, K, T> = Box<dyn Iterator<Item = Result<(K, T)>> + 'a>;

impl<K, T> PartitionOutput<K, T> for OrderedOutput<K, T>
where
    K: Ord + Serialize + DeserializeOwned + Send,
    T: Serialize + DeserializeOwned + Send,
{
    fn num_partitions(&self) -> usize {
        self.writers.len()
    }

    fn spill(&mut self, partition_id: usize, mut entries: Vec<(K, T)>) -> Result<()> {
        let runs = self
            .runs
            .get_mut(partition_id)
            .ok_or_else(|| FerryError::Internal(format!("No partition {partition_id}")))?;
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        let run = File::new(self.pool.clone());
        let mut writer = run.writer::<(K, T)>(self.requester);
        for entry in &entries {
            writer.put(entry)?;
        }
        writer.close()?;
        debug!(
            "Partition {partition_id}: spill run {} with {} entries in {} blocks",
            runs.len(),
            entries.len(),
            run.num_blocks()
        );
        runs.push(run);
        Ok(())
    }

    fn flush(
        &mut self,
        partition_id: usize,
        mut entries: Vec<(K, T)>,
        reduce: &dyn Fn(&T, &T) -> T,
    ) -> Result<()> {
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        let runs = self
            .runs
            .get_mut(partition_id)
            .map(std::mem::take)
            .unwrap_or_default();
        let writer = writer_mut(&mut self.writers, partition_id)?;
        if runs.is_empty() {
            for (_, item) in &entries {
                writer.put(item)?;
            }
            return writer.flush();
        }

        debug!(
            "Partition {partition_id}: merging {} spill runs with {} in-memory entries",
            runs.len(),
            entries.len()
        );
        let mut sources: Vec<MergeSource<'_, K, T>> = runs
            .iter()
            .map(|run| Box::new(run.reader::<(K, T)>(self.requester, true)) as MergeSource<'_, K, T>)
            .collect();
        sources.push(Box::new(entries.into_iter().map(Ok)));

        let mut heap = BinaryHeap::with_capacity(sources.len());
        for (source, entries) in sources.iter_mut().enumerate() {
            if let Some(next) = entries.next() {
                let (key, item) = next?;
                heap.push(Head { key, item, source });
            }
        }

        let mut current: Option<(K, T)> = None;
        while let Some(Head { key, item, source }) = heap.pop() {
            if let Some(next) = sources[source].next() {
                let (key, item) = next?;
                heap.push(Head { key, item, source });
            }
            current = match current.take() {
                Some((current_key, acc)) if current_key == key => {
                    Some((current_key, reduce(&acc, &item)))
                }
                Some((_, acc)) => {
                    writer.put(&acc)?;
                    Some((key, item))
                }
                None => Some((key, item)),
            };
        }
        if let Some((_, acc)) = current {
            writer.put(&acc)?;
        }
        writer.flush()
    }

    fn close(&mut self, partition_id: usize) -> Result<()> {
        writer_mut(&mut self.writers, partition_id)?.close()
    }
}
