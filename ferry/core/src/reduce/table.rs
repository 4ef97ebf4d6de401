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

//! The reduce table capability shared by the bucket and probing tables.

use crate::reduce::index::TableIndex;

/// Table strategy of a reduce pre-stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    /// Separate chaining over fixed-size bucket blocks.
    Bucket,
    /// Open addressing with linear probing inside each partition's slot range.
    Probing,
}

/// Result of [`ReduceTable::insert`].
#[derive(Debug, PartialEq, Eq)]
pub enum InsertOutcome<K, T> {
    /// The record was combined with the stored record of the same key.
    Combined,
    /// The key was new and the record is now stored.
    Inserted,
    /// The key was new but its partition is at its item limit. The entry is
    /// handed back untouched.
    PartitionFull(K, T),
}

/// In-memory key to record table, sharded into partitions.
pub trait ReduceTable<K, T>: Send {
    /// Allocates the table, dropping any stored entries.
    fn initialize(&mut self);

    /// Combines `item` with the stored record of an equal key, or stores it
    /// if its partition has room.
    fn insert(
        &mut self,
        index: TableIndex,
        key: K,
        item: T,
        reduce: &dyn Fn(&T, &T) -> T,
    ) -> InsertOutcome<K, T>;

    /// Removes and returns every entry of a partition, in table order.
    fn take_partition(&mut self, partition_id: usize) -> Vec<(K, T)>;

    fn num_partitions(&self) -> usize;

    /// Buckets (or home slots) per partition handed to the index function.
    fn buckets_per_partition(&self) -> usize;

    /// Entry limit of each partition.
    fn partition_limit(&self) -> usize;

    fn partition_items(&self, partition_id: usize) -> usize;

    /// Entries stored across all partitions.
    fn num_items(&self) -> usize;

    /// Approximate bytes held by the table.
    fn mem_usage(&self) -> usize;
}
