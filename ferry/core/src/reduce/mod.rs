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

//! Spilling reduce pre-stage: a partitioned in-memory aggregation table
//! that spills overflowing partitions to their output writers.

pub mod bucket_table;
pub mod config;
pub mod index;
pub mod output;
pub mod pre_stage;
pub mod probing_table;
pub mod table;

use std::sync::Arc;

pub use bucket_table::BucketTable;
pub use config::ReduceConfig;
pub use index::{IndexFunction, ReduceByHash, ReduceByIndex, TableIndex};
pub use output::{HashOutput, OrderedOutput, PartitionOutput, PartitionWriter};
pub use pre_stage::ReducePreStage;
pub use probing_table::ProbingTable;
pub use table::{InsertOutcome, ReduceTable, TableKind};

/// Extracts the grouping key of a record.
pub type KeyExtractor<K, T> = Arc<dyn Fn(&T) -> K + Send + Sync>;

/// Combines two records of the same key into one.
pub type ReduceFunction<T> = Arc<dyn Fn(&T, &T) -> T + Send + Sync>;
