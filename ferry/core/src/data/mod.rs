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

//! Block-level data layer: the block pool, block views, files, readers and
//! writers, and the channel multiplexer built on them.

pub mod block;
pub mod block_pool;
pub mod block_reader;
pub mod block_writer;
pub mod channel;
pub mod file;
pub mod multiplexer;
pub mod pin_request;
pub mod storage;

pub use block::{Block, BlockMeta, PinnedBlock};
pub use block_pool::{
    BlockId, BlockPool, BlockPoolStats, ByteBlockRef, PinnedByteBlock, RequesterId,
};
pub use block_reader::{BlockReader, BlockSource};
pub use block_writer::{BlockSink, BlockWriter};
pub use channel::{ChannelId, ChannelReader, Emitter};
pub use file::File;
pub use multiplexer::Multiplexer;
pub use pin_request::PinRequest;
pub use storage::{DiskStorage, ExternalStorage, InMemoryStorage};
