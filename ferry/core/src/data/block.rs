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

//! Views over byte blocks: [`Block`] (unpinned, possibly swapped out) and
//! [`PinnedBlock`] (resident for the lifetime of the handle).

use std::sync::Arc;

use bytes::Bytes;

use crate::data::block_pool::{BlockId, ByteBlockRef, PinnedByteBlock, PoolInner, RequesterId};
use crate::data::pin_request::PinRequest;
use crate::error::Result;

/// Boundaries of the serialized items inside a byte block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockMeta {
    /// Byte offset of the view inside the byte block.
    pub begin: usize,
    /// End of the view, exclusive.
    pub end: usize,
    /// Byte offset of the first item that starts inside the view.
    pub first_item: usize,
    /// Number of items starting inside the view.
    pub num_items: usize,
    /// Whether the view was received from another worker.
    pub has_sender: bool,
}

impl BlockMeta {
    pub fn new(begin: usize, end: usize, first_item: usize, num_items: usize) -> Self {
        Self {
            begin,
            end,
            first_item,
            num_items,
            has_sender: false,
        }
    }

    pub fn with_sender(mut self) -> Self {
        self.has_sender = true;
        self
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.begin)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A view over a byte block without a residency guarantee.
#[derive(Debug, Clone)]
pub struct Block {
    byte_block: ByteBlockRef,
    meta: BlockMeta,
}

impl Block {
    pub fn new(byte_block: ByteBlockRef, meta: BlockMeta) -> Self {
        Self { byte_block, meta }
    }

    pub fn byte_block(&self) -> &ByteBlockRef {
        &self.byte_block
    }

    pub fn id(&self) -> BlockId {
        self.byte_block.id()
    }

    pub fn meta(&self) -> BlockMeta {
        self.meta
    }

    /// Length of the view in bytes.
    pub fn size(&self) -> usize {
        self.meta.len()
    }

    pub fn num_items(&self) -> usize {
        self.meta.num_items
    }

    /// Requests residency for `requester`. The request is already
    /// satisfied if the bytes are in memory.
    pub fn pin(&self, requester: RequesterId) -> PinRequest {
        self.byte_block.pool().pin(self, requester)
    }

    /// Pins the block, blocking until a read-back completes if needed.
    pub fn pin_wait(&self, requester: RequesterId) -> Result<PinnedBlock> {
        self.pin(requester).wait()
    }
}

/// A view over a byte block that keeps it resident while alive.
#[derive(Debug, Clone)]
pub struct PinnedBlock {
    byte_block: PinnedByteBlock,
    meta: BlockMeta,
}

impl PinnedBlock {
    pub fn new(byte_block: PinnedByteBlock, meta: BlockMeta) -> Self {
        Self { byte_block, meta }
    }

    pub(crate) fn adopt(
        pool: &Arc<PoolInner>,
        id: BlockId,
        size: usize,
        requester: RequesterId,
        meta: BlockMeta,
    ) -> Self {
        Self::new(PinnedByteBlock::adopt(pool, id, size, requester), meta)
    }

    pub fn byte_block(&self) -> &PinnedByteBlock {
        &self.byte_block
    }

    pub fn meta(&self) -> BlockMeta {
        self.meta
    }

    pub fn requester(&self) -> RequesterId {
        self.byte_block.requester()
    }

    /// The bytes between `begin` and `end`.
    pub fn data(&self) -> Bytes {
        let data = self.byte_block.data();
        let end = self.meta.end.min(data.len());
        data.slice(self.meta.begin.min(end)..end)
    }

    /// An unpinned view of the same bytes; this handle keeps its pin.
    pub fn to_block(&self) -> Block {
        Block::new(self.byte_block.byte_block().clone(), self.meta)
    }

    /// Converts into an unpinned view, releasing the pin.
    pub fn into_block(self) -> Block {
        Block::new(self.byte_block.into_byte_block(), self.meta)
    }
}
