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

//! Decodes records from a stream of blocks, pinning one block at a time.

use std::marker::PhantomData;

use bytes::Bytes;
use serde::de::DeserializeOwned;

use crate::data::block::{Block, PinnedBlock};
use crate::data::block_pool::RequesterId;
use crate::error::Result;

/// Supplier of blocks for a [`BlockReader`].
pub trait BlockSource: Send {
    /// Next block if one is available without blocking.
    fn try_next_block(&mut self) -> Result<Option<Block>>;

    /// Next block, blocking until one is available. `None` ends the stream.
    fn next_block(&mut self) -> Result<Option<Block>>;
}

struct CurrentBlock {
    // keeps the bytes resident while items are decoded
    _pinned: PinnedBlock,
    data: Bytes,
    offset: usize,
    remaining: usize,
}

/// Reads `bincode`-encoded records block by block.
pub struct BlockReader<T, S: BlockSource> {
    source: S,
    requester: RequesterId,
    current: Option<CurrentBlock>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned, S: BlockSource> BlockReader<T, S> {
    pub fn new(source: S, requester: RequesterId) -> Self {
        Self {
            source,
            requester,
            current: None,
            _marker: PhantomData,
        }
    }

    /// True if a record can be returned without waiting for more blocks.
    pub fn has_next(&mut self) -> Result<bool> {
        loop {
            if self.current.is_some() {
                return Ok(true);
            }
            match self.source.try_next_block()? {
                Some(block) => self.open(block)?,
                None => return Ok(false),
            }
        }
    }

    /// Next record, blocking on the source if needed. `None` at end of stream.
    pub fn next_item(&mut self) -> Result<Option<T>> {
        loop {
            if let Some(item) = self.decode()? {
                return Ok(Some(item));
            }
            match self.source.next_block()? {
                Some(block) => self.open(block)?,
                None => return Ok(None),
            }
        }
    }

    /// Drains the reader.
    pub fn read_all(&mut self) -> Result<Vec<T>> {
        let mut items = Vec::new();
        while let Some(item) = self.next_item()? {
            items.push(item);
        }
        Ok(items)
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    fn open(&mut self, block: Block) -> Result<()> {
        if block.num_items() == 0 {
            return Ok(());
        }
        let meta = block.meta();
        let pinned = block.pin_wait(self.requester)?;
        let data = pinned.data();
        self.current = Some(CurrentBlock {
            _pinned: pinned,
            data,
            offset: meta.first_item.saturating_sub(meta.begin),
            remaining: meta.num_items,
        });
        Ok(())
    }

    fn decode(&mut self) -> Result<Option<T>> {
        let Some(current) = self.current.as_mut() else {
            return Ok(None);
        };
        let mut rest = &current.data[current.offset.min(current.data.len())..];
        let item = bincode::deserialize_from(&mut rest)?;
        current.offset = current.data.len() - rest.len();
        current.remaining -= 1;
        if current.remaining == 0 {
            self.current = None;
        }
        Ok(Some(item))
    }
}

impl<T: DeserializeOwned, S: BlockSource> Iterator for BlockReader<T, S> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_item().transpose()
    }
}
