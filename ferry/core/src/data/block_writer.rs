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

//! Serializes records into pool-backed blocks.

use std::marker::PhantomData;

use log::warn;
use serde::Serialize;

use crate::data::block::{Block, BlockMeta};
use crate::data::block_pool::{BlockPool, PinnedByteBlock, RequesterId};
use crate::error::{FerryError, Result};

/// Destination of finished blocks: a file or a channel edge.
pub trait BlockSink: Send {
    /// Takes ownership of a finished block.
    fn append_block(&mut self, block: Block) -> Result<()>;

    /// Makes every appended block visible to consumers.
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    /// Flushes and ends the stream. Called at most once.
    fn close(&mut self) -> Result<()>;
}

/// Writes `bincode`-encoded records into blocks of the pool's block size
/// and hands each finished block to its sink.
///
/// Items never span blocks: a record larger than the block size gets a
/// block of its own. Dropping an open writer closes it.
pub struct BlockWriter<T, S: BlockSink> {
    pool: BlockPool,
    requester: RequesterId,
    block_size: usize,
    sink: S,
    current: Option<PinnedByteBlock>,
    buffer: Vec<u8>,
    num_items: usize,
    items_written: usize,
    closed: bool,
    _marker: PhantomData<fn(&T)>,
}

impl<T, S: BlockSink> BlockWriter<T, S> {
    pub fn new(pool: BlockPool, requester: RequesterId, sink: S) -> Self {
        let block_size = pool.block_size();
        Self::with_block_size(pool, requester, sink, block_size)
    }

    pub fn with_block_size(
        pool: BlockPool,
        requester: RequesterId,
        sink: S,
        block_size: usize,
    ) -> Self {
        Self {
            pool,
            requester,
            block_size: block_size.max(1),
            sink,
            current: None,
            buffer: Vec::new(),
            num_items: 0,
            items_written: 0,
            closed: false,
            _marker: PhantomData,
        }
    }

    /// Finishes the current block and flushes the sink. Flushing a closed
    /// writer or a writer without buffered records only flushes the sink.
    pub fn flush(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.finish_block()?;
        self.sink.flush()
    }

    /// Finishes the current block and closes the sink.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Err(FerryError::Internal(
                "close on a closed block writer".to_string(),
            ));
        }
        self.closed = true;
        self.finish_block()?;
        self.sink.close()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Records put since the writer was created.
    pub fn items_written(&self) -> usize {
        self.items_written
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    fn finish_block(&mut self) -> Result<()> {
        let Some(pinned) = self.current.take() else {
            return Ok(());
        };
        if self.num_items == 0 {
            return Ok(());
        }
        pinned.write(0, &self.buffer)?;
        let meta = BlockMeta::new(0, self.buffer.len(), 0, self.num_items);
        self.buffer.clear();
        self.num_items = 0;
        self.sink
            .append_block(Block::new(pinned.into_byte_block(), meta))
    }
}

impl<T: Serialize, S: BlockSink> BlockWriter<T, S> {
    /// Appends one record.
    pub fn put(&mut self, item: &T) -> Result<()> {
        if self.closed {
            return Err(FerryError::Internal(
                "put on a closed block writer".to_string(),
            ));
        }
        let encoded = bincode::serialize(item)?;
        let fits = self
            .current
            .as_ref()
            .is_some_and(|b| self.buffer.len() + encoded.len() <= b.size());
        if !fits {
            self.finish_block()?;
            let size = self.block_size.max(encoded.len());
            self.current = Some(self.pool.allocate_byte_block(size, self.requester)?);
        }
        self.buffer.extend_from_slice(&encoded);
        self.num_items += 1;
        self.items_written += 1;
        Ok(())
    }

    /// Appends all records from an iterator.
    pub fn put_all<'a>(&mut self, items: impl IntoIterator<Item = &'a T>) -> Result<()>
    where
        T: 'a,
    {
        items.into_iter().try_for_each(|item| self.put(item))
    }
}

impl<T, S: BlockSink> Drop for BlockWriter<T, S> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(e) = self.close() {
            warn!("Failed to close block writer on drop: {e}");
        }
    }
}
