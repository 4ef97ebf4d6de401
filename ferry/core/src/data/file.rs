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

//! Files: ordered lists of blocks in the block pool.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::data::block::Block;
use crate::data::block_pool::{BlockPool, RequesterId};
use crate::data::block_reader::{BlockReader, BlockSource};
use crate::data::block_writer::{BlockSink, BlockWriter};
use crate::error::Result;

/// Writer appending to a [`File`].
pub type FileWriter<T> = BlockWriter<T, FileSink>;

/// Reader over the blocks of a [`File`].
pub type FileReader<T> = BlockReader<T, FileSource>;

#[derive(Default)]
struct FileInner {
    blocks: VecDeque<Block>,
    num_items: usize,
    size_bytes: usize,
}

/// An ordered, shareable list of unpinned blocks. Cloning shares the contents.
#[derive(Clone)]
pub struct File {
    pool: BlockPool,
    inner: Arc<Mutex<FileInner>>,
}

impl File {
    pub fn new(pool: BlockPool) -> Self {
        Self {
            pool,
            inner: Arc::new(Mutex::new(FileInner::default())),
        }
    }

    pub fn pool(&self) -> &BlockPool {
        &self.pool
    }

    pub fn append_block(&self, block: Block) {
        let mut inner = self.inner.lock();
        inner.num_items += block.num_items();
        inner.size_bytes += block.size();
        inner.blocks.push_back(block);
    }

    pub fn num_blocks(&self) -> usize {
        self.inner.lock().blocks.len()
    }

    pub fn num_items(&self) -> usize {
        self.inner.lock().num_items
    }

    /// Bytes covered by the block views.
    pub fn size_bytes(&self) -> usize {
        self.inner.lock().size_bytes
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().blocks.is_empty()
    }

    pub fn blocks(&self) -> Vec<Block> {
        self.inner.lock().blocks.iter().cloned().collect()
    }

    /// Drops every block of the file.
    pub fn clear(&self) {
        let blocks = std::mem::take(&mut *self.inner.lock());
        drop(blocks);
    }

    pub fn writer<T: Serialize>(&self, requester: RequesterId) -> FileWriter<T> {
        BlockWriter::new(self.pool.clone(), requester, FileSink { file: self.clone() })
    }

    /// Reader over the file. A consuming reader removes each block from the
    /// file once it has been handed out.
    pub fn reader<T: DeserializeOwned>(
        &self,
        requester: RequesterId,
        consume: bool,
    ) -> FileReader<T> {
        BlockReader::new(
            FileSource {
                file: self.clone(),
                next: 0,
                consume,
            },
            requester,
        )
    }

    /// Reads every record without consuming the file.
    pub fn read_all<T: DeserializeOwned>(&self, requester: RequesterId) -> Result<Vec<T>> {
        self.reader(requester, false).read_all()
    }

    fn take_front(&self) -> Option<Block> {
        let mut inner = self.inner.lock();
        let block = inner.blocks.pop_front()?;
        inner.num_items -= block.num_items();
        inner.size_bytes -= block.size();
        Some(block)
    }
}

impl std::fmt::Debug for File {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("File")
            .field("num_blocks", &self.num_blocks())
            .field("num_items", &self.num_items())
            .field("size_bytes", &self.size_bytes())
            .finish()
    }
}

/// Sink appending finished blocks to a [`File`].
pub struct FileSink {
    file: File,
}

impl FileSink {
    pub fn file(&self) -> &File {
        &self.file
    }
}

impl BlockSink for FileSink {
    fn append_block(&mut self, block: Block) -> Result<()> {
        self.file.append_block(block);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Source handing out the blocks of a [`File`] in order.
pub struct FileSource {
    file: File,
    next: usize,
    consume: bool,
}

impl BlockSource for FileSource {
    fn try_next_block(&mut self) -> Result<Option<Block>> {
        self.next_block()
    }

    fn next_block(&mut self) -> Result<Option<Block>> {
        if self.consume {
            return Ok(self.file.take_front());
        }
        let block = self.file.inner.lock().blocks.get(self.next).cloned();
        if block.is_some() {
            self.next += 1;
        }
        Ok(block)
    }
}
