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

//! Channels: job-wide all-to-all record streams.
//!
//! Each worker holds one [`ChannelState`] per channel id, the queue of
//! blocks addressed to it. Senders write through an [`Emitter`] per
//! destination; the worker reads the merged stream through a
//! [`ChannelReader`].

use std::collections::VecDeque;
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::{Condvar, Mutex};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::data::block::Block;
use crate::data::block_reader::{BlockReader, BlockSource};
use crate::data::block_writer::{BlockSink, BlockWriter};
use crate::data::multiplexer::MuxInner;
use crate::error::{FerryError, Result};

/// Job-wide channel identifier.
pub type ChannelId = u64;

struct ChannelQueue {
    blocks: VecDeque<Block>,
    closed: Vec<bool>,
    num_closed: usize,
    // senders whose connection ended
    lost: Vec<bool>,
}

impl ChannelQueue {
    /// First sender whose connection ended before it closed its edge.
    fn lost_open_edge(&self) -> Option<usize> {
        self.closed
            .iter()
            .zip(&self.lost)
            .position(|(closed, lost)| *lost && !*closed)
    }
}

/// Receive side of one channel on one worker.
pub(crate) struct ChannelState {
    id: ChannelId,
    queue: Mutex<ChannelQueue>,
    changed: Condvar,
}

impl ChannelState {
    pub(crate) fn new(id: ChannelId, num_senders: usize) -> Self {
        Self {
            id,
            queue: Mutex::new(ChannelQueue {
                blocks: VecDeque::new(),
                closed: vec![false; num_senders],
                num_closed: 0,
                lost: vec![false; num_senders],
            }),
            changed: Condvar::new(),
        }
    }

    pub(crate) fn push(&self, block: Block) {
        self.queue.lock().blocks.push_back(block);
        self.changed.notify_all();
    }

    /// Marks the edge from `sender` closed.
    pub(crate) fn close_sender(&self, sender: usize, receiver: usize) -> Result<()> {
        let mut queue = self.queue.lock();
        match queue.closed.get_mut(sender) {
            Some(closed) if !*closed => *closed = true,
            Some(_) => {
                return Err(FerryError::ChannelProtocolViolation(
                    self.id,
                    sender,
                    receiver,
                    "duplicate close".to_string(),
                ))
            }
            None => {
                return Err(FerryError::ChannelProtocolViolation(
                    self.id,
                    sender,
                    receiver,
                    "close from unknown sender".to_string(),
                ))
            }
        }
        queue.num_closed += 1;
        if queue.num_closed == queue.closed.len() {
            debug!("Channel {} closed by all {} senders", self.id, queue.num_closed);
        }
        drop(queue);
        self.changed.notify_all();
        Ok(())
    }

    /// Marks the connection to `sender` as ended. Readers fail once they
    /// drained what arrived if the sender's edge is still open.
    pub(crate) fn sender_lost(&self, sender: usize) {
        let mut queue = self.queue.lock();
        match queue.lost.get_mut(sender) {
            Some(lost) => *lost = true,
            None => return,
        }
        if !queue.closed[sender] {
            warn!(
                "Channel {}: connection to sender {sender} ended before it closed",
                self.id
            );
        }
        drop(queue);
        self.changed.notify_all();
    }

    fn try_pop(&self) -> Result<Option<Block>> {
        let mut queue = self.queue.lock();
        if let Some(block) = queue.blocks.pop_front() {
            return Ok(Some(block));
        }
        match queue.lost_open_edge() {
            Some(_) => Err(FerryError::Cancelled),
            None => Ok(None),
        }
    }

    /// Waits for the next block. `None` once every sender closed and the
    /// queue is drained, [`FerryError::Cancelled`] once drained while the
    /// connection to a sender with an open edge is gone.
    fn pop_wait(&self) -> Result<Option<Block>> {
        let mut queue = self.queue.lock();
        loop {
            if let Some(block) = queue.blocks.pop_front() {
                return Ok(Some(block));
            }
            if queue.num_closed == queue.closed.len() {
                return Ok(None);
            }
            if queue.lost_open_edge().is_some() {
                return Err(FerryError::Cancelled);
            }
            self.changed.wait(&mut queue);
        }
    }

    fn is_closed(&self) -> bool {
        let queue = self.queue.lock();
        queue.num_closed == queue.closed.len()
    }
}

/// Block source draining a channel's receive queue.
pub struct ChannelSource {
    state: Arc<ChannelState>,
}

impl BlockSource for ChannelSource {
    fn try_next_block(&mut self) -> Result<Option<Block>> {
        self.state.try_pop()
    }

    fn next_block(&mut self) -> Result<Option<Block>> {
        self.state.pop_wait()
    }
}

/// Merged stream of every record sent to this worker on one channel.
///
/// Records of one sender arrive in send order; records of different
/// senders may interleave.
pub struct ChannelReader<T> {
    id: ChannelId,
    state: Arc<ChannelState>,
    reader: BlockReader<T, ChannelSource>,
}

impl<T: DeserializeOwned> ChannelReader<T> {
    pub(crate) fn new(id: ChannelId, state: Arc<ChannelState>, requester: usize) -> Self {
        let source = ChannelSource {
            state: Arc::clone(&state),
        };
        Self {
            id,
            state,
            reader: BlockReader::new(source, requester),
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// True if flushed, unconsumed records are available. Never blocks.
    pub fn has_next(&mut self) -> Result<bool> {
        self.reader.has_next()
    }

    /// Next record, blocking until one arrives. `None` once every sender
    /// closed and everything was read.
    ///
    /// Fails with [`FerryError::Cancelled`] instead of waiting once the
    /// connection to a sender that has not closed its edge is gone.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Result<Option<T>> {
        self.reader.next_item()
    }

    /// True once every sender closed its edge to this worker.
    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    /// Reads until every sender closed.
    pub fn read_all(&mut self) -> Result<Vec<T>> {
        self.reader.read_all()
    }
}

/// Hands flushed blocks of one edge to the multiplexer.
pub struct ChannelSink {
    mux: Arc<MuxInner>,
    channel: ChannelId,
    receiver: usize,
    pending: Vec<Block>,
}

impl BlockSink for ChannelSink {
    fn append_block(&mut self, block: Block) -> Result<()> {
        self.pending.push(block);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        let blocks = std::mem::take(&mut self.pending);
        self.mux.deliver(self.channel, self.receiver, blocks)
    }

    fn close(&mut self) -> Result<()> {
        self.flush()?;
        self.mux.close_edge(self.channel, self.receiver)
    }
}

/// Sends records of one channel from this worker to one destination worker.
///
/// `emit` buffers into pool blocks, `flush` returns once the destination
/// can read everything emitted so far. Dropping an emitter that was not
/// closed closes it.
pub struct Emitter<T> {
    channel: ChannelId,
    sender: usize,
    receiver: usize,
    writer: BlockWriter<T, ChannelSink>,
}

impl<T: Serialize> Emitter<T> {
    pub(crate) fn new(mux: &Arc<MuxInner>, channel: ChannelId, receiver: usize) -> Self {
        let sink = ChannelSink {
            mux: Arc::clone(mux),
            channel,
            receiver,
            pending: Vec::new(),
        };
        Self {
            channel,
            sender: mux.my_rank(),
            receiver,
            writer: BlockWriter::new(mux.pool().clone(), mux.my_rank(), sink),
        }
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    pub fn receiver(&self) -> usize {
        self.receiver
    }

    pub fn emit(&mut self, item: &T) -> Result<()> {
        if self.writer.is_closed() {
            return Err(self.violation("send after close"));
        }
        self.writer.put(item)
    }

    /// Delivers buffered records. A no-op on a closed emitter.
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()
    }

    /// Flushes and closes the edge to the receiver.
    pub fn close(&mut self) -> Result<()> {
        if self.writer.is_closed() {
            return Err(self.violation("duplicate close"));
        }
        self.writer.close()
    }

    pub fn is_closed(&self) -> bool {
        self.writer.is_closed()
    }

    fn violation(&self, desc: &str) -> FerryError {
        FerryError::ChannelProtocolViolation(
            self.channel,
            self.sender,
            self.receiver,
            desc.to_string(),
        )
    }
}
