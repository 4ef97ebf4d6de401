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

//! Routes channel blocks between the workers of a job.
//!
//! For every peer the multiplexer runs a send task draining an outgoing
//! frame queue and a receive task dispatching incoming frames. Data and
//! close frames are acknowledged once the receiver has queued them, which
//! makes `flush` and `close` on an emitter synchronous with respect to the
//! remote reader. Sends to the worker itself bypass the transport.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use dashmap::DashMap;
use futures::channel::oneshot;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::data::block::{Block, BlockMeta};
use crate::data::block_pool::BlockPool;
use crate::data::channel::{ChannelId, ChannelReader, ChannelState, Emitter};
use crate::error::{FerryError, Result};
use crate::net::frame::{read_frame, write_frame, FrameHeader, FrameKind};
use crate::net::group::{Group, Transport};

struct OutgoingFrame {
    header: FrameHeader,
    payload: Bytes,
}

struct AckTable {
    open: bool,
    waiting: HashMap<u64, oneshot::Sender<()>>,
}

struct Peer {
    rank: usize,
    outgoing: Mutex<Option<mpsc::UnboundedSender<OutgoingFrame>>>,
    acks: Mutex<AckTable>,
    lost: AtomicBool,
    // receive task; the send task ends once the outgoing queue is dropped and drained
    receive_task: Mutex<Option<JoinHandle<()>>>,
}

impl Peer {
    /// Queues a frame and returns the receiver of its acknowledgement.
    fn send(&self, header: FrameHeader, payload: Bytes) -> Result<oneshot::Receiver<()>> {
        let (tx, rx) = oneshot::channel();
        {
            let mut acks = self.acks.lock();
            if !acks.open {
                return Err(FerryError::Cancelled);
            }
            acks.waiting.insert(header.seq, tx);
        }
        if !self.post(header, payload) {
            self.acks.lock().waiting.remove(&header.seq);
            return Err(FerryError::Cancelled);
        }
        Ok(rx)
    }

    /// Queues a frame that expects no acknowledgement.
    fn post(&self, header: FrameHeader, payload: Bytes) -> bool {
        self.outgoing
            .lock()
            .as_ref()
            .is_some_and(|tx| tx.send(OutgoingFrame { header, payload }).is_ok())
    }

    fn acknowledge(&self, seq: u64) {
        match self.acks.lock().waiting.remove(&seq) {
            Some(tx) => {
                let _ = tx.send(());
            }
            None => warn!("Unexpected ack {seq} from worker {}", self.rank),
        }
    }

    /// Stops sending to the peer and fails every pending acknowledgement.
    fn disconnect(&self) {
        let waiting = {
            let mut acks = self.acks.lock();
            acks.open = false;
            std::mem::take(&mut acks.waiting)
        };
        if !waiting.is_empty() {
            warn!(
                "Connection to worker {} closed with {} unacknowledged frames",
                self.rank,
                waiting.len()
            );
        }
        // dropping the senders cancels the waiting receivers
        drop(waiting);
        self.outgoing.lock().take();
    }
}

pub(crate) struct MuxInner {
    my_rank: usize,
    num_workers: usize,
    pool: BlockPool,
    channels: DashMap<ChannelId, Arc<ChannelState>>,
    next_channel: AtomicU64,
    next_seq: AtomicU64,
    peers: Vec<Option<Peer>>,
    closed: AtomicBool,
}

impl MuxInner {
    pub(crate) fn my_rank(&self) -> usize {
        self.my_rank
    }

    pub(crate) fn pool(&self) -> &BlockPool {
        &self.pool
    }

    fn channel(&self, id: ChannelId) -> Arc<ChannelState> {
        Arc::clone(
            self.channels
                .entry(id)
                .or_insert_with(|| {
                    let state = ChannelState::new(id, self.num_workers);
                    for peer in self.peers.iter().flatten() {
                        if peer.lost.load(Ordering::SeqCst) {
                            state.sender_lost(peer.rank);
                        }
                    }
                    Arc::new(state)
                })
                .value(),
        )
    }

    /// Tears down the connection to `rank`: pending acknowledgements fail
    /// and readers stop waiting for records from it.
    fn lose_peer(&self, rank: usize) {
        let Ok(peer) = self.peer(rank) else {
            return;
        };
        if !peer.lost.swap(true, Ordering::SeqCst) {
            for channel in self.channels.iter() {
                channel.value().sender_lost(rank);
            }
        }
        peer.disconnect();
    }

    fn peer(&self, rank: usize) -> Result<&Peer> {
        self.peers
            .get(rank)
            .and_then(|p| p.as_ref())
            .ok_or_else(|| FerryError::Internal(format!("No connection to worker {rank}")))
    }

    fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Makes `blocks` visible to `receiver`, waiting for its acknowledgement.
    pub(crate) fn deliver(
        &self,
        channel: ChannelId,
        receiver: usize,
        blocks: Vec<Block>,
    ) -> Result<()> {
        if blocks.is_empty() {
            return Ok(());
        }
        if receiver == self.my_rank {
            let state = self.channel(channel);
            blocks.into_iter().for_each(|block| state.push(block));
            return Ok(());
        }
        let peer = self.peer(receiver)?;
        let mut acks = Vec::with_capacity(blocks.len());
        for block in blocks {
            let pinned = block.pin_wait(self.my_rank)?;
            let payload = pinned.data();
            let header = FrameHeader::data(
                channel,
                self.my_rank as u32,
                self.next_seq(),
                payload.len(),
                block.num_items(),
            );
            acks.push(peer.send(header, payload)?);
        }
        for ack in acks {
            futures::executor::block_on(ack)?;
        }
        Ok(())
    }

    /// Closes the edge from this worker to `receiver`.
    pub(crate) fn close_edge(&self, channel: ChannelId, receiver: usize) -> Result<()> {
        if receiver == self.my_rank {
            return self.channel(channel).close_sender(self.my_rank, receiver);
        }
        let header = FrameHeader::close(channel, self.my_rank as u32, self.next_seq());
        let ack = self.peer(receiver)?.send(header, Bytes::new())?;
        futures::executor::block_on(ack)?;
        Ok(())
    }

    fn dispatch(&self, peer: &Peer, header: FrameHeader, payload: Bytes) -> Result<()> {
        match header.kind {
            FrameKind::Data => {
                let block = tokio::task::block_in_place(|| {
                    let pinned = self.pool.allocate_byte_block(payload.len(), self.my_rank)?;
                    pinned.write(0, &payload)?;
                    let meta =
                        BlockMeta::new(0, payload.len(), 0, header.num_items as usize).with_sender();
                    Ok::<_, FerryError>(Block::new(pinned.into_byte_block(), meta))
                })?;
                self.channel(header.channel).push(block);
                peer.post(FrameHeader::ack(&header, self.my_rank as u32), Bytes::new());
            }
            FrameKind::Close => {
                if let Err(e) = self
                    .channel(header.channel)
                    .close_sender(header.sender as usize, self.my_rank)
                {
                    warn!("{e}");
                }
                peer.post(FrameHeader::ack(&header, self.my_rank as u32), Bytes::new());
            }
            FrameKind::Ack => peer.acknowledge(header.seq),
        }
        Ok(())
    }

    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for peer in self.peers.iter().flatten() {
            self.lose_peer(peer.rank);
            if let Some(task) = peer.receive_task.lock().take() {
                task.abort();
            }
        }
        info!("Multiplexer of worker {} closed", self.my_rank);
    }
}

impl Drop for MuxInner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn send_loop(
    peer: usize,
    mut outgoing: mpsc::UnboundedReceiver<OutgoingFrame>,
    mut writer: WriteHalf<Box<dyn Transport>>,
) {
    while let Some(frame) = outgoing.recv().await {
        if let Err(e) = write_frame(&mut writer, &frame.header, &frame.payload).await {
            error!("Failed to send frame to worker {peer}: {e}");
            break;
        }
    }
    if let Err(e) = writer.shutdown().await {
        debug!("Failed to shut down connection to worker {peer}: {e}");
    }
}

async fn receive_loop(
    mux: Weak<MuxInner>,
    peer: usize,
    mut reader: ReadHalf<Box<dyn Transport>>,
) {
    loop {
        let (header, payload) = match read_frame(&mut reader).await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                debug!("Connection from worker {peer} ended");
                break;
            }
            Err(e) => {
                error!("Failed to receive frame from worker {peer}: {e}");
                break;
            }
        };
        let Some(mux) = mux.upgrade() else {
            return;
        };
        let Ok(connection) = mux.peer(peer) else {
            return;
        };
        if let Err(e) = mux.dispatch(connection, header, payload) {
            error!("Failed to dispatch frame from worker {peer}: {e}");
            mux.lose_peer(peer);
            return;
        }
    }
    if let Some(mux) = mux.upgrade() {
        mux.lose_peer(peer);
    }
}

/// Channel multiplexer of one worker.
///
/// Channel ids come from a local counter: every worker must allocate its
/// channels in the same order for the ids to match across the job.
pub struct Multiplexer {
    inner: Arc<MuxInner>,
}

impl Multiplexer {
    /// Starts the connection tasks of `group` on the pool's dispatcher.
    pub fn new(pool: BlockPool, group: Group) -> Self {
        let my_rank = group.my_rank();
        let num_workers = group.num_workers();
        let dispatcher = pool.dispatcher().clone();

        let mut peers = Vec::with_capacity(num_workers);
        let mut streams = Vec::new();
        for connection in group.into_connections() {
            match connection {
                Some(connection) => {
                    let rank = connection.peer();
                    let (tx, rx) = mpsc::unbounded_channel();
                    let (reader, writer) = tokio::io::split(connection.into_stream());
                    streams.push((rank, rx, reader, writer));
                    peers.push(Some(Peer {
                        rank,
                        outgoing: Mutex::new(Some(tx)),
                        acks: Mutex::new(AckTable {
                            open: true,
                            waiting: HashMap::new(),
                        }),
                        lost: AtomicBool::new(false),
                        receive_task: Mutex::new(None),
                    }));
                }
                None => peers.push(None),
            }
        }

        let inner = Arc::new(MuxInner {
            my_rank,
            num_workers,
            pool,
            channels: DashMap::new(),
            next_channel: AtomicU64::new(0),
            next_seq: AtomicU64::new(1),
            peers,
            closed: AtomicBool::new(false),
        });

        for (rank, rx, reader, writer) in streams {
            dispatcher.spawn(send_loop(rank, rx, writer));
            let receive = dispatcher.spawn(receive_loop(Arc::downgrade(&inner), rank, reader));
            if let Some(Some(peer)) = inner.peers.get(rank) {
                *peer.receive_task.lock() = Some(receive);
            }
        }
        info!("Multiplexer of worker {my_rank} started with {num_workers} workers");
        Self { inner }
    }

    pub fn my_rank(&self) -> usize {
        self.inner.my_rank
    }

    pub fn num_workers(&self) -> usize {
        self.inner.num_workers
    }

    pub fn pool(&self) -> &BlockPool {
        &self.inner.pool
    }

    /// Allocates the next channel id. Collective by convention.
    pub fn allocate_channel(&self) -> ChannelId {
        self.inner.next_channel.fetch_add(1, Ordering::SeqCst)
    }

    /// One emitter per destination worker, indexed by worker id.
    pub fn open_emitters<T: Serialize>(&self, channel: ChannelId) -> Vec<Emitter<T>> {
        (0..self.inner.num_workers)
            .map(|receiver| Emitter::new(&self.inner, channel, receiver))
            .collect()
    }

    /// Reader over every record sent to this worker on `channel`.
    pub fn reader<T: DeserializeOwned>(&self, channel: ChannelId) -> ChannelReader<T> {
        ChannelReader::new(channel, self.inner.channel(channel), self.inner.my_rank)
    }

    /// Stops the connection tasks. Waiting flushes and closes fail with
    /// [`FerryError::Cancelled`].
    pub fn close(&self) {
        self.inner.shutdown();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("my_rank", &self.inner.my_rank)
            .field("num_workers", &self.inner.num_workers)
            .field("channels", &self.inner.channels.len())
            .finish()
    }
}
