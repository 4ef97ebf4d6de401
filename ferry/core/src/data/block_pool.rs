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

//! Block pool: reference-counted, pinnable byte blocks under a memory ceiling.
//!
//! Every byte block lives in an arena inside the pool, addressed by its
//! [`BlockId`]. Handles ([`ByteBlockRef`], [`PinnedByteBlock`]) adjust the
//! reference and pin counts of their block on clone and drop. All counters,
//! pin maps and residency transitions sit under a single lock, so each
//! allocate/pin/unpin/evict step is atomic with respect to the counters.
//!
//! Each block is in exactly one of four states: resident and pinned,
//! resident and unpinned, writing (eviction write-back in flight, bytes
//! still in memory) or swapped (bytes only in external storage). When an
//! allocation would exceed the ceiling, unpinned blocks are evicted
//! oldest-unpinned-first.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use bytes::Bytes;
use log::{debug, error, warn};
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::config::FerryConfig;
use crate::data::block::{BlockMeta, PinnedBlock};
use crate::data::pin_request::{PinRequest, PinSlot};
use crate::data::storage::{DiskStorage, ExternalStorage, InMemoryStorage};
use crate::data::Block;
use crate::dispatcher::Dispatcher;
use crate::error::{FerryError, Result};

/// Unique id of a byte block within its pool.
pub type BlockId = u64;

/// Identifies who holds a pin, typically the local worker id.
pub type RequesterId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Residency {
    Resident,
    Writing,
    Swapped,
}

struct PendingPin {
    requester: RequesterId,
    meta: BlockMeta,
    slot: Arc<PinSlot>,
}

struct ByteBlockEntry {
    size: usize,
    ref_count: usize,
    pins: HashMap<RequesterId, usize>,
    total_pins: usize,
    residency: Residency,
    data: Option<Bytes>,
    // position in the eviction queue while resident and unpinned
    unpinned_seq: Option<u64>,
    // at most one write-back per block at a time
    write_in_flight: bool,
    has_external_copy: bool,
    reading: bool,
    pending_pins: Vec<PendingPin>,
}

/// Snapshot of the pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockPoolStats {
    pub total_blocks: usize,
    pub total_bytes: usize,
    pub pinned_blocks: usize,
    pub unpinned_blocks: usize,
    pub writing_blocks: usize,
    pub swapped_blocks: usize,
    /// Bytes of resident and writing blocks plus reservations for reads in flight.
    pub mem_used: usize,
    pub writing_bytes: usize,
    pub evictions: u64,
    pub reads: u64,
    pub failed_writes: u64,
}

#[derive(Default)]
struct PoolState {
    blocks: HashMap<BlockId, ByteBlockEntry>,
    next_block_id: BlockId,
    next_unpin_seq: u64,
    // eviction order: oldest unpinned first
    unpinned: BTreeMap<u64, BlockId>,
    stats: BlockPoolStats,
}

impl PoolState {
    fn entry_mut(&mut self, id: BlockId) -> Result<&mut ByteBlockEntry> {
        self.blocks
            .get_mut(&id)
            .ok_or_else(|| FerryError::Internal(format!("Unknown byte block {id}")))
    }

    fn push_unpinned(&mut self, id: BlockId) {
        let seq = self.next_unpin_seq;
        self.next_unpin_seq += 1;
        if let Some(entry) = self.blocks.get_mut(&id) {
            entry.unpinned_seq = Some(seq);
            self.unpinned.insert(seq, id);
        }
    }

    fn retain(&mut self, id: BlockId) {
        if let Some(entry) = self.blocks.get_mut(&id) {
            entry.ref_count += 1;
        }
    }

    /// Adds one pin (and one reference for the new handle) to a resident block.
    fn pin_resident(&mut self, id: BlockId, requester: RequesterId) -> Result<()> {
        let entry = self.entry_mut(id)?;
        debug_assert_eq!(Residency::Resident, entry.residency);
        let was_unpinned = entry.total_pins == 0;
        let seq = if was_unpinned {
            entry.unpinned_seq.take()
        } else {
            None
        };
        *entry.pins.entry(requester).or_insert(0) += 1;
        entry.total_pins += 1;
        entry.ref_count += 1;
        if let Some(seq) = seq {
            self.unpinned.remove(&seq);
        }
        if was_unpinned {
            self.stats.unpinned_blocks -= 1;
            self.stats.pinned_blocks += 1;
        }
        Ok(())
    }

    fn unpin(&mut self, id: BlockId, requester: RequesterId) {
        let Some(entry) = self.blocks.get_mut(&id) else {
            return;
        };
        match entry.pins.get_mut(&requester) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                entry.pins.remove(&requester);
            }
            None => {
                warn!("Unpin of block {id} by requester {requester} without a pin");
                return;
            }
        }
        entry.total_pins -= 1;
        if entry.total_pins == 0 {
            self.stats.pinned_blocks -= 1;
            self.stats.unpinned_blocks += 1;
            self.push_unpinned(id);
        }
    }

    /// Drops one reference. Returns true if the block was destroyed and its
    /// external copy has to be removed now.
    fn release(&mut self, id: BlockId) -> bool {
        let Some(entry) = self.blocks.get_mut(&id) else {
            return false;
        };
        entry.ref_count -= 1;
        if entry.ref_count > 0 {
            return false;
        }
        let Some(entry) = self.blocks.remove(&id) else {
            return false;
        };
        self.stats.total_blocks -= 1;
        self.stats.total_bytes -= entry.size;
        match entry.residency {
            Residency::Resident => {
                // no handle left means no pin left
                if let Some(seq) = entry.unpinned_seq {
                    self.unpinned.remove(&seq);
                }
                self.stats.unpinned_blocks -= 1;
                self.stats.mem_used -= entry.size;
            }
            Residency::Writing => {
                self.stats.writing_blocks -= 1;
                self.stats.writing_bytes -= entry.size;
                self.stats.mem_used -= entry.size;
            }
            Residency::Swapped => {
                self.stats.swapped_blocks -= 1;
            }
        }
        // an in-flight write-back removes its own copy on completion
        !entry.write_in_flight && entry.has_external_copy
    }

    fn oldest_evictable(&self) -> Option<BlockId> {
        self.unpinned
            .values()
            .copied()
            .find(|id| self.blocks.get(id).is_some_and(|e| !e.write_in_flight))
    }

    fn evictable_bytes(&self) -> usize {
        self.unpinned
            .values()
            .filter_map(|id| self.blocks.get(id))
            .filter(|e| !e.write_in_flight)
            .map(|e| e.size)
            .sum()
    }
}

pub(crate) struct PoolInner {
    state: Mutex<PoolState>,
    memory_released: Condvar,
    storage: Arc<dyn ExternalStorage>,
    memory_limit: Option<usize>,
    block_size: usize,
    dispatcher: Dispatcher,
}

impl PoolInner {
    fn with_state<R>(&self, f: impl FnOnce(&PoolState) -> R) -> R {
        f(&self.state.lock())
    }

    /// Accounts `size` bytes against the ceiling, evicting unpinned blocks
    /// and waiting for their write-back when needed.
    fn reserve_memory(
        self: &Arc<Self>,
        state: &mut MutexGuard<'_, PoolState>,
        size: usize,
    ) -> Result<()> {
        let Some(limit) = self.memory_limit else {
            state.stats.mem_used += size;
            return Ok(());
        };
        if size > limit {
            return Err(FerryError::OutOfMemory(
                size,
                format!("request exceeds the pool limit of {limit} bytes"),
            ));
        }
        let failed_writes = state.stats.failed_writes;
        loop {
            if state.stats.mem_used + size <= limit {
                state.stats.mem_used += size;
                return Ok(());
            }
            let needed = state.stats.mem_used + size - limit;
            if state.stats.writing_bytes + state.evictable_bytes() < needed {
                return Err(FerryError::OutOfMemory(
                    size,
                    format!(
                        "{} bytes in use, {} bytes evictable, limit {limit} bytes",
                        state.stats.mem_used,
                        state.stats.writing_bytes + state.evictable_bytes()
                    ),
                ));
            }
            while state.stats.writing_bytes < needed {
                match state.oldest_evictable() {
                    Some(id) => {
                        self.start_eviction(state, id);
                    }
                    None => break,
                }
            }
            if state.stats.failed_writes != failed_writes {
                return Err(FerryError::OutOfMemory(
                    size,
                    "eviction write-back failed".to_string(),
                ));
            }
            self.memory_released.wait(state);
        }
    }

    fn release_memory(&self, state: &mut PoolState, size: usize) {
        state.stats.mem_used -= size;
        self.memory_released.notify_all();
    }

    /// Moves a resident unpinned block into the writing state and spawns
    /// its write-back. Returns false if the block is not evictable.
    fn start_eviction(self: &Arc<Self>, state: &mut PoolState, id: BlockId) -> bool {
        let Some(entry) = state.blocks.get_mut(&id) else {
            return false;
        };
        if entry.residency != Residency::Resident
            || entry.total_pins > 0
            || entry.write_in_flight
        {
            return false;
        }
        let Some(data) = entry.data.clone() else {
            return false;
        };
        entry.residency = Residency::Writing;
        entry.write_in_flight = true;
        let size = entry.size;
        if let Some(seq) = entry.unpinned_seq.take() {
            state.unpinned.remove(&seq);
        }
        state.stats.unpinned_blocks -= 1;
        state.stats.writing_blocks += 1;
        state.stats.writing_bytes += size;
        state.stats.evictions += 1;
        debug!("Evicting block {id} ({size} bytes)");

        let pool = Arc::downgrade(self);
        let storage = Arc::clone(&self.storage);
        self.dispatcher.spawn(async move {
            let result = storage.write_out(id, data).await;
            let remove = match pool.upgrade() {
                Some(pool) => pool.finish_write(id, result),
                None => true,
            };
            if remove {
                if let Err(e) = storage.remove(id).await {
                    debug!("Failed to remove external copy of block {id}: {e}");
                }
            }
        });
        true
    }

    /// Completes a write-back. Returns true if the external copy is orphaned.
    fn finish_write(&self, id: BlockId, result: Result<()>) -> bool {
        let mut state = self.state.lock();
        let state = &mut *state;
        // every outcome changes what a waiting allocation can expect
        self.memory_released.notify_all();
        let Some(entry) = state.blocks.get_mut(&id) else {
            // destroyed while writing, counters were settled by release()
            return result.is_ok();
        };
        entry.write_in_flight = false;
        let size = entry.size;
        match (entry.residency, result) {
            (Residency::Writing, Ok(())) => {
                entry.residency = Residency::Swapped;
                entry.data = None;
                entry.has_external_copy = true;
                state.stats.writing_blocks -= 1;
                state.stats.swapped_blocks += 1;
                state.stats.writing_bytes -= size;
                debug!("Block {id} swapped out");
                self.release_memory(state, size);
                false
            }
            (Residency::Writing, Err(e)) => {
                error!("Failed to write back block {id}: {e}");
                entry.residency = Residency::Resident;
                state.stats.writing_blocks -= 1;
                state.stats.unpinned_blocks += 1;
                state.stats.writing_bytes -= size;
                state.stats.failed_writes += 1;
                state.push_unpinned(id);
                self.memory_released.notify_all();
                false
            }
            (_, Ok(())) => {
                // eviction was cancelled by a pin; the copy is overwritten by the next
                // eviction and removed with the block
                entry.has_external_copy = true;
                false
            }
            (_, Err(e)) => {
                debug!("Cancelled write-back of block {id} failed: {e}");
                false
            }
        }
    }

    fn pin(self: &Arc<Self>, block: &Block, requester: RequesterId) -> PinRequest {
        let id = block.byte_block().id();
        let meta = block.meta();
        let mut state = self.state.lock();
        let residency = match state.blocks.get(&id) {
            Some(entry) => entry.residency,
            None => {
                return PinRequest::failed(
                    block.clone(),
                    FerryError::Internal(format!("Unknown byte block {id}")),
                )
            }
        };
        match residency {
            Residency::Resident => {
                if let Err(e) = state.pin_resident(id, requester) {
                    return PinRequest::failed(block.clone(), e);
                }
                drop(state);
                let pinned = PinnedBlock::adopt(self, id, block.byte_block().size(), requester, meta);
                PinRequest::ready(block.clone(), pinned)
            }
            Residency::Writing => {
                // bytes are still in memory: cancel the eviction
                let entry = match state.entry_mut(id) {
                    Ok(entry) => entry,
                    Err(e) => return PinRequest::failed(block.clone(), e),
                };
                entry.residency = Residency::Resident;
                let size = entry.size;
                state.stats.writing_blocks -= 1;
                state.stats.writing_bytes -= size;
                state.stats.unpinned_blocks += 1;
                state.push_unpinned(id);
                debug!("Cancelled eviction of block {id} for requester {requester}");
                self.memory_released.notify_all();
                if let Err(e) = state.pin_resident(id, requester) {
                    return PinRequest::failed(block.clone(), e);
                }
                drop(state);
                let pinned = PinnedBlock::adopt(self, id, block.byte_block().size(), requester, meta);
                PinRequest::ready(block.clone(), pinned)
            }
            Residency::Swapped => {
                let slot = Arc::new(PinSlot::default());
                let start_read = {
                    let entry = match state.entry_mut(id) {
                        Ok(entry) => entry,
                        Err(e) => return PinRequest::failed(block.clone(), e),
                    };
                    entry.pending_pins.push(PendingPin {
                        requester,
                        meta,
                        slot: Arc::clone(&slot),
                    });
                    let start_read = !entry.reading;
                    entry.reading = true;
                    start_read
                };
                if start_read {
                    self.start_read(&mut state, id, block.byte_block().size());
                }
                PinRequest::pending(block.clone(), slot)
            }
        }
    }

    fn start_read(
        self: &Arc<Self>,
        state: &mut MutexGuard<'_, PoolState>,
        id: BlockId,
        size: usize,
    ) {
        if let Err(e) = self.reserve_memory(state, size) {
            warn!("Cannot reserve {size} bytes to read back block {id}: {e}");
            let pending = match state.blocks.get_mut(&id) {
                Some(entry) => {
                    entry.reading = false;
                    std::mem::take(&mut entry.pending_pins)
                }
                None => Vec::new(),
            };
            let failures = pending
                .into_iter()
                .map(|p| (p.slot, Err(e.clone_for_waiter())))
                .collect::<Vec<_>>();
            MutexGuard::unlocked(state, || {
                for (slot, result) in failures {
                    slot.complete(result);
                }
            });
            return;
        }
        // the read holds a reference so the entry outlives it
        state.retain(id);
        state.stats.reads += 1;
        let pool = Arc::downgrade(self);
        let storage = Arc::clone(&self.storage);
        debug!("Reading back block {id} ({size} bytes)");
        self.dispatcher.spawn(async move {
            let result = storage.read_in(id).await;
            if let Some(pool) = pool.upgrade() {
                pool.finish_read(id, result);
                pool.release(id);
            }
        });
    }

    fn finish_read(self: &Arc<Self>, id: BlockId, result: Result<Bytes>) {
        let mut completions = Vec::new();
        {
            let mut state = self.state.lock();
            let state = &mut *state;
            let Some(entry) = state.blocks.get_mut(&id) else {
                return;
            };
            entry.reading = false;
            let size = entry.size;
            let pending = std::mem::take(&mut entry.pending_pins);
            let result = result.and_then(|data| {
                if data.len() == size {
                    Ok(data)
                } else {
                    Err(FerryError::PinFailed(
                        id,
                        format!("read back {} bytes, expected {size}", data.len()),
                    ))
                }
            });
            match result {
                Ok(data) => {
                    entry.data = Some(data);
                    entry.residency = Residency::Resident;
                    state.stats.swapped_blocks -= 1;
                    state.stats.unpinned_blocks += 1;
                    state.push_unpinned(id);
                    for p in pending {
                        // infallible: the entry exists and is resident
                        if state.pin_resident(id, p.requester).is_ok() {
                            let pinned = PinnedBlock::adopt(self, id, size, p.requester, p.meta);
                            completions.push((p.slot, Ok(pinned)));
                        }
                    }
                    debug!("Block {id} swapped in");
                }
                Err(e) => {
                    error!("Failed to read back block {id}: {e}");
                    self.release_memory(state, size);
                    let e = match e {
                        FerryError::PinFailed(..) => e,
                        other => FerryError::PinFailed(id, other.to_string()),
                    };
                    for p in pending {
                        completions.push((p.slot, Err(e.clone_for_waiter())));
                    }
                }
            }
        }
        for (slot, result) in completions {
            slot.complete(result);
        }
    }

    fn unpin(&self, id: BlockId, requester: RequesterId) {
        self.state.lock().unpin(id, requester);
    }

    fn release(&self, id: BlockId) {
        let remove = self.state.lock().release(id);
        self.memory_released.notify_all();
        if remove {
            let storage = Arc::clone(&self.storage);
            self.dispatcher.spawn(async move {
                if let Err(e) = storage.remove(id).await {
                    debug!("Failed to remove external copy of block {id}: {e}");
                }
            });
        }
    }
}

/// Pool of byte blocks for one worker.
///
/// Created once per worker and shared by cloning. Every component that
/// allocates blocks (files, channel emitters and receivers, reduce stages)
/// receives the pool explicitly.
#[derive(Clone)]
pub struct BlockPool {
    inner: Arc<PoolInner>,
}

impl BlockPool {
    /// Creates a pool evicting into `storage`. `memory_limit` of `None`
    /// disables the ceiling and with it all evictions on allocation.
    pub fn new(
        dispatcher: Dispatcher,
        storage: Arc<dyn ExternalStorage>,
        memory_limit: Option<usize>,
        block_size: usize,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState::default()),
                memory_released: Condvar::new(),
                storage,
                memory_limit,
                block_size: block_size.max(1),
                dispatcher,
            }),
        }
    }

    /// Creates a pool evicting to a [`DiskStorage`] below the configured spill directory.
    pub fn try_from_config(dispatcher: Dispatcher, config: &FerryConfig) -> Result<Self> {
        let storage = DiskStorage::try_new(&config.spill_dir())?;
        Ok(Self::new(
            dispatcher,
            Arc::new(storage),
            config.pool_memory_limit(),
            config.block_size(),
        ))
    }

    /// Creates an unlimited pool over [`InMemoryStorage`] with default block size.
    pub fn in_memory(dispatcher: Dispatcher) -> Self {
        Self::new(
            dispatcher,
            Arc::new(InMemoryStorage::new()),
            None,
            FerryConfig::default().block_size(),
        )
    }

    /// Allocates a zero-filled byte block of `size` bytes, pinned once for `requester`.
    pub fn allocate_byte_block(
        &self,
        size: usize,
        requester: RequesterId,
    ) -> Result<PinnedByteBlock> {
        let id = {
            let mut state = self.inner.state.lock();
            if let Err(e) = self.inner.reserve_memory(&mut state, size) {
                warn!("Failed to allocate byte block of {size} bytes: {e}");
                return Err(e);
            }
            let id = state.next_block_id;
            state.next_block_id += 1;
            state.blocks.insert(
                id,
                ByteBlockEntry {
                    size,
                    ref_count: 1,
                    pins: HashMap::from([(requester, 1)]),
                    total_pins: 1,
                    residency: Residency::Resident,
                    data: Some(Bytes::from(vec![0u8; size])),
                    unpinned_seq: None,
                    write_in_flight: false,
                    has_external_copy: false,
                    reading: false,
                    pending_pins: Vec::new(),
                },
            );
            state.stats.total_blocks += 1;
            state.stats.total_bytes += size;
            state.stats.pinned_blocks += 1;
            id
        };
        Ok(PinnedByteBlock {
            byte_block: ByteBlockRef::adopt(&self.inner, id, size),
            requester,
        })
    }

    /// Starts evicting an unpinned, resident block. Returns false and does
    /// nothing if the block is pinned, already being written or swapped out.
    pub fn evict_block(&self, block: &ByteBlockRef) -> bool {
        let mut state = self.inner.state.lock();
        self.inner.start_eviction(&mut state, block.id())
    }

    /// Requests residency of `block` for `requester`.
    pub fn pin(&self, block: &Block, requester: RequesterId) -> PinRequest {
        self.inner.pin(block, requester)
    }

    /// Blocks until no eviction write-back is in flight.
    pub fn wait_for_writes(&self) {
        let mut state = self.inner.state.lock();
        while state.stats.writing_blocks > 0 {
            self.inner.memory_released.wait(&mut state);
        }
    }

    /// Default capacity of blocks allocated by block writers.
    pub fn block_size(&self) -> usize {
        self.inner.block_size
    }

    pub fn memory_limit(&self) -> Option<usize> {
        self.inner.memory_limit
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    pub fn stats(&self) -> BlockPoolStats {
        self.inner.with_state(|s| s.stats)
    }

    pub fn total_blocks(&self) -> usize {
        self.stats().total_blocks
    }

    pub fn total_bytes(&self) -> usize {
        self.stats().total_bytes
    }

    pub fn pinned_blocks(&self) -> usize {
        self.stats().pinned_blocks
    }

    pub fn unpinned_blocks(&self) -> usize {
        self.stats().unpinned_blocks
    }

    pub fn writing_blocks(&self) -> usize {
        self.stats().writing_blocks
    }

    pub fn swapped_blocks(&self) -> usize {
        self.stats().swapped_blocks
    }

    pub fn mem_used(&self) -> usize {
        self.stats().mem_used
    }
}

impl std::fmt::Debug for BlockPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockPool")
            .field("memory_limit", &self.inner.memory_limit)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Owning, reference-counting handle to a byte block. Does not keep the
/// block resident.
pub struct ByteBlockRef {
    id: BlockId,
    size: usize,
    pool: Arc<PoolInner>,
}

impl ByteBlockRef {
    /// Wraps a reference that was already counted under the pool lock.
    fn adopt(pool: &Arc<PoolInner>, id: BlockId, size: usize) -> Self {
        Self {
            id,
            size,
            pool: Arc::clone(pool),
        }
    }

    pub fn id(&self) -> BlockId {
        self.id
    }

    /// Capacity in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn pool(&self) -> BlockPool {
        BlockPool {
            inner: Arc::clone(&self.pool),
        }
    }

    /// Number of outstanding owning handles.
    pub fn reference_count(&self) -> usize {
        self.pool
            .with_state(|s| s.blocks.get(&self.id).map(|e| e.ref_count))
            .unwrap_or(0)
    }

    /// Pins held by one requester.
    pub fn pin_count(&self, requester: RequesterId) -> usize {
        self.pool
            .with_state(|s| {
                s.blocks
                    .get(&self.id)
                    .and_then(|e| e.pins.get(&requester).copied())
            })
            .unwrap_or(0)
    }

    /// Pins held by all requesters.
    pub fn total_pin_count(&self) -> usize {
        self.pool
            .with_state(|s| s.blocks.get(&self.id).map(|e| e.total_pins))
            .unwrap_or(0)
    }

    pub fn is_resident(&self) -> bool {
        self.pool.with_state(|s| {
            s.blocks
                .get(&self.id)
                .is_some_and(|e| e.residency != Residency::Swapped)
        })
    }

}

impl Clone for ByteBlockRef {
    fn clone(&self) -> Self {
        self.pool.state.lock().retain(self.id);
        Self::adopt(&self.pool, self.id, self.size)
    }
}

impl Drop for ByteBlockRef {
    fn drop(&mut self) {
        self.pool.release(self.id);
    }
}

impl std::fmt::Debug for ByteBlockRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteBlockRef")
            .field("id", &self.id)
            .field("size", &self.size)
            .finish()
    }
}

/// A byte block handle holding one pin for `requester`: the bytes stay
/// resident for the lifetime of the handle.
pub struct PinnedByteBlock {
    byte_block: ByteBlockRef,
    requester: RequesterId,
}

impl PinnedByteBlock {
    /// Wraps a pin and a reference that were already counted under the pool lock.
    pub(crate) fn adopt(
        pool: &Arc<PoolInner>,
        id: BlockId,
        size: usize,
        requester: RequesterId,
    ) -> Self {
        Self {
            byte_block: ByteBlockRef::adopt(pool, id, size),
            requester,
        }
    }

    pub fn byte_block(&self) -> &ByteBlockRef {
        &self.byte_block
    }

    pub fn requester(&self) -> RequesterId {
        self.requester
    }

    pub fn id(&self) -> BlockId {
        self.byte_block.id
    }

    pub fn size(&self) -> usize {
        self.byte_block.size
    }

    /// The resident bytes of the whole block.
    pub fn data(&self) -> Bytes {
        self.byte_block
            .pool
            .with_state(|s| s.blocks.get(&self.id()).and_then(|e| e.data.clone()))
            .unwrap_or_default()
    }

    /// Copies `src` into the block at `offset`.
    pub fn write(&self, offset: usize, src: &[u8]) -> Result<()> {
        let end = offset + src.len();
        if end > self.size() {
            return Err(FerryError::Internal(format!(
                "write of {} bytes at offset {offset} exceeds block {} of {} bytes",
                src.len(),
                self.id(),
                self.size()
            )));
        }
        let mut state = self.byte_block.pool.state.lock();
        let entry = state.entry_mut(self.id())?;
        let Some(data) = entry.data.take() else {
            return Err(FerryError::Internal(format!(
                "pinned block {} is not resident",
                self.id()
            )));
        };
        let mut data = data
            .try_into_mut()
            .unwrap_or_else(|shared| bytes::BytesMut::from(shared.as_ref()));
        data[offset..end].copy_from_slice(src);
        entry.data = Some(data.freeze());
        Ok(())
    }

    /// Releases the pin and keeps the reference.
    pub fn into_byte_block(self) -> ByteBlockRef {
        self.byte_block.clone()
    }
}

impl Clone for PinnedByteBlock {
    fn clone(&self) -> Self {
        let pool = &self.byte_block.pool;
        // the handle is pinned, so the block is resident
        if let Err(e) = pool.state.lock().pin_resident(self.id(), self.requester) {
            error!("Failed to pin clone of block {}: {e}", self.id());
        }
        Self::adopt(pool, self.id(), self.size(), self.requester)
    }
}

impl Drop for PinnedByteBlock {
    fn drop(&mut self) {
        self.byte_block.pool.unpin(self.byte_block.id, self.requester);
    }
}

impl std::fmt::Debug for PinnedByteBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinnedByteBlock")
            .field("id", &self.id())
            .field("size", &self.size())
            .field("requester", &self.requester)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio::sync::Semaphore;

    fn dispatcher() -> Result<Dispatcher> {
        Dispatcher::new("pool-test", 2)
    }

    fn meta(len: usize) -> BlockMeta {
        BlockMeta::new(0, len, 0, 1)
    }

    /// Storage whose writes wait for a permit.
    struct GatedStorage {
        gate: Semaphore,
        inner: InMemoryStorage,
    }

    #[async_trait]
    impl ExternalStorage for GatedStorage {
        async fn write_out(&self, block_id: BlockId, data: Bytes) -> Result<()> {
            let _permit = self
                .gate
                .acquire()
                .await
                .map_err(|_| FerryError::Cancelled)?;
            self.inner.write_out(block_id, data).await
        }

        async fn read_in(&self, block_id: BlockId) -> Result<Bytes> {
            self.inner.read_in(block_id).await
        }

        async fn remove(&self, block_id: BlockId) -> Result<()> {
            self.inner.remove(block_id).await
        }
    }

    struct FailingStorage;

    #[async_trait]
    impl ExternalStorage for FailingStorage {
        async fn write_out(&self, _block_id: BlockId, _data: Bytes) -> Result<()> {
            Err(FerryError::IoError(std::io::Error::other("disk full")))
        }

        async fn read_in(&self, block_id: BlockId) -> Result<Bytes> {
            Err(FerryError::PinFailed(block_id, "unreadable".to_string()))
        }

        async fn remove(&self, _block_id: BlockId) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn allocation_counters() -> Result<()> {
        let pool = BlockPool::in_memory(dispatcher()?);
        let a = pool.allocate_byte_block(8, 0)?;
        let b = pool.allocate_byte_block(2, 0)?;
        assert_eq!(2, pool.total_blocks());
        assert_eq!(10, pool.total_bytes());
        assert_eq!(2, pool.pinned_blocks());
        assert_eq!(vec![0u8; 8], a.data().to_vec());

        drop(a);
        assert_eq!(1, pool.total_blocks());
        assert_eq!(2, pool.total_bytes());

        let b = b.into_byte_block();
        assert_eq!(0, pool.pinned_blocks());
        assert_eq!(1, pool.unpinned_blocks());
        drop(b);
        assert_eq!(BlockPoolStats::default(), pool.stats());
        Ok(())
    }

    #[test]
    fn pinned_clone_tracks_pin_count() -> Result<()> {
        let pool = BlockPool::in_memory(dispatcher()?);
        let pinned = pool.allocate_byte_block(16, 3)?;
        assert_eq!(1, pinned.byte_block().pin_count(3));
        assert_eq!(1, pinned.byte_block().reference_count());

        let copy = pinned.clone();
        assert_eq!(2, pinned.byte_block().pin_count(3));
        assert_eq!(0, pinned.byte_block().pin_count(4));
        assert_eq!(2, pinned.byte_block().total_pin_count());
        assert_eq!(2, pinned.byte_block().reference_count());

        drop(copy);
        assert_eq!(1, pinned.byte_block().pin_count(3));
        assert_eq!(1, pinned.byte_block().reference_count());
        Ok(())
    }

    #[test]
    fn pinned_blocks_are_never_evicted() -> Result<()> {
        let pool = BlockPool::in_memory(dispatcher()?);
        let pinned = pool.allocate_byte_block(8, 0)?;
        assert!(!pool.evict_block(pinned.byte_block()));
        assert_eq!(0, pool.writing_blocks());
        assert!(pinned.byte_block().is_resident());
        Ok(())
    }

    #[test]
    fn evict_and_pin_restores_content() -> Result<()> {
        let storage = Arc::new(InMemoryStorage::new());
        let pool = BlockPool::new(dispatcher()?, storage.clone(), None, 64);
        let pinned = pool.allocate_byte_block(8, 0)?;
        pinned.write(0, b"abcdefgh")?;
        let block = Block::new(pinned.into_byte_block(), meta(8));

        assert!(pool.evict_block(block.byte_block()));
        assert!(!pool.evict_block(block.byte_block()));
        pool.wait_for_writes();
        assert_eq!(1, pool.swapped_blocks());
        assert!(!block.byte_block().is_resident());
        assert!(storage.contains(block.id()));
        assert_eq!(0, pool.mem_used());

        let request = block.pin(1);
        let pinned = request.wait()?;
        assert_eq!(b"abcdefgh".to_vec(), pinned.data().to_vec());
        assert_eq!(1, pool.pinned_blocks());
        assert_eq!(0, pool.swapped_blocks());
        assert_eq!(8, pool.mem_used());
        // the request keeps its own pin
        assert_eq!(2, block.byte_block().pin_count(1));
        drop(request);
        assert_eq!(1, block.byte_block().pin_count(1));
        Ok(())
    }

    #[test]
    fn concurrent_pins_share_one_read() -> Result<()> {
        let pool = BlockPool::in_memory(dispatcher()?);
        let pinned = pool.allocate_byte_block(4, 0)?;
        pinned.write(0, &[1, 2, 3, 4])?;
        let block = Block::new(pinned.into_byte_block(), meta(4));
        pool.evict_block(block.byte_block());
        pool.wait_for_writes();

        let first = block.pin(1);
        let second = block.pin(2);
        let a = first.wait()?;
        let b = second.wait()?;
        assert_eq!(a.data(), b.data());
        assert_eq!(1, pool.stats().reads);
        assert_eq!(2, block.byte_block().pin_count(1));
        assert_eq!(2, block.byte_block().pin_count(2));
        assert_eq!(4, block.byte_block().total_pin_count());
        Ok(())
    }

    #[test]
    fn pin_cancels_write_back() -> Result<()> {
        let storage = Arc::new(GatedStorage {
            gate: Semaphore::new(0),
            inner: InMemoryStorage::new(),
        });
        let pool = BlockPool::new(dispatcher()?, storage.clone(), None, 64);
        let pinned = pool.allocate_byte_block(8, 0)?;
        pinned.write(0, b"12345678")?;
        let block = Block::new(pinned.into_byte_block(), meta(8));

        assert!(pool.evict_block(block.byte_block()));
        assert_eq!(1, pool.writing_blocks());

        let request = block.pin(0);
        assert!(request.is_ready());
        assert_eq!(0, pool.writing_blocks());
        assert_eq!(1, pool.pinned_blocks());
        assert_eq!(b"12345678".to_vec(), request.wait()?.data().to_vec());

        storage.gate.add_permits(1);
        drop(request);
        assert_eq!(1, pool.unpinned_blocks());
        assert!(block.byte_block().is_resident());
        Ok(())
    }

    #[test]
    fn failed_write_back_keeps_block_resident() -> Result<()> {
        let pool = BlockPool::new(dispatcher()?, Arc::new(FailingStorage), None, 64);
        let block = pool.allocate_byte_block(8, 0)?.into_byte_block();
        assert!(pool.evict_block(&block));
        pool.wait_for_writes();

        let stats = pool.stats();
        assert_eq!(1, stats.unpinned_blocks);
        assert_eq!(0, stats.swapped_blocks);
        assert_eq!(1, stats.failed_writes);
        assert_eq!(8, stats.mem_used);
        assert!(block.is_resident());
        Ok(())
    }

    #[test]
    fn failed_read_back_reports_pin_failed() -> Result<()> {
        let storage = Arc::new(InMemoryStorage::new());
        let pool = BlockPool::new(dispatcher()?, storage.clone(), None, 64);
        let block = Block::new(pool.allocate_byte_block(8, 0)?.into_byte_block(), meta(8));
        pool.evict_block(block.byte_block());
        pool.wait_for_writes();
        futures::executor::block_on(storage.remove(block.id()))?;

        let err = block.pin_wait(0).unwrap_err();
        assert!(matches!(err, FerryError::PinFailed(id, _) if id == block.id()));
        assert_eq!(1, pool.swapped_blocks());
        assert_eq!(0, pool.mem_used());
        Ok(())
    }

    #[test]
    fn allocation_evicts_oldest_unpinned_first() -> Result<()> {
        let pool = BlockPool::new(
            dispatcher()?,
            Arc::new(InMemoryStorage::new()),
            Some(32),
            8,
        );
        let blocks = (0..4)
            .map(|_| pool.allocate_byte_block(8, 0).map(|b| b.into_byte_block()))
            .collect::<Result<Vec<_>>>()?;
        let newest = pool.allocate_byte_block(8, 0)?;
        pool.wait_for_writes();

        assert!(!blocks[0].is_resident());
        assert!(blocks[1..].iter().all(|b| b.is_resident()));
        assert!(newest.byte_block().is_resident());
        assert_eq!(32, pool.mem_used());
        assert_eq!(5, pool.total_blocks());
        Ok(())
    }

    #[test]
    fn allocation_beyond_pinned_capacity_fails() -> Result<()> {
        let pool = BlockPool::new(
            dispatcher()?,
            Arc::new(InMemoryStorage::new()),
            Some(16),
            8,
        );
        let _a = pool.allocate_byte_block(8, 0)?;
        let _b = pool.allocate_byte_block(8, 0)?;
        let err = pool.allocate_byte_block(8, 0).unwrap_err();
        assert!(matches!(err, FerryError::OutOfMemory(8, _)));
        let err = pool.allocate_byte_block(32, 0).unwrap_err();
        assert!(matches!(err, FerryError::OutOfMemory(32, _)));
        assert_eq!(2, pool.total_blocks());
        Ok(())
    }

    #[test]
    fn destroying_swapped_block_removes_external_copy() -> Result<()> {
        let storage = Arc::new(InMemoryStorage::new());
        let pool = BlockPool::new(dispatcher()?, storage.clone(), None, 64);
        let block = pool.allocate_byte_block(8, 0)?.into_byte_block();
        let id = block.id();
        pool.evict_block(&block);
        pool.wait_for_writes();
        assert!(storage.contains(id));

        drop(block);
        assert_eq!(0, pool.total_blocks());
        assert_eq!(0, pool.swapped_blocks());
        for _ in 0..100 {
            if !storage.contains(id) {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert!(!storage.contains(id));
        Ok(())
    }
}
