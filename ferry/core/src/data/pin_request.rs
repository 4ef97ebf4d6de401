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

//! Pending residency requests.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::data::block::{Block, PinnedBlock};
use crate::error::{FerryError, Result};

/// Completion slot shared by a [`PinRequest`] and the pool's read-back task.
#[derive(Default)]
pub(crate) struct PinSlot {
    result: Mutex<Option<Result<PinnedBlock>>>,
    ready: Condvar,
}

impl PinSlot {
    pub(crate) fn complete(&self, result: Result<PinnedBlock>) {
        *self.result.lock() = Some(result);
        self.ready.notify_all();
    }
}

fn share(result: &Result<PinnedBlock>) -> Result<PinnedBlock> {
    match result {
        Ok(pinned) => Ok(pinned.clone()),
        Err(e) => Err(e.clone_for_waiter()),
    }
}

/// Request to make a [`Block`] resident for one requester.
///
/// Once satisfied the request itself owns one pin, held until the request
/// is dropped. [`PinRequest::wait`] and [`PinRequest::poll`] hand out
/// additional pinned handles.
pub struct PinRequest {
    block: Block,
    slot: Arc<PinSlot>,
}

impl PinRequest {
    pub(crate) fn ready(block: Block, pinned: PinnedBlock) -> Self {
        let slot = Arc::new(PinSlot::default());
        slot.complete(Ok(pinned));
        Self { block, slot }
    }

    pub(crate) fn failed(block: Block, error: FerryError) -> Self {
        let slot = Arc::new(PinSlot::default());
        slot.complete(Err(error));
        Self { block, slot }
    }

    pub(crate) fn pending(block: Block, slot: Arc<PinSlot>) -> Self {
        Self { block, slot }
    }

    pub fn block(&self) -> &Block {
        &self.block
    }

    /// True once the read-back completed, successfully or not.
    pub fn is_ready(&self) -> bool {
        self.slot.result.lock().is_some()
    }

    /// Returns the outcome without blocking, or `None` while the read-back is in flight.
    pub fn poll(&self) -> Option<Result<PinnedBlock>> {
        self.slot.result.lock().as_ref().map(share)
    }

    /// Blocks until the request is satisfied or failed.
    pub fn wait(&self) -> Result<PinnedBlock> {
        let mut result = self.slot.result.lock();
        loop {
            if let Some(result) = result.as_ref() {
                return share(result);
            }
            self.slot.ready.wait(&mut result);
        }
    }
}

impl std::fmt::Debug for PinRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinRequest")
            .field("block", &self.block)
            .field("ready", &self.is_ready())
            .finish()
    }
}
