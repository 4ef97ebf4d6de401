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

//! Collective operations built on channels.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::data::Multiplexer;
use crate::error::Result;

/// Sends `items` to every worker and returns the items of all workers,
/// ordered by worker id and then by send order.
///
/// Allocates a channel, so every worker of the job must call it at the
/// same point of its channel allocation sequence.
pub fn all_gather<T>(mux: &Multiplexer, items: &[T]) -> Result<Vec<T>>
where
    T: Serialize + DeserializeOwned,
{
    let channel = mux.allocate_channel();
    let rank = mux.my_rank();
    let mut emitters = mux.open_emitters::<(usize, &T)>(channel);
    for emitter in emitters.iter_mut() {
        for item in items {
            emitter.emit(&(rank, item))?;
        }
        emitter.close()?;
    }
    drop(emitters);

    let mut gathered = mux.reader::<(usize, T)>(channel).read_all()?;
    // stable: keeps the send order of each worker
    gathered.sort_by_key(|(worker, _)| *worker);
    Ok(gathered.into_iter().map(|(_, item)| item).collect())
}
