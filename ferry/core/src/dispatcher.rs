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

//! Asynchronous I/O runtime shared by the block pool and the channel multiplexer.

use std::future::Future;
use std::sync::Arc;

use log::{debug, info};
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::JoinHandle;

use crate::config::FerryConfig;
use crate::error::Result;

/// A named multi-threaded runtime driving eviction write-back, swap-in
/// reads and network send/receive for one worker.
///
/// Cloning is cheap; the runtime shuts down when the last clone is dropped.
/// Shutdown never blocks, so a dispatcher may be dropped from within
/// asynchronous code.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    name: String,
    handle: Handle,
    runtime: Option<Runtime>,
}

impl Dispatcher {
    /// Creates a dispatcher with `io_threads` worker threads.
    pub fn new(name: &str, io_threads: usize) -> Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(io_threads.max(1))
            .thread_name(format!("{name}-io"))
            .enable_all()
            .build()?;
        info!("Started dispatcher {name} with {} I/O threads", io_threads.max(1));
        Ok(Self {
            inner: Arc::new(DispatcherInner {
                name: name.to_string(),
                handle: runtime.handle().clone(),
                runtime: Some(runtime),
            }),
        })
    }

    /// Creates a dispatcher sized by [`FerryConfig::io_threads`].
    pub fn try_from_config(name: &str, config: &FerryConfig) -> Result<Self> {
        Self::new(name, config.io_threads())
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn handle(&self) -> &Handle {
        &self.inner.handle
    }

    /// Spawns a task onto the dispatcher runtime.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.inner.handle.spawn(future)
    }
}

impl Drop for DispatcherInner {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            debug!("Shutting down dispatcher {}", self.name);
            runtime.shutdown_background();
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("name", &self.inner.name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_and_join() -> Result<()> {
        let dispatcher = Dispatcher::new("test", 1)?;
        let task = dispatcher.spawn(async { 21 * 2 });
        assert_eq!(42, futures::executor::block_on(task)?);
        Ok(())
    }

    #[tokio::test]
    async fn drop_inside_async_context() -> Result<()> {
        let dispatcher = Dispatcher::new("nested", 1)?;
        let task = dispatcher.spawn(async { 7 });
        assert_eq!(7, task.await?);
        drop(dispatcher);
        Ok(())
    }
}
