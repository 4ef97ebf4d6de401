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

//! External storage for evicted blocks.
//!
//! The block pool writes the bytes of unpinned blocks out when it runs over
//! its memory ceiling and reads them back when a swapped block is pinned.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use log::{debug, error};

use crate::data::BlockId;
use crate::error::{FerryError, Result};

#[async_trait]
pub trait ExternalStorage: Send + Sync {
    /// Stores the bytes of a block, replacing any previous copy.
    async fn write_out(&self, block_id: BlockId, data: Bytes) -> Result<()>;

    /// Reads back the bytes previously stored for a block.
    async fn read_in(&self, block_id: BlockId) -> Result<Bytes>;

    /// Removes the stored copy of a block. Removing a missing copy is not an error.
    async fn remove(&self, block_id: BlockId) -> Result<()>;
}

/// Stores one file per evicted block in a private directory that is
/// removed when the storage is dropped.
#[derive(Debug)]
pub struct DiskStorage {
    dir: PathBuf,
}

impl DiskStorage {
    /// Creates a unique spill directory below `base_dir`.
    pub fn try_new(base_dir: &Path) -> Result<Self> {
        let mut dir = PathBuf::from(base_dir);
        dir.push(format!("ferry-blocks-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).map_err(|e| {
            error!("Failed to create spill directory at {dir:?}: {e:?}");
            FerryError::IoError(e)
        })?;
        debug!("Created block spill directory {dir:?}");
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn block_path(&self, block_id: BlockId) -> PathBuf {
        self.dir.join(format!("block-{block_id}.bin"))
    }
}

#[async_trait]
impl ExternalStorage for DiskStorage {
    async fn write_out(&self, block_id: BlockId, data: Bytes) -> Result<()> {
        let path = self.block_path(block_id);
        tokio::fs::write(&path, &data).await.map_err(|e| {
            error!("Failed to write block {block_id} to {path:?}: {e:?}");
            FerryError::IoError(e)
        })
    }

    async fn read_in(&self, block_id: BlockId) -> Result<Bytes> {
        let path = self.block_path(block_id);
        let data = tokio::fs::read(&path).await.map_err(|e| {
            FerryError::PinFailed(
                block_id,
                format!("Failed to read block file at {path:?}: {e:?}"),
            )
        })?;
        Ok(Bytes::from(data))
    }

    async fn remove(&self, block_id: BlockId) -> Result<()> {
        match tokio::fs::remove_file(self.block_path(block_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(FerryError::IoError(e)),
        }
    }
}

impl Drop for DiskStorage {
    fn drop(&mut self) {
        // Best-effort cleanup on drop
        if let Err(e) = std::fs::remove_dir_all(&self.dir) {
            debug!("Failed to cleanup spill directory {:?}: {e:?}", self.dir);
        }
    }
}

/// Keeps evicted blocks in a map. Evicting into memory frees nothing, but
/// exercises the full write-back/read-back path without touching disk.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    blocks: DashMap<BlockId, Bytes>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of blocks currently stored.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn contains(&self, block_id: BlockId) -> bool {
        self.blocks.contains_key(&block_id)
    }
}

#[async_trait]
impl ExternalStorage for InMemoryStorage {
    async fn write_out(&self, block_id: BlockId, data: Bytes) -> Result<()> {
        // detach from the resident buffer so releasing it frees the memory
        self.blocks.insert(block_id, Bytes::copy_from_slice(&data));
        Ok(())
    }

    async fn read_in(&self, block_id: BlockId) -> Result<Bytes> {
        self.blocks
            .get(&block_id)
            .map(|data| data.value().clone())
            .ok_or_else(|| {
                FerryError::PinFailed(
                    block_id,
                    "Block not found in in-memory storage".to_string(),
                )
            })
    }

    async fn remove(&self, block_id: BlockId) -> Result<()> {
        self.blocks.remove(&block_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn disk_storage_round_trip() -> Result<()> {
        let temp_dir = TempDir::new().unwrap();
        let storage = DiskStorage::try_new(temp_dir.path())?;

        storage.write_out(7, Bytes::from_static(b"ferry")).await?;
        assert!(storage.dir().join("block-7.bin").exists());
        assert_eq!(Bytes::from_static(b"ferry"), storage.read_in(7).await?);

        storage.remove(7).await?;
        assert!(!storage.dir().join("block-7.bin").exists());
        // removing twice is fine
        storage.remove(7).await?;

        let err = storage.read_in(7).await.unwrap_err();
        assert!(matches!(err, FerryError::PinFailed(7, _)));
        Ok(())
    }

    #[test]
    fn disk_storage_cleanup_on_drop() -> Result<()> {
        let temp_dir = TempDir::new().unwrap();
        let storage = DiskStorage::try_new(temp_dir.path())?;
        let dir = storage.dir().to_path_buf();
        assert!(dir.exists());
        drop(storage);
        assert!(!dir.exists());
        Ok(())
    }

    #[tokio::test]
    async fn in_memory_storage_round_trip() -> Result<()> {
        let storage = InMemoryStorage::new();
        assert!(storage.is_empty());

        storage.write_out(1, Bytes::from_static(&[1, 2, 3])).await?;
        assert!(storage.contains(1));
        assert_eq!(&[1, 2, 3][..], &storage.read_in(1).await?[..]);

        storage.remove(1).await?;
        assert!(storage.read_in(1).await.is_err());
        Ok(())
    }
}
