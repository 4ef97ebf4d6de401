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

//! Ferry configuration

use std::collections::HashMap;
use std::path::PathBuf;
use std::result;
use std::sync::LazyLock;

use crate::error::{FerryError, Result};

/// Byte ceiling for resident blocks of one block pool, 0 disables the ceiling.
pub const FERRY_POOL_MEMORY_LIMIT: &str = "ferry.pool.memory_limit_bytes";
/// Capacity of the blocks block writers allocate.
pub const FERRY_POOL_BLOCK_SIZE: &str = "ferry.pool.block_size";
/// Worker threads of the dispatcher runtime.
pub const FERRY_DISPATCHER_IO_THREADS: &str = "ferry.dispatcher.io_threads";
/// Directory evicted blocks are written to. When unset the system
/// temporary directory is used.
pub const FERRY_SPILL_DIR: &str = "ferry.spill.dir";
/// Buffer capacity of in-process duplex connections.
pub const FERRY_CHANNEL_DUPLEX_CAPACITY: &str = "ferry.channel.duplex_capacity";
/// Byte budget of a reduce pre-stage table.
pub const FERRY_REDUCE_LIMIT_MEMORY: &str = "ferry.reduce.limit_memory_bytes";
/// Entries per bucket block of the bucket reduce table.
pub const FERRY_REDUCE_BUCKET_BLOCK_SIZE: &str = "ferry.reduce.bucket_block_size";
/// Maximum fill rate of the probing reduce table.
pub const FERRY_REDUCE_PROBING_FILL_RATE: &str = "ferry.reduce.probing_fill_rate";

pub type ParseResult<T> = result::Result<T, String>;

/// Value types a configuration entry may hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigType {
    UInt64,
    Float64,
    Utf8,
}

static CONFIG_ENTRIES: LazyLock<HashMap<String, ConfigEntry>> = LazyLock::new(|| {
    let entries = vec![
        ConfigEntry::new(FERRY_POOL_MEMORY_LIMIT.to_string(),
                         "Maximum bytes of resident blocks before unpinned blocks are evicted, 0 means unlimited".to_string(),
                         ConfigType::UInt64, Some("0".to_string())),
        ConfigEntry::new(FERRY_POOL_BLOCK_SIZE.to_string(),
                         "Capacity in bytes of blocks allocated by block writers".to_string(),
                         ConfigType::UInt64, Some((2 * 1024 * 1024).to_string())),
        ConfigEntry::new(FERRY_DISPATCHER_IO_THREADS.to_string(),
                         "Number of worker threads driving eviction, refetch and network I/O".to_string(),
                         ConfigType::UInt64, Some("2".to_string())),
        ConfigEntry::new(FERRY_SPILL_DIR.to_string(),
                         "Directory for evicted blocks".to_string(),
                         ConfigType::Utf8, None),
        ConfigEntry::new(FERRY_CHANNEL_DUPLEX_CAPACITY.to_string(),
                         "Buffer capacity in bytes of in-process worker connections".to_string(),
                         ConfigType::UInt64, Some((1024 * 1024).to_string())),
        ConfigEntry::new(FERRY_REDUCE_LIMIT_MEMORY.to_string(),
                         "Byte budget of a reduce pre-stage table before partitions are spilled".to_string(),
                         ConfigType::UInt64, Some((64 * 1024 * 1024).to_string())),
        ConfigEntry::new(FERRY_REDUCE_BUCKET_BLOCK_SIZE.to_string(),
                         "Number of entries per bucket block in the bucket reduce table".to_string(),
                         ConfigType::UInt64, Some("64".to_string())),
        ConfigEntry::new(FERRY_REDUCE_PROBING_FILL_RATE.to_string(),
                         "Fraction of probing table slots that may be filled before a partition spills".to_string(),
                         ConfigType::Float64, Some("0.5".to_string())),
    ];
    entries
        .into_iter()
        .map(|e| (e.name.clone(), e))
        .collect::<HashMap<_, _>>()
});

/// Configuration option meta-data
#[derive(Debug, Clone)]
pub struct ConfigEntry {
    name: String,
    description: String,
    data_type: ConfigType,
    default_value: Option<String>,
}

impl ConfigEntry {
    fn new(
        name: String,
        description: String,
        data_type: ConfigType,
        default_value: Option<String>,
    ) -> Self {
        Self {
            name,
            description,
            data_type,
            default_value,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }
}

/// Ferry configuration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FerryConfig {
    /// Settings stored in map for easy serde
    settings: HashMap<String, String>,
}

impl FerryConfig {
    /// Create a new configuration based on key-value pairs
    pub fn with_settings(settings: HashMap<String, String>) -> Result<Self> {
        let supported_entries = FerryConfig::valid_entries();
        for name in settings.keys() {
            if !supported_entries.contains_key(name) {
                return Err(FerryError::Configuration(format!(
                    "configuration key `{name}` does not exist"
                )));
            }
        }
        for (name, entry) in supported_entries {
            if let Some(v) = settings.get(name) {
                // validate that we can parse the user-supplied value
                Self::parse_value(v.as_str(), entry.data_type).map_err(|e| FerryError::Configuration(format!("Failed to parse user-supplied value '{v}' for configuration setting '{name}': {e}")))?;
            } else if let Some(v) = entry.default_value.as_ref() {
                Self::parse_value(v.as_str(), entry.data_type).map_err(|e| FerryError::Configuration(format!("Failed to parse default value '{v}' for configuration setting '{name}': {e}")))?;
            }
        }

        Ok(Self { settings })
    }

    /// Returns a copy of this configuration with one setting replaced.
    pub fn with(&self, key: &str, value: impl Into<String>) -> Result<Self> {
        let mut settings = self.settings.clone();
        settings.insert(key.to_string(), value.into());
        Self::with_settings(settings)
    }

    pub fn parse_value(val: &str, data_type: ConfigType) -> ParseResult<()> {
        match data_type {
            ConfigType::UInt64 => {
                val.parse::<u64>().map_err(|e| format!("{e:?}"))?;
            }
            ConfigType::Float64 => {
                let v = val.parse::<f64>().map_err(|e| format!("{e:?}"))?;
                if !(v > 0.0 && v < 1.0) {
                    return Err(format!("{v} is not within (0, 1)"));
                }
            }
            ConfigType::Utf8 => {}
        }

        Ok(())
    }

    // All available configuration options
    pub fn valid_entries() -> &'static HashMap<String, ConfigEntry> {
        &CONFIG_ENTRIES
    }

    pub fn settings(&self) -> &HashMap<String, String> {
        &self.settings
    }

    /// Byte ceiling of the block pool, `None` when unlimited.
    pub fn pool_memory_limit(&self) -> Option<usize> {
        match self.get_usize_setting(FERRY_POOL_MEMORY_LIMIT) {
            0 => None,
            limit => Some(limit),
        }
    }

    pub fn block_size(&self) -> usize {
        self.get_usize_setting(FERRY_POOL_BLOCK_SIZE).max(1)
    }

    pub fn io_threads(&self) -> usize {
        self.get_usize_setting(FERRY_DISPATCHER_IO_THREADS).max(1)
    }

    pub fn spill_dir(&self) -> PathBuf {
        self.settings
            .get(FERRY_SPILL_DIR)
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir)
    }

    pub fn duplex_capacity(&self) -> usize {
        self.get_usize_setting(FERRY_CHANNEL_DUPLEX_CAPACITY).max(64)
    }

    pub fn reduce_limit_memory(&self) -> usize {
        self.get_usize_setting(FERRY_REDUCE_LIMIT_MEMORY)
    }

    pub fn reduce_bucket_block_size(&self) -> usize {
        self.get_usize_setting(FERRY_REDUCE_BUCKET_BLOCK_SIZE).max(1)
    }

    pub fn reduce_probing_fill_rate(&self) -> f64 {
        self.get_f64_setting(FERRY_REDUCE_PROBING_FILL_RATE)
    }

    fn get_usize_setting(&self, key: &str) -> usize {
        self.get_setting(key).parse().unwrap_or_default()
    }

    fn get_f64_setting(&self, key: &str) -> f64 {
        self.get_setting(key).parse().unwrap_or(0.5)
    }

    // values were validated in the constructor, defaults exist for every
    // numeric entry
    fn get_setting(&self, key: &str) -> &str {
        self.settings
            .get(key)
            .or_else(|| {
                Self::valid_entries()
                    .get(key)
                    .and_then(|e| e.default_value.as_ref())
            })
            .map(|v| v.as_str())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() -> Result<()> {
        let config = FerryConfig::default();
        assert_eq!(None, config.pool_memory_limit());
        assert_eq!(2 * 1024 * 1024, config.block_size());
        assert_eq!(64 * 1024 * 1024, config.reduce_limit_memory());
        assert!((config.reduce_probing_fill_rate() - 0.5).abs() < f64::EPSILON);
        assert_eq!(std::env::temp_dir(), config.spill_dir());
        Ok(())
    }

    #[test]
    fn override_settings() -> Result<()> {
        let config = FerryConfig::default()
            .with(FERRY_POOL_MEMORY_LIMIT, "4096")?
            .with(FERRY_SPILL_DIR, "/tmp/ferry-spill")?;
        assert_eq!(Some(4096), config.pool_memory_limit());
        assert_eq!(PathBuf::from("/tmp/ferry-spill"), config.spill_dir());
        Ok(())
    }

    #[test]
    fn reject_invalid_settings() {
        assert!(FerryConfig::default()
            .with(FERRY_POOL_BLOCK_SIZE, "many")
            .is_err());
        assert!(FerryConfig::default()
            .with(FERRY_REDUCE_PROBING_FILL_RATE, "1.5")
            .is_err());
        assert!(FerryConfig::default().with("ferry.unknown", "1").is_err());
    }
}
