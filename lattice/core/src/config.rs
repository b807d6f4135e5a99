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
//

//! Lattice configuration

use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::result;
use std::str::FromStr;
use std::sync::LazyLock;
use std::time::Duration;

use crate::error::{LatticeError, Result};

/// Byte budget of the process-wide chunk cache.
pub const LATTICE_CACHE_CAPACITY_BYTES: &str = "lattice.cache.capacity_bytes";
/// Buffer whole chunks per sender and merge them at flush time.
pub const LATTICE_SHUFFLE_DEFER_MERGE: &str = "lattice.shuffle.defer_merge";
/// Cache the latest sparsity bitmap per sender instead of expecting it
/// embedded in every attribute chunk.
pub const LATTICE_SHUFFLE_CACHE_BITMAPS: &str = "lattice.shuffle.cache_bitmaps";
pub const LATTICE_SHUFFLE_EVENT_BUFFER_SIZE: &str = "lattice.shuffle.event_buffer_size";
/// Upper bound of bytes a deferring receiver may buffer, 0 means unbounded.
pub const LATTICE_SHUFFLE_MAX_BUFFERED_BYTES: &str =
    "lattice.shuffle.max_buffered_bytes";
/// How long a flush waits for end-of-stream signals, 0 means forever.
pub const LATTICE_SHUFFLE_FLUSH_TIMEOUT_MS: &str = "lattice.shuffle.flush_timeout_ms";
/// Messages a node holds for operations it has not registered yet.
pub const LATTICE_SHUFFLE_MAX_EARLY_MESSAGES: &str =
    "lattice.shuffle.max_early_messages";
/// Spill directory of the chunk cache. In-memory overflow when unset.
pub const LATTICE_OVERFLOW_DIR: &str = "lattice.overflow.dir";

const DEFAULT_CACHE_CAPACITY_BYTES: usize = 256 * 1024 * 1024;
const DEFAULT_EVENT_BUFFER_SIZE: usize = 1024;
const DEFAULT_MAX_EARLY_MESSAGES: usize = 65536;

pub type ParseResult<T> = result::Result<T, String>;

/// Value types of configuration entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigDataType {
    UInt64,
    Boolean,
    Utf8,
}

impl Display for ConfigDataType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigDataType::UInt64 => write!(f, "UInt64"),
            ConfigDataType::Boolean => write!(f, "Boolean"),
            ConfigDataType::Utf8 => write!(f, "Utf8"),
        }
    }
}

static CONFIG_ENTRIES: LazyLock<HashMap<String, ConfigEntry>> = LazyLock::new(|| {
    let entries = vec![
        ConfigEntry::new(LATTICE_CACHE_CAPACITY_BYTES,
                         "Byte budget of the chunk cache, pinned chunks included",
                         ConfigDataType::UInt64,
                         Some(DEFAULT_CACHE_CAPACITY_BYTES.to_string())),
        ConfigEntry::new(LATTICE_SHUFFLE_DEFER_MERGE,
                         "Buffer received chunks per sender and merge them when the redistribution is flushed",
                         ConfigDataType::Boolean,
                         Some(false.to_string())),
        ConfigEntry::new(LATTICE_SHUFFLE_CACHE_BITMAPS,
                         "Reuse the last sparsity bitmap received from a sender for its following attribute chunks",
                         ConfigDataType::Boolean,
                         Some(false.to_string())),
        ConfigEntry::new(LATTICE_SHUFFLE_EVENT_BUFFER_SIZE,
                         "Capacity of the shuffle dispatcher event channel",
                         ConfigDataType::UInt64,
                         Some(DEFAULT_EVENT_BUFFER_SIZE.to_string())),
        ConfigEntry::new(LATTICE_SHUFFLE_MAX_BUFFERED_BYTES,
                         "Maximum bytes a deferring receiver may buffer, 0 for no limit",
                         ConfigDataType::UInt64,
                         Some(0.to_string())),
        ConfigEntry::new(LATTICE_SHUFFLE_FLUSH_TIMEOUT_MS,
                         "Milliseconds a flush waits for all end-of-stream signals, 0 to wait forever",
                         ConfigDataType::UInt64,
                         Some(0.to_string())),
        ConfigEntry::new(LATTICE_SHUFFLE_MAX_EARLY_MESSAGES,
                         "Maximum messages held for operations not registered yet, across all of them",
                         ConfigDataType::UInt64,
                         Some(DEFAULT_MAX_EARLY_MESSAGES.to_string())),
        ConfigEntry::new(LATTICE_OVERFLOW_DIR,
                         "Directory the chunk cache spills evicted chunks to",
                         ConfigDataType::Utf8,
                         None),
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
    data_type: ConfigDataType,
    default_value: Option<String>,
}

impl ConfigEntry {
    fn new(
        name: &str,
        description: &str,
        data_type: ConfigDataType,
        default_value: Option<String>,
    ) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
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

    pub fn data_type(&self) -> ConfigDataType {
        self.data_type
    }

    pub fn default_value(&self) -> Option<&str> {
        self.default_value.as_deref()
    }
}

/// Lattice configuration
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LatticeConfig {
    /// Settings stored in map for easy serde
    settings: HashMap<String, String>,
}

impl LatticeConfig {
    /// Create a new configuration based on key-value pairs
    pub fn with_settings(settings: HashMap<String, String>) -> Result<Self> {
        for name in settings.keys() {
            if !Self::valid_entries().contains_key(name) {
                return Err(LatticeError::Configuration(format!(
                    "configuration key `{name}` does not exist"
                )));
            }
        }
        for (name, entry) in Self::valid_entries() {
            if let Some(v) = settings.get(name) {
                // validate that we can parse the user-supplied value
                Self::parse_value(v.as_str(), entry.data_type).map_err(|e| {
                    LatticeError::Configuration(format!(
                        "Failed to parse user-supplied value '{v}' for configuration setting '{name}': {e}"
                    ))
                })?;
            } else if let Some(v) = entry.default_value.as_deref() {
                Self::parse_value(v, entry.data_type).map_err(|e| {
                    LatticeError::Configuration(format!(
                        "Failed to parse default value '{v}' for configuration setting '{name}': {e}"
                    ))
                })?;
            }
        }

        Ok(Self { settings })
    }

    /// Validated single-key update.
    pub fn set(mut self, key: &str, value: &str) -> Result<Self> {
        self.settings.insert(key.to_string(), value.to_string());
        Self::with_settings(self.settings)
    }

    pub fn parse_value(val: &str, data_type: ConfigDataType) -> ParseResult<()> {
        match data_type {
            ConfigDataType::UInt64 => {
                val.parse::<u64>().map_err(|e| format!("{e:?}"))?;
            }
            ConfigDataType::Boolean => {
                val.parse::<bool>().map_err(|e| format!("{e:?}"))?;
            }
            ConfigDataType::Utf8 => {}
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

    pub fn with_cache_capacity_bytes(self, bytes: usize) -> Result<Self> {
        self.set(LATTICE_CACHE_CAPACITY_BYTES, &bytes.to_string())
    }

    pub fn with_defer_merge(self, enabled: bool) -> Result<Self> {
        self.set(LATTICE_SHUFFLE_DEFER_MERGE, &enabled.to_string())
    }

    pub fn with_cache_bitmaps(self, enabled: bool) -> Result<Self> {
        self.set(LATTICE_SHUFFLE_CACHE_BITMAPS, &enabled.to_string())
    }

    pub fn with_max_buffered_bytes(self, bytes: usize) -> Result<Self> {
        self.set(LATTICE_SHUFFLE_MAX_BUFFERED_BYTES, &bytes.to_string())
    }

    pub fn with_flush_timeout(self, timeout: Duration) -> Result<Self> {
        self.set(
            LATTICE_SHUFFLE_FLUSH_TIMEOUT_MS,
            &timeout.as_millis().to_string(),
        )
    }

    pub fn with_max_early_messages(self, messages: usize) -> Result<Self> {
        self.set(LATTICE_SHUFFLE_MAX_EARLY_MESSAGES, &messages.to_string())
    }

    pub fn with_overflow_dir(self, dir: &str) -> Result<Self> {
        self.set(LATTICE_OVERFLOW_DIR, dir)
    }

    pub fn cache_capacity_bytes(&self) -> usize {
        self.get_setting(LATTICE_CACHE_CAPACITY_BYTES)
            .unwrap_or(DEFAULT_CACHE_CAPACITY_BYTES)
    }

    pub fn defer_merge(&self) -> bool {
        self.get_setting(LATTICE_SHUFFLE_DEFER_MERGE)
            .unwrap_or(false)
    }

    pub fn cache_bitmaps(&self) -> bool {
        self.get_setting(LATTICE_SHUFFLE_CACHE_BITMAPS)
            .unwrap_or(false)
    }

    pub fn event_buffer_size(&self) -> usize {
        self.get_setting(LATTICE_SHUFFLE_EVENT_BUFFER_SIZE)
            .unwrap_or(DEFAULT_EVENT_BUFFER_SIZE)
    }

    /// `None` when unbounded.
    pub fn max_buffered_bytes(&self) -> Option<usize> {
        self.get_setting::<usize>(LATTICE_SHUFFLE_MAX_BUFFERED_BYTES)
            .filter(|v| *v > 0)
    }

    /// `None` when a flush may wait forever.
    pub fn flush_timeout(&self) -> Option<Duration> {
        self.get_setting::<u64>(LATTICE_SHUFFLE_FLUSH_TIMEOUT_MS)
            .filter(|v| *v > 0)
            .map(Duration::from_millis)
    }

    pub fn max_early_messages(&self) -> usize {
        self.get_setting(LATTICE_SHUFFLE_MAX_EARLY_MESSAGES)
            .unwrap_or(DEFAULT_MAX_EARLY_MESSAGES)
    }

    pub fn overflow_dir(&self) -> Option<String> {
        self.get_setting(LATTICE_OVERFLOW_DIR)
    }

    /// Values are validated on construction so a parse failure can only mean
    /// the key is unset and has no default.
    fn get_setting<T: FromStr>(&self, key: &str) -> Option<T> {
        self.settings
            .get(key)
            .map(String::as_str)
            .or_else(|| {
                Self::valid_entries()
                    .get(key)
                    .and_then(|e| e.default_value.as_deref())
            })
            .and_then(|v| v.parse().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() -> Result<()> {
        let config = LatticeConfig::default();
        assert_eq!(256 * 1024 * 1024, config.cache_capacity_bytes());
        assert!(!config.defer_merge());
        assert!(!config.cache_bitmaps());
        assert_eq!(1024, config.event_buffer_size());
        assert_eq!(None, config.max_buffered_bytes());
        assert_eq!(None, config.flush_timeout());
        assert_eq!(65536, config.max_early_messages());
        assert_eq!(None, config.overflow_dir());
        Ok(())
    }

    #[test]
    fn custom_config() -> Result<()> {
        let config = LatticeConfig::default()
            .with_defer_merge(true)?
            .with_cache_capacity_bytes(4096)?
            .with_flush_timeout(Duration::from_secs(3))?
            .with_overflow_dir("/tmp/lattice")?;
        assert!(config.defer_merge());
        assert_eq!(4096, config.cache_capacity_bytes());
        assert_eq!(Some(Duration::from_secs(3)), config.flush_timeout());
        assert_eq!(Some("/tmp/lattice".to_string()), config.overflow_dir());
        Ok(())
    }

    #[test]
    fn custom_config_invalid() -> Result<()> {
        let mut settings = HashMap::new();
        settings.insert(LATTICE_CACHE_CAPACITY_BYTES.to_string(), "lots".to_string());
        assert!(LatticeConfig::with_settings(settings).is_err());

        let mut settings = HashMap::new();
        settings.insert("lattice.no.such.key".to_string(), "1".to_string());
        assert!(LatticeConfig::with_settings(settings).is_err());

        assert!(LatticeConfig::default()
            .set(LATTICE_SHUFFLE_DEFER_MERGE, "maybe")
            .is_err());
        Ok(())
    }
}
