//! Configuration for a slotkv storage node
//!
//! Provides sizing presets for different hardware classes. Shard count and
//! entries per shard are fixed once the `Storage` is built.

use std::time::Duration;

use crate::error::{StoreError, StoreResult};

/// Largest key the on-disk record format can hold (u16 length field)
pub const KEY_SIZE_CEILING: usize = u16::MAX as usize;

/// Largest value any configuration may allow
pub const VALUE_SIZE_CEILING: usize = 128 * 1024 * 1024;

/// slotkv configuration with sizing presets
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of shards (each with its own mutex and buffer)
    pub slots_size: usize,
    /// Direct-mapped cache entries per shard
    pub entries_size: usize,
    /// First buffer reservation made by a shard on a cache miss
    pub initial_buffer_size: usize,
    /// Maximum raw key size in bytes
    pub max_key_size: usize,
    /// Maximum raw value size in bytes
    pub max_value_size: usize,
    /// Background flusher cadence
    pub flush_cadence: Duration,
    /// Compact the on-disk table when its dead space ratio exceeds this
    pub compaction_trigger_ratio: f64,
}

impl Config {
    /// Server-class node: large table, frequent write-back
    pub fn server() -> Self {
        Self {
            slots_size: 256,
            entries_size: 4096,
            initial_buffer_size: 1024,
            max_key_size: 1024,
            max_value_size: 32 * 1024 * 1024,
            flush_cadence: Duration::from_secs(5),
            compaction_trigger_ratio: 0.5,
        }
    }

    /// Desktop-class node
    pub fn desktop() -> Self {
        Self {
            slots_size: 64,
            entries_size: 1024,
            initial_buffer_size: 1024,
            max_key_size: 1024,
            max_value_size: 16 * 1024 * 1024,
            flush_cadence: Duration::from_secs(10),
            compaction_trigger_ratio: 0.4,
        }
    }

    /// Smallest useful table, handy for tests and embedded targets
    pub fn minimal() -> Self {
        Self {
            slots_size: 4,
            entries_size: 16,
            initial_buffer_size: 1024,
            max_key_size: 256,
            max_value_size: 1024 * 1024,
            flush_cadence: Duration::from_secs(20),
            compaction_trigger_ratio: 0.3,
        }
    }

    /// Largest reservation a single shard buffer is allowed to make.
    pub fn buffer_limit(&self) -> usize {
        // a miss may stage one key + value on top of a doubled reservation
        2 * (self.max_key_size + self.max_value_size)
    }

    /// Validate all configuration parameters
    pub fn validate(&self) -> StoreResult<()> {
        if self.slots_size == 0 {
            return Err(StoreError::InvalidConfig("slots_size must be > 0".into()));
        }
        if self.entries_size == 0 {
            return Err(StoreError::InvalidConfig("entries_size must be > 0".into()));
        }
        if self.initial_buffer_size < 64 {
            return Err(StoreError::InvalidConfig("initial_buffer_size must be >= 64".into()));
        }
        if self.max_key_size < crate::format::KEY_META_SIZE || self.max_key_size > KEY_SIZE_CEILING {
            return Err(StoreError::InvalidConfig("max_key_size must be in [8, 65535]".into()));
        }
        if self.max_value_size < crate::format::VALUE_META_SIZE
            || self.max_value_size > VALUE_SIZE_CEILING
        {
            return Err(StoreError::InvalidConfig("max_value_size must be in [8, 128MB]".into()));
        }
        if self.flush_cadence.as_millis() == 0 {
            return Err(StoreError::InvalidConfig("flush_cadence must be > 0".into()));
        }
        if self.compaction_trigger_ratio <= 0.0 || self.compaction_trigger_ratio >= 1.0 {
            return Err(StoreError::InvalidConfig("compaction_trigger_ratio must be in (0.0, 1.0)".into()));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self { Self::server() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_presets_valid() {
        assert!(Config::server().validate().is_ok());
        assert!(Config::desktop().validate().is_ok());
        assert!(Config::minimal().validate().is_ok());
    }

    #[test]
    fn test_tier_ordering() {
        let s = Config::server();
        let d = Config::desktop();
        let m = Config::minimal();
        assert!(s.slots_size * s.entries_size > d.slots_size * d.entries_size);
        assert!(d.slots_size * d.entries_size > m.slots_size * m.entries_size);
    }

    #[test]
    fn test_rejects_empty_table() {
        let mut config = Config::minimal();
        config.entries_size = 0;
        assert!(matches!(config.validate(), Err(StoreError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_key_limit_below_digest() {
        let mut config = Config::minimal();
        config.max_key_size = 4;
        assert!(config.validate().is_err());
    }
}
