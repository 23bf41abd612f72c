use crate::error::{Result, ZbMapError};
use crate::layout::{BucketLayout, MAX_TABLE_SIZE};

/// Configuration for a ZbMap
#[derive(Debug, Clone, PartialEq)]
pub struct ZbMapConfig {
    /// Directory slots allocated up front, rounded up to a power of two (default: 32)
    pub initial_table_size: usize,

    /// Directory slots the map may grow to before puts fail (default: `MAX_TABLE_SIZE`)
    pub max_table_size: usize,

    /// Maximum sized blocks every bucket can hold (default: 16)
    pub min_block_count: usize,

    /// Maximum encoded key length in bytes (default: 8)
    pub max_key_length: usize,

    /// Maximum encoded value length in bytes (default: 8)
    pub max_value_length: usize,

    /// Load factor above which a full bucket is split instead of
    /// chained to an overflow bucket (default: 0.6)
    pub load_factor_overflow_limit: f32,

    /// Scratch buffer size used by the snapshot file helpers (default: 4KB)
    pub io_buffer_size: usize,
}

impl Default for ZbMapConfig {
    fn default() -> Self {
        Self {
            initial_table_size: 32,
            max_table_size: MAX_TABLE_SIZE,
            min_block_count: 16,
            max_key_length: 8,
            max_value_length: 8,
            load_factor_overflow_limit: 0.6,
            io_buffer_size: 4 * 1024, // 4KB
        }
    }
}

impl ZbMapConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the initial hash table size
    pub fn initial_table_size(mut self, size: usize) -> Self {
        self.initial_table_size = size;
        self
    }

    /// Set the maximum hash table size
    pub fn max_table_size(mut self, size: usize) -> Self {
        self.max_table_size = size;
        self
    }

    /// Set the number of maximum sized blocks a bucket must fit
    pub fn min_block_count(mut self, count: usize) -> Self {
        self.min_block_count = count;
        self
    }

    /// Set the maximum key length
    pub fn max_key_length(mut self, len: usize) -> Self {
        self.max_key_length = len;
        self
    }

    /// Set the maximum value length
    pub fn max_value_length(mut self, len: usize) -> Self {
        self.max_value_length = len;
        self
    }

    /// Set the load factor separating overflow chaining from splitting
    pub fn load_factor_overflow_limit(mut self, limit: f32) -> Self {
        self.load_factor_overflow_limit = limit;
        self
    }

    /// Set the snapshot file I/O buffer size
    pub fn io_buffer_size(mut self, size: usize) -> Self {
        self.io_buffer_size = size;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(ZbMapError::InvalidInput(msg));

        if self.initial_table_size == 0 {
            return invalid("initial table size must be positive".to_string());
        }
        if self.max_table_size > MAX_TABLE_SIZE {
            return invalid(format!(
                "max table size {} exceeds the limit of {MAX_TABLE_SIZE}",
                self.max_table_size
            ));
        }
        if self.initial_table_size.next_power_of_two() > self.max_table_size {
            return invalid(format!(
                "initial table size {} exceeds the max table size {}",
                self.initial_table_size, self.max_table_size
            ));
        }
        if self.max_key_length == 0 {
            return invalid("max key length must be positive".to_string());
        }
        if !self.load_factor_overflow_limit.is_finite() || self.load_factor_overflow_limit <= 0.0 {
            return invalid(format!(
                "load factor overflow limit must be a positive number, got {}",
                self.load_factor_overflow_limit
            ));
        }
        if self.io_buffer_size == 0 {
            return invalid("io buffer size must be positive".to_string());
        }
        Ok(())
    }

    pub(crate) fn layout(&self) -> Result<BucketLayout> {
        BucketLayout::new(
            self.min_block_count,
            self.max_key_length,
            self.max_value_length,
        )
    }
}
