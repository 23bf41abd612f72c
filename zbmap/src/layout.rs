//! Byte layout of the bucket buffers.
//!
//! ```text
//! main header      | buffer_count: u32 | bucket_count: u32 | block_count: u64 |
//! bucket buffer    | bucket_count: u32 | bucket 0 | bucket 1 | ... | bucket 31 |
//! bucket           | fill_count: u32 | id: u32 | depth: u32 | length: u32 | overflow: u64 | blocks.. |
//! block            | key (zero padded to max key length) | value_length: u32 | value |
//! ```
//!
//! Every integer is stored little-endian.

use bytemuck::{Pod, Zeroable};
use modular_bitfield::prelude::*;

use crate::error::{Result, ZbMapError};

/// Number of bucket slots in every bucket buffer.
pub const ALLOCATION_FACTOR: usize = 32;

/// Id carried by overflow buckets, they never own directory slots.
pub const OVERFLOW_BUCKET_ID: u32 = u32::MAX;

/// Id carried by buckets whose directory slots were merged into their buddy.
pub const ABANDONED_BUCKET_ID: u32 = u32::MAX - 1;

pub const MAIN_HEADER_LEN: usize = 16;
pub const BUCKET_BUFFER_HEADER_LEN: usize = 4;
pub const BUCKET_HEADER_LEN: usize = 24;
pub const BUCKET_DATA_OFFSET: usize = BUCKET_HEADER_LEN;
pub const VALUE_LENGTH_LEN: usize = 4;

/// A single buffer must stay addressable with signed 32-bit offsets.
pub const MAX_BUFFER_LEN: usize = i32::MAX as usize;

/// Largest directory whose byte length still fits in `MAX_BUFFER_LEN`.
pub const MAX_TABLE_SIZE: usize = 1 << 27;

#[bitfield]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketAddress {
    pub offset: B32,
    pub buffer: B32,
}

impl BucketAddress {
    pub fn at(buffer: u32, offset: u32) -> Self {
        BucketAddress::new().with_buffer(buffer).with_offset(offset)
    }
}

impl From<BucketAddress> for u64 {
    fn from(address: BucketAddress) -> u64 {
        u64::from_le_bytes(address.into_bytes())
    }
}

impl From<u64> for BucketAddress {
    fn from(value: u64) -> Self {
        BucketAddress::from_bytes(value.to_le_bytes())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct MainHeader {
    pub buffer_count: u32,
    pub bucket_count: u32,
    pub block_count: u64,
}

impl MainHeader {
    pub fn read(bytes: &[u8]) -> Self {
        let raw: MainHeader = bytemuck::pod_read_unaligned(&bytes[..MAIN_HEADER_LEN]);
        MainHeader {
            buffer_count: u32::from_le(raw.buffer_count),
            bucket_count: u32::from_le(raw.bucket_count),
            block_count: u64::from_le(raw.block_count),
        }
    }

    pub fn to_bytes(&self) -> [u8; MAIN_HEADER_LEN] {
        let le = MainHeader {
            buffer_count: self.buffer_count.to_le(),
            bucket_count: self.bucket_count.to_le(),
            block_count: self.block_count.to_le(),
        };
        bytemuck::cast(le)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct BucketHeader {
    pub fill_count: u32,
    pub id: u32,
    pub depth: u32,
    /// used bytes including this header
    pub length: u32,
    pub overflow_pointer: u64,
}

impl BucketHeader {
    pub fn empty(id: u32, depth: u32) -> Self {
        BucketHeader {
            fill_count: 0,
            id,
            depth,
            length: BUCKET_DATA_OFFSET as u32,
            overflow_pointer: 0,
        }
    }

    pub fn read(bytes: &[u8]) -> Self {
        let raw: BucketHeader = bytemuck::pod_read_unaligned(&bytes[..BUCKET_HEADER_LEN]);
        BucketHeader {
            fill_count: u32::from_le(raw.fill_count),
            id: u32::from_le(raw.id),
            depth: u32::from_le(raw.depth),
            length: u32::from_le(raw.length),
            overflow_pointer: u64::from_le(raw.overflow_pointer),
        }
    }

    pub fn write(&self, bytes: &mut [u8]) {
        let le = BucketHeader {
            fill_count: self.fill_count.to_le(),
            id: self.id.to_le(),
            depth: self.depth.to_le(),
            length: self.length.to_le(),
            overflow_pointer: self.overflow_pointer.to_le(),
        };
        bytes[..BUCKET_HEADER_LEN].copy_from_slice(bytemuck::bytes_of(&le));
    }

    pub fn is_overflow(&self) -> bool {
        self.id == OVERFLOW_BUCKET_ID
    }

    pub fn is_abandoned(&self) -> bool {
        self.id == ABANDONED_BUCKET_ID
    }
}

pub(crate) fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le(bytemuck::pod_read_unaligned(&bytes[at..at + 4]))
}

pub(crate) fn write_u32(bytes: &mut [u8], at: usize, value: u32) {
    bytes[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

/// Sizes derived from the configured block geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketLayout {
    pub min_block_count: usize,
    pub max_key_len: usize,
    pub max_value_len: usize,
    pub max_block_len: usize,
    pub max_bucket_len: usize,
    pub max_bucket_buffer_len: usize,
}

impl BucketLayout {
    pub fn new(min_block_count: usize, max_key_len: usize, max_value_len: usize) -> Result<Self> {
        if min_block_count == 0 {
            return Err(ZbMapError::InvalidInput(
                "a bucket must hold at least one block".to_string(),
            ));
        }

        let overflow = || {
            ZbMapError::CapacityOverflow(format!(
                "{min_block_count} blocks of key length {max_key_len} and value length {max_value_len} exceed {MAX_BUFFER_LEN} bytes per buffer"
            ))
        };

        let max_block_len = max_key_len
            .checked_add(VALUE_LENGTH_LEN)
            .and_then(|len| len.checked_add(max_value_len))
            .ok_or_else(overflow)?;
        let max_bucket_len = min_block_count
            .checked_mul(max_block_len)
            .and_then(|len| len.checked_add(BUCKET_HEADER_LEN))
            .ok_or_else(overflow)?;
        let max_bucket_buffer_len = ALLOCATION_FACTOR
            .checked_mul(max_bucket_len)
            .and_then(|len| len.checked_add(BUCKET_BUFFER_HEADER_LEN))
            .filter(|len| *len <= MAX_BUFFER_LEN)
            .ok_or_else(overflow)?;

        Ok(Self {
            min_block_count,
            max_key_len,
            max_value_len,
            max_block_len,
            max_bucket_len,
            max_bucket_buffer_len,
        })
    }

    /// Length of a block holding a value of `value_len` bytes.
    pub fn block_len(&self, value_len: usize) -> usize {
        self.max_key_len + VALUE_LENGTH_LEN + value_len
    }

    /// Offset of the `index`th bucket slot inside its buffer.
    pub fn bucket_offset(&self, index: usize) -> usize {
        BUCKET_BUFFER_HEADER_LEN + index * self.max_bucket_len
    }

    /// Bytes of a buffer holding `bucket_count` buckets that carry data.
    pub fn used_buffer_len(&self, bucket_count: usize) -> usize {
        self.bucket_offset(bucket_count)
    }
}
