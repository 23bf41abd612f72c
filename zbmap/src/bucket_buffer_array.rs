//! Bucket storage for the extendible hash map.
//!
//! Buckets live in fixed-size bucket buffers, each backed by its own
//! [`ByteStore`]. Buffers are appended and never moved. A bucket address
//! (buffer index, offset) stays valid until the array is cleared or compacted.
//! Every bucket occupies `max_bucket_len` bytes. Its blocks are packed right
//! after the header and compacted on removal.

use std::fmt;
use std::io::{Read, Write};

use rustc_hash::FxHashSet;

use crate::byte_store::{ByteStore, VecStore};
use crate::error::{Result, ZbMapError};
use crate::io::{ChunkedReader, ChunkedWriter};
use crate::layout::{
    ABANDONED_BUCKET_ID, ALLOCATION_FACTOR, BUCKET_BUFFER_HEADER_LEN, BUCKET_DATA_OFFSET,
    BucketAddress, BucketHeader, BucketLayout, MAIN_HEADER_LEN, MainHeader, OVERFLOW_BUCKET_ID,
    VALUE_LENGTH_LEN, read_u32, write_u32,
};
use crate::types::{BytesDecode, BytesEncode};

pub struct BucketBufferArray<BS: ByteStore = VecStore> {
    layout: BucketLayout,
    /// `buffers[..header.buffer_count]` are live, the rest is memory retained by `clear`
    buffers: Vec<BS>,
    header: MainHeader,
}

/// Length of the block at `block_offset`, checked against the bucket length.
fn block_len_at(layout: &BucketLayout, bucket: &[u8], block_offset: usize) -> Result<usize> {
    let length = BucketHeader::read(bucket).length as usize;
    let value_len_at = block_offset + layout.max_key_len;
    if block_offset < BUCKET_DATA_OFFSET || value_len_at + VALUE_LENGTH_LEN > length {
        return Err(ZbMapError::IndexOutOfBounds {
            index: block_offset,
            size: length,
        });
    }
    let block_len = layout.block_len(read_u32(bucket, value_len_at) as usize);
    if block_offset + block_len > length {
        return Err(ZbMapError::Corrupted(format!(
            "block at offset {block_offset} overruns its bucket of length {length}"
        )));
    }
    Ok(block_len)
}

impl<BS: ByteStore> BucketBufferArray<BS> {
    pub fn new(layout: BucketLayout) -> Result<Self> {
        let mut array = Self {
            layout,
            buffers: Vec::new(),
            header: MainHeader::default(),
        };
        array.allocate_new_bucket_buffer()?;
        Ok(array)
    }

    pub fn layout(&self) -> &BucketLayout {
        &self.layout
    }

    pub fn buffer_count(&self) -> usize {
        self.header.buffer_count as usize
    }

    pub fn bucket_count(&self) -> usize {
        self.header.bucket_count as usize
    }

    pub fn block_count(&self) -> u64 {
        self.header.block_count
    }

    pub fn max_bucket_len(&self) -> usize {
        self.layout.max_bucket_len
    }

    pub fn max_bucket_buffer_len(&self) -> usize {
        self.layout.max_bucket_buffer_len
    }

    pub fn first_block_offset(&self) -> usize {
        BUCKET_DATA_OFFSET
    }

    /// Bytes allocated for bucket buffers, retained ones included.
    pub fn capacity(&self) -> u64 {
        self.buffers.len() as u64 * self.layout.max_bucket_buffer_len as u64
    }

    /// Length of the serialized array.
    pub fn size(&self) -> u64 {
        MAIN_HEADER_LEN as u64
            + (BUCKET_BUFFER_HEADER_LEN * self.buffer_count()) as u64
            + self.bucket_count() as u64 * self.layout.max_bucket_len as u64
    }

    pub fn load_factor(&self) -> f32 {
        let buckets = self.bucket_count();
        if buckets == 0 {
            return 0.0;
        }
        self.header.block_count as f32 / (buckets * self.layout.min_block_count) as f32
    }

    /// Drops all buckets. Allocated buffers are kept and reused by later allocations.
    pub fn clear(&mut self) {
        write_u32(self.buffers[0].as_mut(), 0, 0);
        self.header = MainHeader {
            buffer_count: 1,
            bucket_count: 0,
            block_count: 0,
        };
    }

    // bucket buffers

    pub fn bucket_count_in_buffer(&self, buffer: usize) -> Result<usize> {
        if buffer >= self.buffer_count() {
            return Err(ZbMapError::IndexOutOfBounds {
                index: buffer,
                size: self.buffer_count(),
            });
        }
        Ok(read_u32(self.buffers[buffer].as_ref(), 0) as usize)
    }

    fn set_bucket_count_in_buffer(&mut self, buffer: usize, count: usize) {
        write_u32(self.buffers[buffer].as_mut(), 0, count as u32);
    }

    /// Address of the `index`th bucket of `buffer`.
    pub fn bucket_address(&self, buffer: usize, index: usize) -> Result<u64> {
        let count = self.bucket_count_in_buffer(buffer)?;
        if index >= count {
            return Err(ZbMapError::IndexOutOfBounds { index, size: count });
        }
        Ok(BucketAddress::at(buffer as u32, self.layout.bucket_offset(index) as u32).into())
    }

    /// All allocated bucket addresses in physical order, overflow and abandoned buckets included.
    pub fn bucket_addresses(&self) -> impl Iterator<Item = u64> + '_ {
        (0..self.buffer_count()).flat_map(move |buffer| {
            let count = read_u32(self.buffers[buffer].as_ref(), 0) as usize;
            (0..count).map(move |index| {
                u64::from(BucketAddress::at(
                    buffer as u32,
                    self.layout.bucket_offset(index) as u32,
                ))
            })
        })
    }

    fn allocate_new_bucket_buffer(&mut self) -> Result<()> {
        let index = self.buffer_count();
        if index >= u32::MAX as usize {
            return Err(ZbMapError::CapacityOverflow(format!(
                "bucket buffer count exceeds {}",
                u32::MAX
            )));
        }

        if index < self.buffers.len() {
            write_u32(self.buffers[index].as_mut(), 0, 0);
        } else {
            let len = self.layout.max_bucket_buffer_len;
            self.buffers.push(BS::allocate(len)?);
            tracing::debug!(buffer = index, bytes = len, "allocated bucket buffer");
        }
        self.header.buffer_count += 1;
        Ok(())
    }

    // buckets

    fn locate(&self, address: u64) -> Result<(usize, usize)> {
        let unpacked = BucketAddress::from(address);
        let buffer = unpacked.buffer() as usize;
        let offset = unpacked.offset() as usize;

        if buffer >= self.buffer_count() || offset < BUCKET_BUFFER_HEADER_LEN {
            return Err(ZbMapError::InvalidAddress(address));
        }
        let relative = offset - BUCKET_BUFFER_HEADER_LEN;
        let count = read_u32(self.buffers[buffer].as_ref(), 0) as usize;
        if relative % self.layout.max_bucket_len != 0
            || relative / self.layout.max_bucket_len >= count
        {
            return Err(ZbMapError::InvalidAddress(address));
        }
        Ok((buffer, offset))
    }

    fn bucket(&self, address: u64) -> Result<&[u8]> {
        let (buffer, offset) = self.locate(address)?;
        Ok(&self.buffers[buffer].as_ref()[offset..offset + self.layout.max_bucket_len])
    }

    fn bucket_mut(&mut self, address: u64) -> Result<&mut [u8]> {
        let (buffer, offset) = self.locate(address)?;
        let len = self.layout.max_bucket_len;
        Ok(&mut self.buffers[buffer].as_mut()[offset..offset + len])
    }

    pub fn bucket_header(&self, address: u64) -> Result<BucketHeader> {
        Ok(BucketHeader::read(self.bucket(address)?))
    }

    fn set_bucket_header(&mut self, address: u64, header: &BucketHeader) -> Result<()> {
        header.write(self.bucket_mut(address)?);
        Ok(())
    }

    pub fn bucket_fill_count(&self, address: u64) -> Result<u32> {
        Ok(self.bucket_header(address)?.fill_count)
    }

    pub fn bucket_length(&self, address: u64) -> Result<usize> {
        Ok(self.bucket_header(address)?.length as usize)
    }

    pub fn bucket_id(&self, address: u64) -> Result<u32> {
        Ok(self.bucket_header(address)?.id)
    }

    pub fn bucket_depth(&self, address: u64) -> Result<u32> {
        Ok(self.bucket_header(address)?.depth)
    }

    pub fn bucket_overflow_pointer(&self, address: u64) -> Result<u64> {
        Ok(self.bucket_header(address)?.overflow_pointer)
    }

    /// Next bucket in the overflow chain of `address`.
    pub fn next_in_chain(&self, address: u64) -> Result<Option<u64>> {
        let pointer = self.bucket_overflow_pointer(address)?;
        Ok((pointer != 0).then_some(pointer))
    }

    /// Number of overflow buckets chained behind `address`.
    pub fn bucket_overflow_count(&self, address: u64) -> Result<usize> {
        let mut count = 0;
        let mut current = address;
        while let Some(next) = self.next_in_chain(current)? {
            count += 1;
            current = next;
        }
        Ok(count)
    }

    /// Blocks stored in the bucket and its whole overflow chain.
    pub fn chain_fill_count(&self, address: u64) -> Result<u64> {
        let mut blocks = 0;
        let mut current = Some(address);
        while let Some(bucket) = current {
            let header = self.bucket_header(bucket)?;
            blocks += header.fill_count as u64;
            current = (header.overflow_pointer != 0).then_some(header.overflow_pointer);
        }
        Ok(blocks)
    }

    pub(crate) fn set_bucket_id_and_depth(&mut self, address: u64, id: u32, depth: u32) -> Result<()> {
        let mut header = self.bucket_header(address)?;
        header.id = id;
        header.depth = depth;
        self.set_bucket_header(address, &header)
    }

    /// Appends a fresh, empty bucket and returns its address.
    pub fn allocate_new_bucket(&mut self, id: u32, depth: u32) -> Result<u64> {
        let bucket_count = self.header.bucket_count.checked_add(1).ok_or_else(|| {
            ZbMapError::CapacityOverflow(format!("bucket count exceeds {}", u32::MAX))
        })?;

        let mut buffer = self.buffer_count() - 1;
        let mut index = self.bucket_count_in_buffer(buffer)?;
        if index >= ALLOCATION_FACTOR {
            self.allocate_new_bucket_buffer()?;
            buffer += 1;
            index = 0;
        }

        self.set_bucket_count_in_buffer(buffer, index + 1);
        self.header.bucket_count = bucket_count;

        let address = BucketAddress::at(buffer as u32, self.layout.bucket_offset(index) as u32).into();
        let bucket = self.bucket_mut(address)?;
        bucket.fill(0);
        BucketHeader::empty(id, depth).write(bucket);
        Ok(address)
    }

    /// Chains a new overflow bucket behind the last bucket of the chain starting at `address`.
    pub fn overflow(&mut self, address: u64) -> Result<u64> {
        let mut tail = address;
        while let Some(next) = self.next_in_chain(tail)? {
            tail = next;
        }

        let overflow = self.allocate_new_bucket(OVERFLOW_BUCKET_ID, 0)?;
        let mut header = self.bucket_header(tail)?;
        header.overflow_pointer = overflow;
        self.set_bucket_header(tail, &header)?;

        tracing::debug!(bucket = address, tail, overflow, "chained overflow bucket");
        Ok(overflow)
    }

    /// Marks an empty bucket chain as merged away.
    pub(crate) fn abandon_bucket(&mut self, address: u64) -> Result<()> {
        let mut current = Some(address);
        while let Some(bucket) = current {
            let header = self.bucket_header(bucket)?;
            if header.fill_count != 0 {
                return Err(ZbMapError::InvalidInput(format!(
                    "bucket {bucket:#x} still holds {} blocks",
                    header.fill_count
                )));
            }
            current = (header.overflow_pointer != 0).then_some(header.overflow_pointer);
            self.set_bucket_header(bucket, &BucketHeader::empty(ABANDONED_BUCKET_ID, 0))?;
        }
        Ok(())
    }

    /// Pops abandoned buckets off the physical end of the array. Trailing
    /// buffers left without buckets are freed.
    pub(crate) fn release_abandoned_tail(&mut self) -> Result<usize> {
        let mut released = 0;
        let buffer_count = self.buffer_count();
        loop {
            let buffer = self.buffer_count() - 1;
            let count = self.bucket_count_in_buffer(buffer)?;
            if count == 0 {
                if buffer == 0 {
                    break;
                }
                self.header.buffer_count -= 1;
                continue;
            }

            let last = self.bucket_address(buffer, count - 1)?;
            if !self.bucket_header(last)?.is_abandoned() {
                break;
            }
            self.set_bucket_count_in_buffer(buffer, count - 1);
            self.header.bucket_count -= 1;
            released += 1;
        }

        if self.buffer_count() < buffer_count {
            self.buffers.truncate(self.buffer_count());
            tracing::debug!(
                freed = buffer_count - self.buffer_count(),
                buffers = self.buffer_count(),
                "freed bucket buffers"
            );
        }
        if released > 0 {
            tracing::trace!(released, buckets = self.bucket_count(), "released abandoned buckets");
        }
        Ok(released)
    }

    fn last_bucket_address(&self) -> Result<u64> {
        let buffer = self.buffer_count() - 1;
        let count = self.bucket_count_in_buffer(buffer)?;
        self.bucket_address(buffer, count.saturating_sub(1))
    }

    /// Moves the bucket at `from` into the abandoned slot `to` and abandons `from`.
    fn move_bucket(&mut self, from: u64, to: u64) -> Result<()> {
        let header = self.bucket_header(from)?;
        if header.is_overflow() {
            let mut predecessor = None;
            for address in self.bucket_addresses() {
                if self.bucket_overflow_pointer(address)? == from {
                    predecessor = Some(address);
                    break;
                }
            }
            let predecessor = predecessor.ok_or_else(|| {
                ZbMapError::Corrupted(format!("overflow bucket {from:#x} is not chained"))
            })?;
            let mut chained = self.bucket_header(predecessor)?;
            chained.overflow_pointer = to;
            self.set_bucket_header(predecessor, &chained)?;
        }

        let bytes = self.bucket(from)?.to_vec();
        self.bucket_mut(to)?.copy_from_slice(&bytes);

        let bucket = self.bucket_mut(from)?;
        bucket.fill(0);
        BucketHeader::empty(ABANDONED_BUCKET_ID, 0).write(bucket);
        Ok(())
    }

    /// Fills abandoned slots with buckets taken from the physical end of the
    /// array, then releases the emptied tail.
    ///
    /// `moved` is called with the header and new address of every relocated
    /// bucket that heads a chain, overflow buckets are relinked here.
    /// Returns the number of buckets released.
    pub(crate) fn compact(&mut self, mut moved: impl FnMut(&BucketHeader, u64) -> Result<()>) -> Result<usize> {
        let mut holes = Vec::new();
        for address in self.bucket_addresses() {
            if self.bucket_header(address)?.is_abandoned() {
                holes.push(address);
            }
        }

        let mut released = self.release_abandoned_tail()?;
        for hole in holes {
            // everything from here on was popped with the tail
            if self.locate(hole).is_err() {
                break;
            }
            let tail = self.last_bucket_address()?;
            self.move_bucket(tail, hole)?;

            let header = self.bucket_header(hole)?;
            if !header.is_overflow() {
                moved(&header, hole)?;
            }
            released += self.release_abandoned_tail()?;
        }

        if released > 0 {
            tracing::debug!(released, buckets = self.bucket_count(), "compacted buckets");
        }
        Ok(released)
    }

    // blocks

    pub(crate) fn check_block(&self, key: &[u8], value: &[u8]) -> Result<()> {
        if key.len() > self.layout.max_key_len {
            return Err(ZbMapError::KeyTooLarge {
                len: key.len(),
                max: self.layout.max_key_len,
            });
        }
        if value.len() > self.layout.max_value_len {
            return Err(ZbMapError::ValueTooLarge {
                len: value.len(),
                max: self.layout.max_value_len,
            });
        }
        Ok(())
    }

    pub fn block_length(&self, address: u64, block_offset: usize) -> Result<usize> {
        block_len_at(&self.layout, self.bucket(address)?, block_offset)
    }

    pub fn block_value_length(&self, address: u64, block_offset: usize) -> Result<usize> {
        Ok(self.block_length(address, block_offset)? - self.layout.max_key_len - VALUE_LENGTH_LEN)
    }

    /// Stored key including its zero padding.
    pub fn key_bytes(&self, address: u64, block_offset: usize) -> Result<&[u8]> {
        let bucket = self.bucket(address)?;
        block_len_at(&self.layout, bucket, block_offset)?;
        Ok(&bucket[block_offset..block_offset + self.layout.max_key_len])
    }

    pub fn value_bytes(&self, address: u64, block_offset: usize) -> Result<&[u8]> {
        let bucket = self.bucket(address)?;
        let block_len = block_len_at(&self.layout, bucket, block_offset)?;
        let value_start = block_offset + self.layout.max_key_len + VALUE_LENGTH_LEN;
        Ok(&bucket[value_start..block_offset + block_len])
    }

    /// Compares an encoded key with a stored, zero padded one.
    pub fn key_equals(&self, address: u64, block_offset: usize, key: &[u8]) -> Result<bool> {
        let stored = self.key_bytes(address, block_offset)?;
        Ok(key.len() <= stored.len()
            && stored[..key.len()] == *key
            && stored[key.len()..].iter().all(|b| *b == 0))
    }

    pub fn read_key<'a, K>(&'a self, address: u64, block_offset: usize) -> Result<<K as BytesDecode<'a>>::DItem>
    where
        K: BytesEncode<'a> + BytesDecode<'a>,
    {
        let stored = self.key_bytes(address, block_offset)?;
        K::bytes_decode(K::unpad(stored)).map_err(|e| ZbMapError::Decoding(e.to_string()))
    }

    pub fn read_value<'a, V>(&'a self, address: u64, block_offset: usize) -> Result<<V as BytesDecode<'a>>::DItem>
    where
        V: BytesDecode<'a>,
    {
        let value = self.value_bytes(address, block_offset)?;
        V::bytes_decode(value).map_err(|e| ZbMapError::Decoding(e.to_string()))
    }

    /// Appends a block to the first bucket of the chain with enough room.
    ///
    /// Returns `false` when no bucket of the chain fits the block.
    pub fn add_block(&mut self, address: u64, key: &[u8], value: &[u8]) -> Result<bool> {
        self.check_block(key, value)?;

        let mut current = Some(address);
        while let Some(bucket) = current {
            if self.append_block(bucket, key, value)? {
                self.header.block_count += 1;
                return Ok(true);
            }
            current = self.next_in_chain(bucket)?;
        }
        Ok(false)
    }

    fn append_block(&mut self, address: u64, key: &[u8], value: &[u8]) -> Result<bool> {
        let layout = self.layout;
        let bucket = self.bucket_mut(address)?;
        let mut header = BucketHeader::read(bucket);

        let start = header.length as usize;
        let block_len = layout.block_len(value.len());
        if start + block_len > layout.max_bucket_len {
            return Ok(false);
        }

        let value_len_at = start + layout.max_key_len;
        bucket[start..value_len_at].fill(0);
        bucket[start..start + key.len()].copy_from_slice(key);
        write_u32(bucket, value_len_at, value.len() as u32);
        bucket[value_len_at + VALUE_LENGTH_LEN..start + block_len].copy_from_slice(value);

        header.fill_count += 1;
        header.length += block_len as u32;
        header.write(bucket);
        Ok(true)
    }

    fn append_raw_block(&mut self, address: u64, block: &[u8]) -> Result<bool> {
        let max_bucket_len = self.layout.max_bucket_len;
        let bucket = self.bucket_mut(address)?;
        let mut header = BucketHeader::read(bucket);

        let start = header.length as usize;
        if start + block.len() > max_bucket_len {
            return Ok(false);
        }
        bucket[start..start + block.len()].copy_from_slice(block);

        header.fill_count += 1;
        header.length += block.len() as u32;
        header.write(bucket);
        Ok(true)
    }

    /// Replaces the value of a block in place, moving the rest of the bucket.
    ///
    /// Returns `false`, leaving the bucket untouched, when a larger value does
    /// not fit the bucket.
    pub fn update_value(&mut self, address: u64, block_offset: usize, value: &[u8]) -> Result<bool> {
        let layout = self.layout;
        if value.len() > layout.max_value_len {
            return Err(ZbMapError::ValueTooLarge {
                len: value.len(),
                max: layout.max_value_len,
            });
        }

        let block_len = self.block_length(address, block_offset)?;
        let bucket = self.bucket_mut(address)?;
        let mut header = BucketHeader::read(bucket);

        let end = header.length as usize;
        let value_len_at = block_offset + layout.max_key_len;
        let value_start = value_len_at + VALUE_LENGTH_LEN;
        let old_end = block_offset + block_len;
        let new_end = value_start + value.len();
        let new_length = end - old_end + new_end;
        if new_length > layout.max_bucket_len {
            return Ok(false);
        }

        bucket.copy_within(old_end..end, new_end);
        if new_length < end {
            bucket[new_length..end].fill(0);
        }
        bucket[value_start..new_end].copy_from_slice(value);
        write_u32(bucket, value_len_at, value.len() as u32);

        header.length = new_length as u32;
        header.write(bucket);
        Ok(true)
    }

    /// Removes a block and returns the new fill count of its bucket.
    pub fn remove_block(&mut self, address: u64, block_offset: usize) -> Result<u32> {
        let fill_count = self.remove_block_from_bucket(address, block_offset)?;
        self.header.block_count -= 1;
        Ok(fill_count)
    }

    fn remove_block_from_bucket(&mut self, address: u64, block_offset: usize) -> Result<u32> {
        let block_len = self.block_length(address, block_offset)?;
        let bucket = self.bucket_mut(address)?;
        let mut header = BucketHeader::read(bucket);

        let end = header.length as usize;
        bucket.copy_within(block_offset + block_len..end, block_offset);
        bucket[end - block_len..end].fill(0);

        header.fill_count = header.fill_count.checked_sub(1).ok_or_else(|| {
            ZbMapError::Corrupted(format!("bucket {address:#x} holds a block but has no fill count"))
        })?;
        header.length -= block_len as u32;
        header.write(bucket);
        Ok(header.fill_count)
    }

    /// Moves a block into the chain of `destination`, chaining a new overflow
    /// bucket if no bucket of that chain has room. Returns where the block went.
    pub fn relocate_block(&mut self, source: u64, block_offset: usize, destination: u64) -> Result<u64> {
        let block_len = self.block_length(source, block_offset)?;
        let block = self.bucket(source)?[block_offset..block_offset + block_len].to_vec();

        let mut target = destination;
        while !self.append_raw_block(target, &block)? {
            target = match self.next_in_chain(target)? {
                Some(next) => next,
                None => self.overflow(target)?,
            };
        }

        self.remove_block_from_bucket(source, block_offset)?;
        Ok(target)
    }

    // stream I/O

    /// Writes the array through `scratch` and returns the number of bytes written.
    pub fn write_to<W: Write>(&self, writer: W, scratch: &mut [u8]) -> Result<u64> {
        let mut writer = ChunkedWriter::new(writer, scratch)?;
        self.write_chunked(&mut writer)?;
        writer.flush()?;
        Ok(writer.written())
    }

    pub(crate) fn write_chunked<W: Write>(&self, writer: &mut ChunkedWriter<'_, W>) -> Result<()> {
        writer.write_all(&self.header.to_bytes())?;
        for buffer in &self.buffers[..self.buffer_count()] {
            let bytes = buffer.as_ref();
            let count = read_u32(bytes, 0) as usize;
            writer.write_all(&bytes[..self.layout.used_buffer_len(count)])?;
        }
        Ok(())
    }

    /// Replaces the content of this array with the one read from `reader`.
    ///
    /// On failure the array is left as it was.
    pub fn read_from<R: Read>(&mut self, reader: R, scratch: &mut [u8]) -> Result<()> {
        let mut reader = ChunkedReader::new(reader, scratch)?;
        *self = Self::read_chunked(self.layout, &mut reader)?;
        Ok(())
    }

    pub(crate) fn read_chunked<R: Read>(layout: BucketLayout, reader: &mut ChunkedReader<'_, R>) -> Result<Self> {
        let mut raw = [0u8; MAIN_HEADER_LEN];
        reader.read_exact(&mut raw)?;
        let header = MainHeader::read(&raw);

        let buffer_count = header.buffer_count as usize;
        if buffer_count == 0 {
            return Err(ZbMapError::Corrupted("no bucket buffer in stream".to_string()));
        }

        let mut array = Self {
            layout,
            buffers: Vec::with_capacity(buffer_count.min(ALLOCATION_FACTOR)),
            header: MainHeader::default(),
        };
        let mut bucket_count = 0usize;
        for buffer in 0..buffer_count {
            array.allocate_new_bucket_buffer()?;
            let bytes = array.buffers[buffer].as_mut();
            reader.read_exact(&mut bytes[..BUCKET_BUFFER_HEADER_LEN])?;

            let count = read_u32(bytes, 0) as usize;
            let is_last = buffer + 1 == buffer_count;
            if count > ALLOCATION_FACTOR || (!is_last && count != ALLOCATION_FACTOR) {
                return Err(ZbMapError::Corrupted(format!(
                    "bucket buffer {buffer} of {buffer_count} holds {count} buckets"
                )));
            }
            reader.read_exact(&mut bytes[BUCKET_BUFFER_HEADER_LEN..layout.used_buffer_len(count)])?;
            bucket_count += count;
        }

        if bucket_count != header.bucket_count as usize {
            return Err(ZbMapError::Corrupted(format!(
                "header counts {} buckets, buffers hold {bucket_count}",
                header.bucket_count
            )));
        }
        array.header = header;
        array.validate()?;

        tracing::debug!(
            buffers = buffer_count,
            buckets = bucket_count,
            blocks = header.block_count,
            "read bucket buffers"
        );
        Ok(array)
    }

    /// Checks every bucket of a freshly read array.
    fn validate(&self) -> Result<()> {
        let mut blocks = 0u64;
        let mut chained = FxHashSet::default();
        let mut heads = Vec::new();
        let mut overflow_buckets = 0usize;

        for address in self.bucket_addresses() {
            let header = self.bucket_header(address)?;
            if header.is_overflow() {
                overflow_buckets += 1;
            } else if !header.is_abandoned() {
                heads.push(address);
            }
            let length = header.length as usize;
            if length < BUCKET_DATA_OFFSET || length > self.layout.max_bucket_len {
                return Err(ZbMapError::Corrupted(format!(
                    "bucket {address:#x} has length {length}"
                )));
            }

            let mut offset = BUCKET_DATA_OFFSET;
            let mut fill_count = 0u32;
            while offset < length {
                offset += self.block_length(address, offset).map_err(|e| {
                    ZbMapError::Corrupted(format!("bucket {address:#x}: {e}"))
                })?;
                fill_count += 1;
            }
            if fill_count != header.fill_count {
                return Err(ZbMapError::Corrupted(format!(
                    "bucket {address:#x} holds {fill_count} blocks but counts {}",
                    header.fill_count
                )));
            }

            let pointer = header.overflow_pointer;
            if pointer != 0 {
                let target = self.bucket_header(pointer).map_err(|_| {
                    ZbMapError::Corrupted(format!("bucket {address:#x} overflows to {pointer:#x}"))
                })?;
                if !target.is_overflow() || !chained.insert(pointer) {
                    return Err(ZbMapError::Corrupted(format!(
                        "bucket {address:#x} overflows to {pointer:#x} which is not a free overflow bucket"
                    )));
                }
            }
            blocks += fill_count as u64;
        }

        if blocks != self.header.block_count {
            return Err(ZbMapError::Corrupted(format!(
                "header counts {} blocks, buckets hold {blocks}",
                self.header.block_count
            )));
        }

        // pointers have been checked to hit each overflow bucket at most once,
        // so a chain walked from a head cannot cycle
        let mut reachable = 0usize;
        for head in heads {
            let mut current = head;
            while let Some(next) = self.next_in_chain(current)? {
                reachable += 1;
                current = next;
            }
        }
        if reachable != overflow_buckets {
            return Err(ZbMapError::Corrupted(format!(
                "{} of {overflow_buckets} overflow buckets are not chained to a bucket",
                overflow_buckets - reachable
            )));
        }
        Ok(())
    }
}

impl<BS: ByteStore> fmt::Display for BucketBufferArray<BS> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for address in self.bucket_addresses() {
            let header = self.bucket_header(address).map_err(|_| fmt::Error)?;
            let overflow = self.bucket_overflow_count(address).map_err(|_| fmt::Error)?;
            match header.id {
                OVERFLOW_BUCKET_ID => write!(f, "Overflow-Bucket")?,
                ABANDONED_BUCKET_ID => write!(f, "Abandoned-Bucket")?,
                id => write!(f, "Bucket-{id}")?,
            }
            writeln!(
                f,
                " [depth: {}, blocks: {}, overflow: {overflow}]",
                header.depth, header.fill_count
            )?;
        }
        Ok(())
    }
}
