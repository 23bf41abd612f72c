use std::marker::PhantomData;

use crate::bucket_buffer_array::BucketBufferArray;
use crate::byte_store::{ByteStore, VecStore};
use crate::config::ZbMapConfig;
use crate::error::{Result, ZbMapError};
use crate::hash_table::HashTable;
use crate::iter::{Iter, Keys, Values};
use crate::layout::BUCKET_DATA_OFFSET;
use crate::types::{Bytes, BytesDecode, BytesEncode, CowBytes, Native, Str};

pub type U64U64Map<BS = VecStore> = ZbMap<Native<u64>, Native<u64>, BS>;
pub type U64BytesMap<BS = VecStore> = ZbMap<Native<u64>, Bytes, BS>;
pub type BytesBytesMap<BS = VecStore> = ZbMap<Bytes, Bytes, BS>;
pub type StringU64Map<BS = VecStore> = ZbMap<Str, Native<u64>, BS>;
pub type U64StringMap<BS = VecStore> = ZbMap<Native<u64>, Str, BS>;

/// Extendible hash map storing its records in bucket buffers outside of the
/// usual collection machinery.
///
/// Keys and values are converted with the `BytesEncode`/`BytesDecode` codecs
/// `K` and `V`. A key hashes into the directory (`HashTable`), which points at
/// a bucket; a full bucket is either split, doubling the directory when
/// needed, or chained to an overflow bucket, depending on the load factor.
pub struct ZbMap<K, V, BS: ByteStore = VecStore> {
    config: ZbMapConfig,
    initial_table_size: usize,
    table: HashTable,
    buckets: BucketBufferArray<BS>,
    mod_count: u64,
    _marker: PhantomData<(K, V)>,
}

impl<K, V, BS: ByteStore> ZbMap<K, V, BS> {
    pub fn new(config: ZbMapConfig) -> Result<Self> {
        config.validate()?;
        let layout = config.layout()?;

        let mut buckets = BucketBufferArray::new(layout)?;
        let address = buckets.allocate_new_bucket(0, 0)?;
        let mut table = HashTable::new(config.initial_table_size)?;
        table.update_table(1, 0, address)?;

        tracing::debug!(
            table_size = table.size(),
            max_bucket_len = layout.max_bucket_len,
            max_key_len = layout.max_key_len,
            max_value_len = layout.max_value_len,
            "created map"
        );

        Ok(Self {
            initial_table_size: table.size(),
            config,
            table,
            buckets,
            mod_count: 0,
            _marker: PhantomData,
        })
    }

    /// Number of records in the map.
    pub fn len(&self) -> usize {
        self.buckets.block_count() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.block_count() == 0
    }

    pub fn table_size(&self) -> usize {
        self.table.size()
    }

    /// Allocated buckets, overflow buckets included.
    pub fn bucket_count(&self) -> usize {
        self.buckets.bucket_count()
    }

    pub fn load_factor(&self) -> f32 {
        self.buckets.load_factor()
    }

    pub fn config(&self) -> &ZbMapConfig {
        &self.config
    }

    /// Bumped by every mutation, iterators compare against it.
    pub fn mod_count(&self) -> u64 {
        self.mod_count
    }

    pub fn table(&self) -> &HashTable {
        &self.table
    }

    pub fn buckets(&self) -> &BucketBufferArray<BS> {
        &self.buckets
    }

    /// Removes every record. Bucket buffers stay allocated for reuse.
    pub fn clear(&mut self) -> Result<()> {
        self.buckets.clear();
        let address = self.buckets.allocate_new_bucket(0, 0)?;
        self.table.clear(self.initial_table_size, address)?;
        self.mod_count += 1;
        Ok(())
    }

    /// Releases the bucket buffers.
    pub fn close(self) {
        tracing::debug!(
            buffers = self.buckets.buffer_count(),
            bytes = self.buckets.capacity(),
            "closing map"
        );
    }

    /// Swaps in state read from a snapshot.
    pub(crate) fn restore(&mut self, table: HashTable, buckets: BucketBufferArray<BS>) {
        self.table = table;
        self.buckets = buckets;
        self.mod_count += 1;
    }

    fn bucket_address_for(&self, hash: u64) -> Result<u64> {
        let index = hash & (self.table.size() as u64 - 1);
        self.table.get_bucket_address(index as usize)
    }
}

impl<K, V, BS> ZbMap<K, V, BS>
where
    K: for<'a> BytesEncode<'a> + for<'a> BytesDecode<'a>,
    V: for<'a> BytesEncode<'a> + for<'a> BytesDecode<'a>,
    BS: ByteStore,
{
    fn encode_key<'a>(&self, key: &'a <K as BytesEncode<'a>>::EItem) -> Result<CowBytes<'a>> {
        let key_bytes = K::bytes_encode(key)?;
        let max = self.buckets.layout().max_key_len;
        if key_bytes.len() > max {
            return Err(ZbMapError::KeyTooLarge {
                len: key_bytes.len(),
                max,
            });
        }
        Ok(key_bytes)
    }

    fn hash_of(key_bytes: &[u8]) -> u64 {
        <K as BytesEncode>::hash_code(key_bytes)
    }

    fn find_block(&self, key: &[u8], hash: u64) -> Result<Option<(u64, usize)>> {
        self.find_block_where(key, hash, |_, _| Ok(true))
    }

    /// Scans the chain `hash` maps to for a block holding `key` that `accept` agrees with.
    fn find_block_where(
        &self,
        key: &[u8],
        hash: u64,
        mut accept: impl FnMut(u64, usize) -> Result<bool>,
    ) -> Result<Option<(u64, usize)>> {
        let mut current = Some(self.bucket_address_for(hash)?);
        while let Some(address) = current {
            let length = self.buckets.bucket_length(address)?;
            let mut offset = BUCKET_DATA_OFFSET;
            while offset < length {
                if self.buckets.key_equals(address, offset, key)? && accept(address, offset)? {
                    return Ok(Some((address, offset)));
                }
                offset += self.buckets.block_length(address, offset)?;
            }
            current = self.buckets.next_in_chain(address)?;
        }
        Ok(None)
    }

    /// Get a value by key
    pub fn get<'a>(
        &self,
        key: &'a <K as BytesEncode<'a>>::EItem,
    ) -> Result<Option<<V as BytesDecode<'_>>::DItem>> {
        let key_bytes = self.encode_key(key)?;
        match self.find_block(&key_bytes, Self::hash_of(&key_bytes))? {
            Some((address, offset)) => self.buckets.read_value::<V>(address, offset).map(Some),
            None => Ok(None),
        }
    }

    pub fn contains_key<'a>(&self, key: &'a <K as BytesEncode<'a>>::EItem) -> Result<bool> {
        let key_bytes = self.encode_key(key)?;
        Ok(self
            .find_block(&key_bytes, Self::hash_of(&key_bytes))?
            .is_some())
    }

    /// Inserts or replaces a record. Returns `true` when an existing value was replaced.
    pub fn put<'a>(
        &mut self,
        key: &'a <K as BytesEncode<'a>>::EItem,
        value: &'a <V as BytesEncode<'a>>::EItem,
    ) -> Result<bool> {
        let key_bytes = K::bytes_encode(key)?;
        let value_bytes = V::bytes_encode(value)?;
        self.buckets.check_block(&key_bytes, &value_bytes)?;

        let replaced = self.put_bytes(&key_bytes, &value_bytes)?;
        self.mod_count += 1;
        Ok(replaced)
    }

    fn put_bytes(&mut self, key: &[u8], value: &[u8]) -> Result<bool> {
        let hash = Self::hash_of(key);

        let Some((address, offset)) = self.find_block(key, hash)? else {
            self.insert_block(key, value, hash)?;
            return Ok(false);
        };

        if !self.buckets.update_value(address, offset, value)? {
            // the grown record goes to another bucket of the chain before the old one is dropped
            self.insert_block(key, value, hash)?;
            let stale = self.find_block_where(key, hash, |address, offset| {
                Ok(self.buckets.block_value_length(address, offset)? != value.len())
            })?;
            let (address, offset) = stale.ok_or_else(|| {
                ZbMapError::Corrupted("replaced record vanished from its bucket chain".to_string())
            })?;
            self.buckets.remove_block(address, offset)?;
        }
        Ok(true)
    }

    fn insert_block(&mut self, key: &[u8], value: &[u8], hash: u64) -> Result<()> {
        loop {
            let address = self.bucket_address_for(hash)?;
            if self.buckets.add_block(address, key, value)? {
                return Ok(());
            }

            if self.buckets.load_factor() > self.config.load_factor_overflow_limit {
                self.split_bucket(address)?;
            } else {
                self.mod_count += 1;
                self.buckets.overflow(address)?;
            }
        }
    }

    /// Splits a bucket and its overflow chain by the next hash bit.
    fn split_bucket(&mut self, address: u64) -> Result<()> {
        let id = self.buckets.bucket_id(address)?;
        let depth = self.buckets.bucket_depth(address)?;
        let new_depth = depth + 1;
        let new_id = id | (1 << depth);

        let required = 1usize << new_depth;
        if required > self.config.max_table_size {
            return Err(ZbMapError::MapFull {
                max_table_size: self.config.max_table_size,
            });
        }

        // a later split of the same put may still fail, iterators must see this one
        self.mod_count += 1;
        if required > self.table.size() {
            self.table.resize(required)?;
        }

        let new_address = self.buckets.allocate_new_bucket(new_id, new_depth)?;
        self.buckets.set_bucket_id_and_depth(address, id, new_depth)?;

        let bit = 1u64 << depth;
        let mut moved = 0usize;
        let mut current = Some(address);
        while let Some(bucket) = current {
            let mut offset = BUCKET_DATA_OFFSET;
            while offset < self.buckets.bucket_length(bucket)? {
                let hash = Self::hash_of(self.buckets.key_bytes(bucket, offset)?);
                if hash & bit != 0 {
                    // the following block slides into `offset`
                    self.buckets.relocate_block(bucket, offset, new_address)?;
                    moved += 1;
                } else {
                    offset += self.buckets.block_length(bucket, offset)?;
                }
            }
            current = self.buckets.next_in_chain(bucket)?;
        }

        self.table
            .update_table(1 << new_depth, new_id as usize, new_address)?;

        tracing::debug!(id, new_id, depth = new_depth, moved, "split bucket");
        Ok(())
    }

    /// Removes a record. Returns `false` when the key was absent.
    pub fn remove<'a>(&mut self, key: &'a <K as BytesEncode<'a>>::EItem) -> Result<bool> {
        let key_bytes = self.encode_key(key)?;
        let hash = Self::hash_of(&key_bytes);

        let Some((address, offset)) = self.find_block(&key_bytes, hash)? else {
            return Ok(false);
        };
        self.buckets.remove_block(address, offset)?;
        self.mod_count += 1;

        let head = self.bucket_address_for(hash)?;
        if self.merge_bucket(head)? {
            self.shrink_table()?;
            let table = &mut self.table;
            self.buckets.compact(|header, address| {
                table.update_table(1 << header.depth, header.id as usize, address)
            })?;
        }
        Ok(true)
    }

    /// Folds an empty bucket into its buddy, repeating while the merged bucket
    /// is empty as well. Returns whether anything was merged.
    fn merge_bucket(&mut self, address: u64) -> Result<bool> {
        let mut merged = false;
        let mut address = address;
        loop {
            let depth = self.buckets.bucket_depth(address)?;
            if depth == 0 || self.buckets.chain_fill_count(address)? != 0 {
                return Ok(merged);
            }

            let id = self.buckets.bucket_id(address)?;
            let half = 1u32 << (depth - 1);
            let buddy_id = id ^ half;
            let buddy = self.table.get_bucket_address(buddy_id as usize)?;
            if self.buckets.bucket_depth(buddy)? != depth {
                return Ok(merged);
            }

            self.table.update_table(1 << depth, id as usize, buddy)?;
            self.buckets
                .set_bucket_id_and_depth(buddy, buddy_id & !half, depth - 1)?;
            self.buckets.abandon_bucket(address)?;
            tracing::debug!(id, buddy_id, depth = depth - 1, "merged bucket");

            merged = true;
            address = buddy;
        }
    }

    /// Halves the directory down to the deepest live bucket, never below the initial size.
    fn shrink_table(&mut self) -> Result<()> {
        if self.table.size() <= self.initial_table_size {
            return Ok(());
        }

        let mut max_depth = 0;
        for address in self.buckets.bucket_addresses() {
            let header = self.buckets.bucket_header(address)?;
            if !header.is_overflow() && !header.is_abandoned() {
                max_depth = max_depth.max(header.depth);
            }
        }

        let required = (1usize << max_depth).max(self.initial_table_size);
        if required < self.table.size() {
            self.table.resize(required)?;
        }
        Ok(())
    }

    /// Iterates over all records in bucket order.
    pub fn iter(&self) -> Iter<'_, K, V, BS> {
        Iter::new(self)
    }

    pub fn keys(&self) -> Keys<'_, K, V, BS> {
        Keys::new(self.iter())
    }

    pub fn values(&self) -> Values<'_, K, V, BS> {
        Values::new(self.iter())
    }
}
