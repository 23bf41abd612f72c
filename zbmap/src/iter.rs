use std::marker::PhantomData;

use crate::bucket_buffer_array::BucketBufferArray;
use crate::byte_store::ByteStore;
use crate::error::{Result, ZbMapError};
use crate::layout::BUCKET_DATA_OFFSET;
use crate::types::{BytesDecode, BytesEncode};
use crate::zb_map::ZbMap;

type Entry<'m, K, V> = (<K as BytesDecode<'m>>::DItem, <V as BytesDecode<'m>>::DItem);

/// Detached cursor over the records of a [`ZbMap`].
///
/// The cursor keeps no borrow of the map, every call takes the map again.
/// Buckets are visited in allocation order, overflow buckets included, so
/// every record is produced exactly once. Any mutation of the map after
/// [`reset`](Self::reset) makes the cursor fail with
/// [`ZbMapError::ConcurrentModification`].
pub struct ZbMapIterator<K, V> {
    buffer: usize,
    bucket: usize,
    offset: usize,
    expected_mod_count: u64,
    _marker: PhantomData<(K, V)>,
}

impl<K, V> ZbMapIterator<K, V>
where
    K: for<'a> BytesEncode<'a> + for<'a> BytesDecode<'a>,
    V: for<'a> BytesDecode<'a>,
{
    pub fn new<BS: ByteStore>(map: &ZbMap<K, V, BS>) -> Self {
        Self {
            buffer: 0,
            bucket: 0,
            offset: BUCKET_DATA_OFFSET,
            expected_mod_count: map.mod_count(),
            _marker: PhantomData,
        }
    }

    /// Restarts from the first record and accepts the map's current state.
    pub fn reset<BS: ByteStore>(&mut self, map: &ZbMap<K, V, BS>) {
        self.buffer = 0;
        self.bucket = 0;
        self.offset = BUCKET_DATA_OFFSET;
        self.expected_mod_count = map.mod_count();
    }

    fn check_mod_count<BS: ByteStore>(&self, map: &ZbMap<K, V, BS>) -> Result<()> {
        if map.mod_count() != self.expected_mod_count {
            return Err(ZbMapError::ConcurrentModification);
        }
        Ok(())
    }

    /// Moves to the next block at or after the current position.
    fn seek<BS: ByteStore>(&mut self, buckets: &BucketBufferArray<BS>) -> Result<Option<(u64, usize)>> {
        while self.buffer < buckets.buffer_count() {
            let count = buckets.bucket_count_in_buffer(self.buffer)?;
            while self.bucket < count {
                let address = buckets.bucket_address(self.buffer, self.bucket)?;
                if self.offset < buckets.bucket_length(address)? {
                    return Ok(Some((address, self.offset)));
                }
                self.bucket += 1;
                self.offset = BUCKET_DATA_OFFSET;
            }
            self.buffer += 1;
            self.bucket = 0;
        }
        Ok(None)
    }

    pub fn has_next<BS: ByteStore>(&mut self, map: &ZbMap<K, V, BS>) -> Result<bool> {
        self.check_mod_count(map)?;
        Ok(self.seek(map.buckets())?.is_some())
    }

    pub fn next<'m, BS: ByteStore>(&mut self, map: &'m ZbMap<K, V, BS>) -> Result<Option<Entry<'m, K, V>>> {
        self.check_mod_count(map)?;
        let buckets = map.buckets();
        let Some((address, offset)) = self.seek(buckets)? else {
            return Ok(None);
        };

        let key = buckets.read_key::<K>(address, offset)?;
        let value = buckets.read_value::<V>(address, offset)?;
        self.offset += buckets.block_length(address, offset)?;
        Ok(Some((key, value)))
    }

    pub fn remove(&mut self) -> Result<()> {
        Err(ZbMapError::Unsupported("remove is not supported by the map iterator"))
    }
}

/// Borrowing iterator returned by [`ZbMap::iter`].
pub struct Iter<'m, K, V, BS: ByteStore> {
    map: &'m ZbMap<K, V, BS>,
    cursor: ZbMapIterator<K, V>,
    done: bool,
}

impl<'m, K, V, BS> Iter<'m, K, V, BS>
where
    K: for<'a> BytesEncode<'a> + for<'a> BytesDecode<'a>,
    V: for<'a> BytesDecode<'a>,
    BS: ByteStore,
{
    pub(crate) fn new(map: &'m ZbMap<K, V, BS>) -> Self {
        Self {
            map,
            cursor: ZbMapIterator::new(map),
            done: false,
        }
    }
}

impl<'m, K, V, BS> Iterator for Iter<'m, K, V, BS>
where
    K: for<'a> BytesEncode<'a> + for<'a> BytesDecode<'a>,
    V: for<'a> BytesDecode<'a>,
    BS: ByteStore,
{
    type Item = Result<Entry<'m, K, V>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.cursor.next(self.map) {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

pub struct Keys<'m, K, V, BS: ByteStore> {
    inner: Iter<'m, K, V, BS>,
}

impl<'m, K, V, BS: ByteStore> Keys<'m, K, V, BS> {
    pub(crate) fn new(inner: Iter<'m, K, V, BS>) -> Self {
        Self { inner }
    }
}

impl<'m, K, V, BS> Iterator for Keys<'m, K, V, BS>
where
    K: for<'a> BytesEncode<'a> + for<'a> BytesDecode<'a>,
    V: for<'a> BytesDecode<'a>,
    BS: ByteStore,
{
    type Item = Result<<K as BytesDecode<'m>>::DItem>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|entry| entry.map(|(key, _)| key))
    }
}

pub struct Values<'m, K, V, BS: ByteStore> {
    inner: Iter<'m, K, V, BS>,
}

impl<'m, K, V, BS: ByteStore> Values<'m, K, V, BS> {
    pub(crate) fn new(inner: Iter<'m, K, V, BS>) -> Self {
        Self { inner }
    }
}

impl<'m, K, V, BS> Iterator for Values<'m, K, V, BS>
where
    K: for<'a> BytesEncode<'a> + for<'a> BytesDecode<'a>,
    V: for<'a> BytesDecode<'a>,
    BS: ByteStore,
{
    type Item = Result<<V as BytesDecode<'m>>::DItem>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|entry| entry.map(|(_, value)| value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ZbMapConfig;
    use crate::zb_map::{U64StringMap, U64U64Map};

    fn config() -> ZbMapConfig {
        ZbMapConfig::new()
            .initial_table_size(2)
            .min_block_count(2)
    }

    #[test]
    fn iterates_every_record_once() {
        let mut map: U64U64Map = ZbMap::new(config()).unwrap();
        for key in 0..300u64 {
            map.put(&key, &(key + 1)).unwrap();
        }

        let mut entries: Vec<(u64, u64)> = map.iter().collect::<Result<_>>().unwrap();
        entries.sort();
        assert_eq!(entries, (0..300u64).map(|key| (key, key + 1)).collect::<Vec<_>>());

        assert_eq!(map.keys().count(), 300);
        let sum: u64 = map.values().map(|value| value.unwrap()).sum();
        assert_eq!(sum, (1..=300u64).sum());
    }

    #[test]
    fn iterates_overflow_buckets() {
        let config = config().min_block_count(1).load_factor_overflow_limit(8.0);
        let mut map: U64U64Map = ZbMap::new(config).unwrap();
        for key in 0..50u64 {
            map.put(&key, &key).unwrap();
        }
        let head = map.table().get_bucket_address(0).unwrap();
        assert!(map.buckets().bucket_overflow_count(head).unwrap() > 0);

        let mut keys: Vec<u64> = map.keys().collect::<Result<_>>().unwrap();
        keys.sort();
        assert_eq!(keys, (0..50u64).collect::<Vec<_>>());
    }

    #[test]
    fn skips_merged_buckets() {
        let mut map: U64U64Map = ZbMap::new(config().min_block_count(1)).unwrap();
        for key in 0..64u64 {
            map.put(&key, &key).unwrap();
        }
        for key in 0..60u64 {
            map.remove(&key).unwrap();
        }

        let mut keys: Vec<u64> = map.keys().collect::<Result<_>>().unwrap();
        keys.sort();
        assert_eq!(keys, vec![60, 61, 62, 63]);
    }

    #[test]
    fn empty_map_has_no_next() {
        let map: U64U64Map = ZbMap::new(config()).unwrap();
        let mut cursor = ZbMapIterator::new(&map);
        assert!(!cursor.has_next(&map).unwrap());
        assert!(cursor.next(&map).unwrap().is_none());
        assert_eq!(map.iter().count(), 0);
    }

    #[test]
    fn cursor_walks_and_resets() {
        let mut map: U64StringMap = ZbMap::new(config().max_value_length(16)).unwrap();
        map.put(&1, "one").unwrap();
        map.put(&2, "two").unwrap();

        let mut cursor = ZbMapIterator::new(&map);
        let mut seen = Vec::new();
        while cursor.has_next(&map).unwrap() {
            let (key, value) = cursor.next(&map).unwrap().unwrap();
            seen.push((key, value.to_string()));
        }
        seen.sort();
        assert_eq!(seen, vec![(1, "one".to_string()), (2, "two".to_string())]);

        cursor.reset(&map);
        assert!(cursor.has_next(&map).unwrap());
    }

    #[test]
    fn fails_after_concurrent_modification() {
        let mut map: U64U64Map = ZbMap::new(config()).unwrap();
        map.put(&1, &1).unwrap();
        map.put(&2, &2).unwrap();

        let mut cursor = ZbMapIterator::new(&map);
        cursor.reset(&map);
        assert!(cursor.next(&map).unwrap().is_some());

        map.put(&3, &3).unwrap();

        assert!(matches!(cursor.has_next(&map), Err(ZbMapError::ConcurrentModification)));
        assert!(matches!(cursor.next(&map), Err(ZbMapError::ConcurrentModification)));

        cursor.reset(&map);
        assert!(cursor.has_next(&map).unwrap());
    }

    #[test]
    fn remove_is_unsupported() {
        let map: U64U64Map = ZbMap::new(config()).unwrap();
        let mut cursor = ZbMapIterator::new(&map);
        assert!(matches!(cursor.remove(), Err(ZbMapError::Unsupported(_))));
    }
}
