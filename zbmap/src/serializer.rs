//! Snapshots of a whole map.
//!
//! ```text
//! +----------------+---------------------------------+----------------------------+
//! | version: u32   | table size: u32, size x u64     | bucket buffer array        |
//! +----------------+---------------------------------+----------------------------+
//! ```
//!
//! All integers are little-endian. Every byte passes through the serializer's
//! own scratch buffer, so the same serializer can be reused for any number of
//! snapshots without allocating.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use rustc_hash::FxHashSet;

use crate::bucket_buffer_array::BucketBufferArray;
use crate::byte_store::ByteStore;
use crate::config::ZbMapConfig;
use crate::error::{Result, ZbMapError};
use crate::hash_table::HashTable;
use crate::io::{ChunkedReader, ChunkedWriter};
use crate::zb_map::ZbMap;

pub const FORMAT_VERSION: u32 = 1;

pub struct ZbMapSerializer {
    buffer: Vec<u8>,
}

impl ZbMapSerializer {
    pub fn new(buffer_size: usize) -> Result<Self> {
        Self::from_buffer(vec![0u8; buffer_size])
    }

    /// Uses `buffer` as the scratch space for all reads and writes.
    pub fn from_buffer(buffer: Vec<u8>) -> Result<Self> {
        if buffer.is_empty() {
            return Err(ZbMapError::InvalidInput(
                "the I/O buffer must not be empty".to_string(),
            ));
        }
        Ok(Self { buffer })
    }

    /// Serializer sized by the config's `io_buffer_size`.
    pub fn for_config(config: &ZbMapConfig) -> Result<Self> {
        Self::new(config.io_buffer_size)
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer.len()
    }

    pub fn serialized_len<K, V, BS: ByteStore>(&self, map: &ZbMap<K, V, BS>) -> u64 {
        4 + map.table().serialized_len() + map.buckets().size()
    }

    /// Writes a snapshot of `map` and returns the number of bytes written.
    pub fn write<K, V, BS: ByteStore, W: Write>(&mut self, map: &ZbMap<K, V, BS>, writer: W) -> Result<u64> {
        let mut writer = ChunkedWriter::new(writer, &mut self.buffer)?;
        writer.write_u32(FORMAT_VERSION)?;
        map.table().write_chunked(&mut writer)?;
        map.buckets().write_chunked(&mut writer)?;
        writer.flush()?;

        tracing::debug!(
            bytes = writer.written(),
            table_size = map.table_size(),
            records = map.len(),
            "wrote snapshot"
        );
        Ok(writer.written())
    }

    /// Replaces the content of `map` with a snapshot read from `reader`.
    ///
    /// The map stays untouched unless the whole snapshot was read and found
    /// consistent.
    pub fn read<K, V, BS: ByteStore, R: Read>(&mut self, map: &mut ZbMap<K, V, BS>, reader: R) -> Result<()> {
        let mut reader = ChunkedReader::new(reader, &mut self.buffer)?;

        let version = reader.read_u32()?;
        if version != FORMAT_VERSION {
            return Err(ZbMapError::UnsupportedVersion {
                found: version,
                expected: FORMAT_VERSION,
            });
        }

        let table = HashTable::read_chunked(&mut reader)?;
        if table.size() > map.config().max_table_size {
            return Err(ZbMapError::Corrupted(format!(
                "hash table size {} exceeds the max table size {}",
                table.size(),
                map.config().max_table_size
            )));
        }
        let buckets = BucketBufferArray::read_chunked(*map.buckets().layout(), &mut reader)?;
        check_directory(&table, &buckets)?;

        tracing::debug!(
            bytes = reader.consumed(),
            table_size = table.size(),
            records = buckets.block_count(),
            "read snapshot"
        );
        map.restore(table, buckets);
        Ok(())
    }

    /// Writes a snapshot to `path` and syncs it to disk.
    pub fn save<K, V, BS: ByteStore, P: AsRef<Path>>(&mut self, map: &ZbMap<K, V, BS>, path: P) -> Result<u64> {
        let file = File::create(path.as_ref())?;
        let mut writer = BufWriter::new(file);
        let written = self.write(map, &mut writer)?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        Ok(written)
    }

    pub fn load<K, V, BS: ByteStore, P: AsRef<Path>>(&mut self, map: &mut ZbMap<K, V, BS>, path: P) -> Result<()> {
        let file = File::open(path.as_ref())?;
        self.read(map, BufReader::new(file))
    }
}

impl Default for ZbMapSerializer {
    fn default() -> Self {
        Self {
            buffer: vec![0u8; ZbMapConfig::default().io_buffer_size],
        }
    }
}

/// Every directory slot must reference a regular bucket owning that slot,
/// and every regular bucket must be referenced.
fn check_directory<BS: ByteStore>(table: &HashTable, buckets: &BucketBufferArray<BS>) -> Result<()> {
    let size = table.size();
    let mut referenced = FxHashSet::default();
    for (index, address) in table.entries().iter().enumerate() {
        referenced.insert(*address);
        let header = buckets.bucket_header(*address).map_err(|_| {
            ZbMapError::Corrupted(format!("slot {index} points at {address:#x}"))
        })?;
        if header.is_overflow() || header.is_abandoned() {
            return Err(ZbMapError::Corrupted(format!(
                "slot {index} points at a bucket that is not a directory bucket"
            )));
        }
        if header.depth >= usize::BITS || (1usize << header.depth) > size {
            return Err(ZbMapError::Corrupted(format!(
                "bucket of depth {} does not fit a table of size {size}",
                header.depth
            )));
        }
        let mask = (1usize << header.depth) - 1;
        if header.id as usize != index & mask {
            return Err(ZbMapError::Corrupted(format!(
                "slot {index} points at bucket {} of depth {}",
                header.id, header.depth
            )));
        }
    }

    for address in buckets.bucket_addresses() {
        let header = buckets.bucket_header(address)?;
        if !header.is_overflow() && !header.is_abandoned() && !referenced.contains(&address) {
            return Err(ZbMapError::Corrupted(format!(
                "bucket {} of depth {} is not referenced by the directory",
                header.id, header.depth
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::byte_store::AnonMmap;
    use crate::io::test_streams::{FailingReader, FailingWriter, TrickleReader};
    use crate::zb_map::{StringU64Map, U64U64Map};

    fn config() -> ZbMapConfig {
        ZbMapConfig::new()
            .initial_table_size(2)
            .min_block_count(2)
    }

    fn filled_map(records: u64) -> U64U64Map {
        let mut map: U64U64Map = ZbMap::new(config()).unwrap();
        for key in 0..records {
            map.put(&key, &(key * 3)).unwrap();
        }
        map
    }

    fn snapshot(map: &U64U64Map) -> Vec<u8> {
        let mut serializer = ZbMapSerializer::default();
        let mut bytes = Vec::new();
        serializer.write(map, &mut bytes).unwrap();
        bytes
    }

    #[test]
    fn round_trip_restores_every_record() {
        let map = filled_map(500);
        let mut serializer = ZbMapSerializer::new(64).unwrap();
        let mut bytes = Vec::new();
        let written = serializer.write(&map, &mut bytes).unwrap();

        assert_eq!(written, bytes.len() as u64);
        assert_eq!(written, serializer.serialized_len(&map));
        assert_eq!(&bytes[..4], &FORMAT_VERSION.to_le_bytes());
        assert_eq!(&bytes[4..8], &(map.table_size() as u32).to_le_bytes());

        let mut restored: U64U64Map = ZbMap::new(config()).unwrap();
        restored.put(&9999, &1).unwrap();
        let mod_count = restored.mod_count();
        serializer.read(&mut restored, &bytes[..]).unwrap();

        assert_eq!(restored.len(), 500);
        assert_eq!(restored.table_size(), map.table_size());
        assert_eq!(restored.bucket_count(), map.bucket_count());
        assert!(restored.mod_count() > mod_count);
        assert_eq!(restored.get(&9999).unwrap(), None);
        for key in 0..500u64 {
            assert_eq!(restored.get(&key).unwrap(), Some(key * 3));
        }

        // a restored map keeps working
        restored.put(&9999, &2).unwrap();
        restored.remove(&0).unwrap();
        assert_eq!(restored.get(&9999).unwrap(), Some(2));
        assert_eq!(restored.len(), 500);
    }

    #[test]
    fn any_buffer_size_writes_the_same_bytes() {
        let map = filled_map(100);
        let expected = snapshot(&map);
        for size in [1, 2, 5, 17, 1 << 16] {
            let mut serializer = ZbMapSerializer::new(size).unwrap();
            let mut bytes = Vec::new();
            serializer.write(&map, &mut bytes).unwrap();
            assert_eq!(bytes, expected, "buffer size {size}");
        }
    }

    #[test]
    fn reads_from_a_trickling_stream_with_one_byte_buffer() {
        let map = filled_map(100);
        let bytes = snapshot(&map);

        let mut serializer = ZbMapSerializer::new(1).unwrap();
        let mut restored: U64U64Map = ZbMap::new(config()).unwrap();
        serializer
            .read(&mut restored, TrickleReader::new(&bytes))
            .unwrap();

        assert_eq!(snapshot(&restored), bytes);
    }

    #[test]
    fn rejects_empty_buffer() {
        assert!(matches!(
            ZbMapSerializer::new(0),
            Err(ZbMapError::InvalidInput(_))
        ));
        assert!(matches!(
            ZbMapSerializer::from_buffer(Vec::new()),
            Err(ZbMapError::InvalidInput(_))
        ));
        assert_eq!(ZbMapSerializer::from_buffer(vec![0; 3]).unwrap().buffer_size(), 3);
    }

    #[test]
    fn rejects_unknown_version() {
        let mut bytes = snapshot(&filled_map(10));
        bytes[..4].copy_from_slice(&2u32.to_le_bytes());

        let mut restored = filled_map(3);
        let err = ZbMapSerializer::default()
            .read(&mut restored, &bytes[..])
            .unwrap_err();
        assert!(matches!(
            err,
            ZbMapError::UnsupportedVersion {
                found: 2,
                expected: 1
            }
        ));
        assert_eq!(restored.len(), 3);
    }

    #[test]
    fn short_snapshot_keeps_the_map() {
        let bytes = snapshot(&filled_map(100));
        let truncated = &bytes[..bytes.len() - 1];

        let mut restored = filled_map(3);
        let err = ZbMapSerializer::new(7)
            .unwrap()
            .read(&mut restored, truncated)
            .unwrap_err();

        assert_eq!(
            err.to_string(),
            format!("expected {}, got {} bytes", bytes.len(), bytes.len() - 1)
        );
        assert_eq!(restored.len(), 3);
        for key in 0..3u64 {
            assert_eq!(restored.get(&key).unwrap(), Some(key * 3));
        }
    }

    #[test]
    fn surfaces_stream_failures() {
        let map = filled_map(100);
        let bytes = snapshot(&map);

        let mut serializer = ZbMapSerializer::new(16).unwrap();
        let mut restored: U64U64Map = ZbMap::new(config()).unwrap();
        let failing = FailingReader {
            data: &bytes,
            ok_bytes: 40,
            pos: 0,
        };
        let err = serializer.read(&mut restored, failing).unwrap_err();
        assert!(matches!(err, ZbMapError::Io(ref e) if e.to_string() == "Stream Closed"));
        assert!(restored.is_empty());

        let sink = FailingWriter {
            data: Vec::new(),
            capacity: 100,
        };
        let err = serializer.write(&map, sink).unwrap_err();
        assert!(matches!(err, ZbMapError::WriteFailed { written: 100, .. }));
    }

    #[test]
    fn rejects_directory_pointing_at_overflow_bucket() {
        let config = config().min_block_count(1).load_factor_overflow_limit(8.0);
        let mut map: U64U64Map = ZbMap::new(config.clone()).unwrap();
        for key in 0..4u64 {
            map.put(&key, &key).unwrap();
        }
        let head = map.table().get_bucket_address(0).unwrap();
        let overflow = map.buckets().bucket_overflow_pointer(head).unwrap();
        assert_ne!(overflow, 0);

        let mut bytes = snapshot(&map);
        // slot 1 of the directory
        bytes[16..24].copy_from_slice(&overflow.to_le_bytes());

        let mut restored: U64U64Map = ZbMap::new(config).unwrap();
        let err = ZbMapSerializer::default()
            .read(&mut restored, &bytes[..])
            .unwrap_err();
        assert!(matches!(err, ZbMapError::Corrupted(_)));
        assert!(restored.is_empty());
    }

    #[test]
    fn rejects_records_unreachable_from_the_directory() {
        let config = config().min_block_count(1).load_factor_overflow_limit(8.0);
        let mut map: U64U64Map = ZbMap::new(config.clone()).unwrap();
        for key in 0..4u64 {
            map.put(&key, &key).unwrap();
        }
        assert_eq!(map.bucket_count(), 4);
        let bytes = snapshot(&map);

        // version, table of two slots, array header, buffer header
        let first_bucket = 4 + 4 + 2 * 8 + 16 + 4;
        let bucket_at = |index: usize| first_bucket + index * map.buckets().max_bucket_len();

        let mut restored: U64U64Map = ZbMap::new(config).unwrap();
        restored.put(&9, &9).unwrap();
        let mut serializer = ZbMapSerializer::default();

        // the head forgets its overflow chain
        let mut corrupted = bytes.clone();
        let pointer = bucket_at(0) + 16;
        corrupted[pointer..pointer + 8].copy_from_slice(&0u64.to_le_bytes());
        assert!(matches!(
            serializer.read(&mut restored, &corrupted[..]),
            Err(ZbMapError::Corrupted(_))
        ));

        // the last overflow bucket turns into a bucket no slot points at
        let mut corrupted = bytes.clone();
        let pointer = bucket_at(2) + 16;
        corrupted[pointer..pointer + 8].copy_from_slice(&0u64.to_le_bytes());
        let id = bucket_at(3) + 4;
        corrupted[id..id + 4].copy_from_slice(&1u32.to_le_bytes());
        corrupted[id + 4..id + 8].copy_from_slice(&1u32.to_le_bytes());
        let err = serializer.read(&mut restored, &corrupted[..]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "corrupted map data: bucket 1 of depth 1 is not referenced by the directory"
        );

        assert_eq!(restored.len(), 1);
        assert_eq!(restored.get(&9).unwrap(), Some(9));
        serializer.read(&mut restored, &bytes[..]).unwrap();
        assert_eq!(restored.len(), 4);
    }

    #[test]
    fn rejects_table_larger_than_configured() {
        let bytes = snapshot(&filled_map(500));
        let mut restored: U64U64Map = ZbMap::new(config().max_table_size(2)).unwrap();
        assert!(matches!(
            ZbMapSerializer::default().read(&mut restored, &bytes[..]),
            Err(ZbMapError::Corrupted(_))
        ));
    }

    #[test]
    fn saves_and_loads_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("map.snapshot");

        let mut map: StringU64Map<AnonMmap> = ZbMap::new(config()).unwrap();
        for (i, word) in ["alpha", "beta", "gamma", "delta"].iter().enumerate() {
            map.put(word, &(i as u64)).unwrap();
        }

        let mut serializer = ZbMapSerializer::for_config(map.config()).unwrap();
        assert_eq!(serializer.buffer_size(), 4096);
        let written = serializer.save(&map, &path).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), written);

        let mut loaded: StringU64Map<AnonMmap> = ZbMap::new(config()).unwrap();
        serializer.load(&mut loaded, &path).unwrap();
        assert_eq!(loaded.len(), 4);
        assert_eq!(loaded.get("gamma").unwrap(), Some(2));
        assert_eq!(loaded.get("omega").unwrap(), None);
    }
}
