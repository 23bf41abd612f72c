use std::io::{Read, Write};

use crate::error::{Result, ZbMapError};
use crate::io::{ChunkedReader, ChunkedWriter};
use crate::layout::MAX_TABLE_SIZE;

/// Extendible hashing directory: a power-of-two array of bucket addresses.
///
/// A bucket of depth `d` and id `b` is referenced from every slot `i` with
/// `i & (2^d - 1) == b`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashTable {
    entries: Vec<u64>,
}

fn checked_table_size(capacity: usize) -> Result<usize> {
    capacity
        .max(1)
        .checked_next_power_of_two()
        .filter(|size| *size <= MAX_TABLE_SIZE)
        .ok_or_else(|| {
            ZbMapError::CapacityOverflow(format!(
                "hash table of {capacity} slots exceeds the limit of {MAX_TABLE_SIZE}"
            ))
        })
}

impl HashTable {
    pub fn new(initial_size: usize) -> Result<Self> {
        let size = checked_table_size(initial_size)?;
        Ok(Self {
            entries: vec![0; size],
        })
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> &[u64] {
        &self.entries
    }

    /// Byte length of the serialized table, size prefix included.
    pub fn serialized_len(&self) -> u64 {
        4 + 8 * self.entries.len() as u64
    }

    /// Resizes to `new_capacity` rounded up to a power of two.
    ///
    /// Growing copies the directory so every new slot points where its
    /// aliasing old slot pointed. Shrinking keeps the leading slots, callers
    /// must make sure no bucket is deeper than the new size allows.
    pub fn resize(&mut self, new_capacity: usize) -> Result<()> {
        let new_size = checked_table_size(new_capacity)?;
        let old_size = self.entries.len();

        if new_size > old_size {
            self.entries.reserve_exact(new_size - old_size);
            for i in old_size..new_size {
                let address = self.entries[i & (old_size - 1)];
                self.entries.push(address);
            }
        } else if new_size < old_size {
            self.entries.truncate(new_size);
            self.entries.shrink_to_fit();
        }

        tracing::debug!(from = old_size, to = new_size, "resized hash table");
        Ok(())
    }

    /// Writes `address` into every `step`th slot starting at `start_index`.
    pub fn update_table(&mut self, step: usize, start_index: usize, address: u64) -> Result<()> {
        if step == 0 {
            return Err(ZbMapError::InvalidInput("table update step must be positive".to_string()));
        }
        if start_index >= self.entries.len() {
            return Err(ZbMapError::IndexOutOfBounds {
                index: start_index,
                size: self.entries.len(),
            });
        }
        for slot in self.entries.iter_mut().skip(start_index).step_by(step) {
            *slot = address;
        }
        Ok(())
    }

    pub fn get_bucket_address(&self, index: usize) -> Result<u64> {
        self.entries
            .get(index)
            .copied()
            .ok_or(ZbMapError::IndexOutOfBounds {
                index,
                size: self.entries.len(),
            })
    }

    pub fn set_bucket_address(&mut self, index: usize, address: u64) -> Result<()> {
        let size = self.entries.len();
        let slot = self
            .entries
            .get_mut(index)
            .ok_or(ZbMapError::IndexOutOfBounds { index, size })?;
        *slot = address;
        Ok(())
    }

    /// Resets to `size` slots all pointing at `address`.
    pub fn clear(&mut self, size: usize, address: u64) -> Result<()> {
        let size = checked_table_size(size)?;
        self.entries.clear();
        self.entries.resize(size, address);
        self.entries.shrink_to_fit();
        Ok(())
    }

    pub(crate) fn write_chunked<W: Write>(&self, writer: &mut ChunkedWriter<'_, W>) -> Result<()> {
        writer.write_u32(self.entries.len() as u32)?;
        for address in &self.entries {
            writer.write_u64(*address)?;
        }
        Ok(())
    }

    pub(crate) fn read_chunked<R: Read>(reader: &mut ChunkedReader<'_, R>) -> Result<Self> {
        let size = reader.read_u32()? as usize;
        if size == 0 || !size.is_power_of_two() || size > MAX_TABLE_SIZE {
            return Err(ZbMapError::Corrupted(format!(
                "hash table size {size} is not a power of two up to {MAX_TABLE_SIZE}"
            )));
        }
        let mut entries = Vec::with_capacity(size);
        for _ in 0..size {
            entries.push(reader.read_u64()?);
        }
        Ok(Self { entries })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::test_streams::TrickleReader;
    use proptest::prelude::*;

    #[test]
    fn new_rounds_up_to_power_of_two() {
        assert_eq!(HashTable::new(0).unwrap().size(), 1);
        assert_eq!(HashTable::new(5).unwrap().size(), 8);
        assert_eq!(HashTable::new(32).unwrap().size(), 32);
        assert!(matches!(
            HashTable::new(MAX_TABLE_SIZE + 1),
            Err(ZbMapError::CapacityOverflow(_))
        ));
    }

    #[test]
    fn update_table_writes_every_step() {
        let mut table = HashTable::new(16).unwrap();
        table.update_table(1, 0, 10).unwrap();
        table.update_table(4, 1, 20).unwrap();

        for i in 0..16 {
            let expected = if i % 4 == 1 { 20 } else { 10 };
            assert_eq!(table.get_bucket_address(i).unwrap(), expected);
        }
    }

    #[test]
    fn out_of_range_access_fails() {
        let mut table = HashTable::new(4).unwrap();
        assert!(matches!(
            table.get_bucket_address(4),
            Err(ZbMapError::IndexOutOfBounds { index: 4, size: 4 })
        ));
        assert!(matches!(
            table.set_bucket_address(9, 1),
            Err(ZbMapError::IndexOutOfBounds { index: 9, size: 4 })
        ));
        assert!(table.update_table(2, 4, 1).is_err());
        assert!(table.update_table(0, 0, 1).is_err());
    }

    #[test]
    fn growing_preserves_aliases() {
        proptest!(|(addresses in proptest::collection::vec(1u64..1000, 4), factor in 1u32..5)| {
            let mut table = HashTable::new(4).unwrap();
            for (i, address) in addresses.iter().enumerate() {
                table.set_bucket_address(i, *address).unwrap();
            }
            let new_size = 4usize << factor;
            table.resize(new_size).unwrap();
            prop_assert_eq!(table.size(), new_size);
            for i in 0..new_size {
                prop_assert_eq!(table.get_bucket_address(i).unwrap(), addresses[i % 4]);
            }
        });
    }

    #[test]
    fn shrinking_keeps_the_leading_slots() {
        let mut table = HashTable::new(8).unwrap();
        for i in 0..8 {
            table.set_bucket_address(i, (i % 2) as u64 + 1).unwrap();
        }
        table.resize(3).unwrap();
        assert_eq!(table.entries(), &[1, 2, 1, 2]);
    }

    #[test]
    fn stream_round_trip_with_tiny_scratch() {
        let mut table = HashTable::new(8).unwrap();
        for i in 0..8 {
            table.set_bucket_address(i, ((i as u64) << 32) | 4).unwrap();
        }

        let mut scratch = [0u8; 1];
        let mut bytes = Vec::new();
        let mut writer = ChunkedWriter::new(&mut bytes, &mut scratch).unwrap();
        table.write_chunked(&mut writer).unwrap();
        assert_eq!(writer.written(), table.serialized_len());

        let mut reader = ChunkedReader::new(TrickleReader::new(&bytes), &mut scratch).unwrap();
        assert_eq!(HashTable::read_chunked(&mut reader).unwrap(), table);
    }

    #[test]
    fn rejects_corrupted_size() {
        let mut scratch = [0u8; 16];
        let bytes = 6u32.to_le_bytes();
        let mut reader = ChunkedReader::new(&bytes[..], &mut scratch).unwrap();
        assert!(matches!(
            HashTable::read_chunked(&mut reader),
            Err(ZbMapError::Corrupted(_))
        ));
    }
}
