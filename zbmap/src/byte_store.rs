use std::io;

use memmap2::MmapMut;

/// Fixed-size, zero-initialised memory region backing one bucket buffer.
///
/// Stores never grow or move once allocated; a bucket address stays valid
/// for as long as the store that holds it.
pub trait ByteStore: AsRef<[u8]> + AsMut<[u8]> + Sized {
    fn allocate(len: usize) -> io::Result<Self>;
}

/// Heap allocated store.
pub struct VecStore(Box<[u8]>);

impl AsRef<[u8]> for VecStore {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl AsMut<[u8]> for VecStore {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.0
    }
}

impl ByteStore for VecStore {
    fn allocate(len: usize) -> io::Result<Self> {
        Ok(VecStore(vec![0u8; len].into_boxed_slice()))
    }
}

/// Anonymous memory map, lives outside the allocator heap.
pub struct AnonMmap {
    mmap: MmapMut,
}

impl AsRef<[u8]> for AnonMmap {
    fn as_ref(&self) -> &[u8] {
        &self.mmap
    }
}

impl AsMut<[u8]> for AnonMmap {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.mmap
    }
}

impl ByteStore for AnonMmap {
    fn allocate(len: usize) -> io::Result<Self> {
        let mmap = MmapMut::map_anon(len)?;
        Ok(Self { mmap })
    }
}
