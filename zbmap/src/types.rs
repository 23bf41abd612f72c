use std::error::Error;
use std::hash::BuildHasher;
use std::marker::PhantomData;
use std::ops::Deref;

use rustc_hash::FxBuildHasher;

pub enum CowBytes<'a> {
    Borrowed(&'a [u8]),
    Owned(Box<dyn AsRef<[u8]> + 'a>),
}

impl<'a> CowBytes<'a> {
    pub fn borrowed(item: &'a [u8]) -> Self {
        CowBytes::Borrowed(item)
    }

    pub fn owned<T: AsRef<[u8]> + 'static>(item: T) -> Self {
        CowBytes::Owned(Box::new(item))
    }
}

impl AsRef<[u8]> for CowBytes<'_> {
    fn as_ref(&self) -> &[u8] {
        match self {
            CowBytes::Borrowed(item) => item,
            CowBytes::Owned(item) => item.as_ref().as_ref(),
        }
    }
}

impl Deref for CowBytes<'_> {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.as_ref()
    }
}

/// Trait for encoding types into byte representation
///
/// Keys are stored zero padded to the configured maximum key length, so the
/// hash of a key has to be computed over the same bytes whether it comes from
/// `bytes_encode` or from a padded slot. `unpad` recovers those bytes.
pub trait BytesEncode<'a> {
    type EItem: 'a + ?Sized;

    /// Encode an item into bytes
    fn bytes_encode(item: &'a Self::EItem) -> Result<CowBytes<'a>, Box<dyn Error + Sync + Send>>;

    /// Strips the zero padding of a stored key.
    fn unpad(stored: &[u8]) -> &[u8] {
        let end = stored.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
        &stored[..end]
    }

    fn hash_code(bytes: &[u8]) -> u64 {
        FxBuildHasher.hash_one(Self::unpad(bytes))
    }
}

/// Trait for decoding types from byte representation
pub trait BytesDecode<'a> {
    type DItem: 'a;

    /// Decode bytes into an item
    fn bytes_decode(bytes: &'a [u8]) -> Result<Self::DItem, Box<dyn Error + Sync + Send>>;
}

/// Wrapper for native types that can be represented as bytes (numbers, etc.)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Native<T>(PhantomData<T>);

impl<T> Default for Native<T> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

/// Wrapper for string types - works directly with &str
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Str;

/// Wrapper for byte slice types - works directly with &[u8]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Bytes;

// Implementations for Native<T>
impl<'a, T> BytesEncode<'a> for Native<T>
where
    T: bytemuck::Pod,
{
    type EItem = T;

    fn bytes_encode(item: &'a Self::EItem) -> Result<CowBytes<'a>, Box<dyn Error + Sync + Send>> {
        Ok(CowBytes::Borrowed(bytemuck::bytes_of(item)))
    }

    fn unpad(stored: &[u8]) -> &[u8] {
        let width = std::mem::size_of::<T>().min(stored.len());
        &stored[..width]
    }

    /// Folds the leading eight bytes into a word, sequential ids keep
    /// distinct low bits.
    fn hash_code(bytes: &[u8]) -> u64 {
        let bytes = Self::unpad(bytes);
        let mut word = [0u8; 8];
        let n = bytes.len().min(8);
        word[..n].copy_from_slice(&bytes[..n]);
        let value = u64::from_le_bytes(word);
        value ^ (value >> 32)
    }
}

impl<'a, T> BytesDecode<'a> for Native<T>
where
    T: bytemuck::Pod,
{
    type DItem = T;

    fn bytes_decode(bytes: &'a [u8]) -> Result<Self::DItem, Box<dyn Error + Sync + Send>> {
        if bytes.len() != std::mem::size_of::<T>() {
            return Err(format!(
                "Invalid byte length for {}: expected {}, got {}",
                std::any::type_name::<T>(),
                std::mem::size_of::<T>(),
                bytes.len()
            )
            .into());
        }
        Ok(bytemuck::pod_read_unaligned(bytes))
    }
}

// Implementations for Str
impl<'a> BytesEncode<'a> for Str {
    type EItem = str;

    fn bytes_encode(item: &'a Self::EItem) -> Result<CowBytes<'a>, Box<dyn Error + Sync + Send>> {
        Ok(CowBytes::Borrowed(item.as_bytes()))
    }
}

impl<'a> BytesDecode<'a> for Str {
    type DItem = &'a str;

    fn bytes_decode(bytes: &'a [u8]) -> Result<Self::DItem, Box<dyn Error + Sync + Send>> {
        std::str::from_utf8(bytes).map_err(|e| e.into())
    }
}

// Implementations for Bytes
impl<'a> BytesEncode<'a> for Bytes {
    type EItem = [u8];

    fn bytes_encode(item: &'a Self::EItem) -> Result<CowBytes<'a>, Box<dyn Error + Sync + Send>> {
        Ok(CowBytes::Borrowed(item))
    }
}

impl<'a> BytesDecode<'a> for Bytes {
    type DItem = &'a [u8];

    fn bytes_decode(bytes: &'a [u8]) -> Result<Self::DItem, Box<dyn Error + Sync + Send>> {
        Ok(bytes)
    }
}
