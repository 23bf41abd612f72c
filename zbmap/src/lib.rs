pub mod bucket_buffer_array;
pub mod byte_store;
pub mod config;
pub mod error;
pub mod hash_table;
mod io;
pub mod iter;
pub mod layout;
pub mod serializer;
pub mod types;
pub mod zb_map;
pub use bucket_buffer_array::BucketBufferArray;
pub use byte_store::{AnonMmap, ByteStore, VecStore};
pub use config::ZbMapConfig;
pub use error::{Result, ZbMapError};
pub use hash_table::HashTable;
pub use io::MAX_IO_RETRIES;
pub use iter::{Iter, Keys, Values, ZbMapIterator};
pub use serializer::{FORMAT_VERSION, ZbMapSerializer};
pub use types::{Bytes, BytesDecode, BytesEncode, CowBytes, Native, Str};
pub use zb_map::{BytesBytesMap, StringU64Map, U64BytesMap, U64StringMap, U64U64Map, ZbMap};
