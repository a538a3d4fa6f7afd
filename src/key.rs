//! Key bounds and pluggable on-disk key encoding.
//!
//! The engine is generic over the key type; it only needs total ordering for
//! level layout and a canonical byte encoding for the on-disk index records.
//! Both provided serializers are order-preserving, so on-disk levels keep the
//! in-memory ordering.

use std::fmt::Debug;
use std::hash::Hash;
use std::io;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};

/// Bounds every key type must satisfy. Blanket-implemented.
pub trait StorageKey: Ord + Hash + Clone + Debug + Send + Sync + 'static {}

impl<T: Ord + Hash + Clone + Debug + Send + Sync + 'static> StorageKey for T {}

/// Canonical byte encoding of a key for on-disk index records.
pub trait KeySerializer<K>: Send + Sync + 'static {
    fn encode(&self, key: &K, out: &mut Vec<u8>);
    fn decode(&self, bytes: &[u8]) -> Result<K>;
}

/// Fixed-width big-endian encoding for 128-bit ids.
#[derive(Debug, Default, Clone, Copy)]
pub struct U128KeySerializer;

impl KeySerializer<u128> for U128KeySerializer {
    fn encode(&self, key: &u128, out: &mut Vec<u8>) {
        out.write_u128::<BigEndian>(*key).expect("vec write");
    }

    fn decode(&self, bytes: &[u8]) -> Result<u128> {
        if bytes.len() != 16 {
            return Err(Error::Decode(
                "u128 key",
                io::Error::new(io::ErrorKind::UnexpectedEof, "expected 16 bytes"),
            ));
        }
        let mut cursor = bytes;
        Ok(cursor.read_u128::<BigEndian>()?)
    }
}

/// Raw byte-string keys, stored as-is. Length framing is provided by the
/// index record, so the encoding is the identity.
#[derive(Debug, Default, Clone, Copy)]
pub struct BytesKeySerializer;

impl KeySerializer<Vec<u8>> for BytesKeySerializer {
    fn encode(&self, key: &Vec<u8>, out: &mut Vec<u8>) {
        out.extend_from_slice(key);
    }

    fn decode(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        Ok(bytes.to_vec())
    }
}
