use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{Error, Result};

/// Set when the stored bytes came out of a [`Serializer`] rather than being
/// raw caller bytes.
pub const FLAG_SERIALIZED: u32 = 1 << 0;
/// Set when the stored bytes are zstd-compressed.
pub const FLAG_COMPRESSED: u32 = 1 << 1;

const ZSTD_LEVEL: i32 = 3;

/// Turns typed values into bytes and back.
pub trait Serializer: Send + Sync + 'static {
    fn serialize<V: Serialize + ?Sized>(&self, value: &V) -> Result<Vec<u8>>;
    fn deserialize<V: DeserializeOwned>(&self, bytes: &[u8]) -> Result<V>;
}

/// JSON via `serde_json`. Integers serialize to plain decimal text, so values
/// written with `set` remain usable with `incr`/`decr`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn serialize<V: Serialize + ?Sized>(&self, value: &V) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| Error::Serialization(e.to_string()))
    }

    fn deserialize<V: DeserializeOwned>(&self, bytes: &[u8]) -> Result<V> {
        serde_json::from_slice(bytes).map_err(|e| Error::Serialization(e.to_string()))
    }
}

/// Serialization, optional compression and the size limit, applied in that
/// order on the way out and reversed on the way in.
///
/// # Example
///
/// ```rust
/// use mcring::{FLAG_COMPRESSED, FLAG_SERIALIZED, JsonSerializer, ValueCodec};
///
/// let codec = ValueCodec::new(JsonSerializer, 64, 1024 * 1024);
///
/// let (bytes, flags) = codec.encode(&42u32).unwrap();
/// assert_eq!((bytes.as_slice(), flags), (&b"42"[..], FLAG_SERIALIZED));
///
/// let text = "abc".repeat(100);
/// let (bytes, flags) = codec.encode(&text).unwrap();
/// assert_eq!(flags, FLAG_SERIALIZED | FLAG_COMPRESSED);
/// assert_eq!(codec.decode::<String>(&bytes, flags).unwrap(), text);
/// ```
#[derive(Debug, Clone)]
pub struct ValueCodec<S> {
    serializer: S,
    compression_threshold: usize,
    max_value_size: usize,
}

impl<S: Serializer> ValueCodec<S> {
    pub fn new(serializer: S, compression_threshold: usize, max_value_size: usize) -> Self {
        Self {
            serializer,
            compression_threshold,
            max_value_size,
        }
    }

    pub fn max_value_size(&self) -> usize {
        self.max_value_size
    }

    /// Serializes `value`, then compresses it when that pays off. Returns the
    /// bytes to store and their flags.
    pub fn encode<V: Serialize + ?Sized>(&self, value: &V) -> Result<(Vec<u8>, u32)> {
        let bytes = self.serializer.serialize(value)?;
        self.finish(bytes, FLAG_SERIALIZED)
    }

    /// Like [`ValueCodec::encode`] for bytes that skip the serializer.
    pub fn encode_raw(&self, bytes: &[u8]) -> Result<(Vec<u8>, u32)> {
        self.finish(bytes.to_vec(), 0)
    }

    fn finish(&self, bytes: Vec<u8>, mut flags: u32) -> Result<(Vec<u8>, u32)> {
        let bytes = if bytes.len() > self.compression_threshold {
            let compressed = zstd::encode_all(bytes.as_slice(), ZSTD_LEVEL).map_err(Error::Compression)?;
            if compressed.len() < bytes.len() {
                flags |= FLAG_COMPRESSED;
                compressed
            } else {
                bytes
            }
        } else {
            bytes
        };
        crate::protocol::check_value_len(bytes.len(), self.max_value_size)?;
        Ok((bytes, flags))
    }

    /// Reverses [`ValueCodec::encode`] using the flags stored with the item.
    pub fn decode<V: DeserializeOwned>(&self, bytes: &[u8], flags: u32) -> Result<V> {
        if flags & FLAG_COMPRESSED != 0 {
            self.serializer.deserialize(&decompress(bytes)?)
        } else {
            self.serializer.deserialize(bytes)
        }
    }

    /// The stored bytes with compression undone; serialized values come back
    /// in their serialized form.
    pub fn decode_raw(&self, bytes: Vec<u8>, flags: u32) -> Result<Vec<u8>> {
        if flags & FLAG_COMPRESSED != 0 {
            decompress(&bytes)
        } else {
            Ok(bytes)
        }
    }
}

fn decompress(bytes: &[u8]) -> Result<Vec<u8>> {
    zstd::decode_all(bytes).map_err(Error::Compression)
}
