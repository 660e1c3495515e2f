//! Payload codec
//!
//! Symmetric encode/decode between protocol values and opaque bytes. A codec
//! must be deterministic: the same value always encodes to the same bytes.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::{Result, TickloomError};

/// A deterministic, symmetric serializer for protocol payloads and persisted
/// values.
pub trait Codec {
    /// Encode a value to bytes.
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>>;

    /// Decode bytes back into a value.
    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T>;
}

/// JSON codec over serde. Struct field order is fixed by the derive, so
/// encoding is deterministic for every protocol type.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| TickloomError::Codec(e.to_string()))
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        serde_json::from_slice(bytes).map_err(|e| TickloomError::Codec(e.to_string()))
    }
}
