//! CBOR helpers for durable bytes.

use crate::error::{ProtocolError, ProtocolResult};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Encodes a value to CBOR bytes.
pub fn encode<T: Serialize>(value: &T) -> ProtocolResult<Vec<u8>> {
    let mut bytes = Vec::new();
    ciborium::into_writer(value, &mut bytes).map_err(|e| ProtocolError::Encode(e.to_string()))?;
    Ok(bytes)
}

/// Decodes a value from CBOR bytes.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> ProtocolResult<T> {
    ciborium::from_reader(bytes).map_err(|e| ProtocolError::Decode(e.to_string()))
}
