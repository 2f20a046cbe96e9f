//! Compact binary body codec.
//!
//! Message bodies are strongly-typed serde structs; the broker and transports
//! only ever see the encoded bytes inside an [`crate::wire::Envelope`].

use serde::Serialize;
use serde::de::DeserializeOwned;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("failed encoding message body")]
    Encode(#[source] bincode::Error),
    #[error("failed decoding message body")]
    Decode(#[source] bincode::Error),
}

pub fn encode<T: Serialize>(body: &T) -> Result<Vec<u8>, CodecError> {
    bincode::serialize(body).map_err(CodecError::Encode)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    bincode::deserialize(bytes).map_err(CodecError::Decode)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_rejects_trailing_garbage_free_input() {
        let bytes = encode(&42u32).unwrap();
        assert_eq!(decode::<u32>(&bytes).unwrap(), 42);
        assert!(decode::<String>(&[0xff; 3]).is_err());
    }
}
