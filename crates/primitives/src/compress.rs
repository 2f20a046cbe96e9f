//! Transparent envelope payload compression.
//!
//! Payloads above a size threshold are compressed before hitting the wire;
//! the receive path undoes it before dispatch. A payload that claims to be
//! compressed but fails to inflate is a hard delivery error: the message is
//! dropped rather than handed to an app half-decoded.

use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use crate::wire::{CompressionFormat, Envelope};

/// Payloads at or above this size are compressed in transit.
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum CompressError {
    #[error("error decompressing message: no compression format specified")]
    MissingFormat,
    #[error("failed inflating message payload")]
    Inflate(#[source] std::io::Error),
    #[error("failed deflating message payload")]
    Deflate(#[source] std::io::Error),
}

/// Compress the envelope payload in place if it meets `threshold`.
pub fn compress_if_large(envelope: &mut Envelope, threshold: usize) -> Result<(), CompressError> {
    if envelope.compressed || envelope.value.len() < threshold {
        return Ok(());
    }
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&envelope.value)
        .and_then(|_| encoder.finish())
        .map(|compressed| {
            envelope.value = compressed;
            envelope.compressed = true;
            envelope.compression_format = Some(CompressionFormat::Gzip);
        })
        .map_err(CompressError::Deflate)
}

/// Undo transport compression in place. A no-op for uncompressed envelopes.
pub fn decompress(envelope: &mut Envelope) -> Result<(), CompressError> {
    if !envelope.compressed {
        return Ok(());
    }
    match envelope.compression_format {
        Some(CompressionFormat::Gzip) => {
            let mut inflated = Vec::new();
            GzDecoder::new(envelope.value.as_slice())
                .read_to_end(&mut inflated)
                .map_err(CompressError::Inflate)?;
            envelope.value = inflated;
            envelope.compressed = false;
            envelope.compression_format = None;
            Ok(())
        }
        None => Err(CompressError::MissingFormat),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::MessageType;

    fn envelope_with(value: Vec<u8>) -> Envelope {
        Envelope {
            mtype: MessageType::HaSync,
            value,
            compressed: false,
            compression_format: None,
        }
    }

    #[test]
    fn small_payloads_pass_through() {
        let mut env = envelope_with(vec![1, 2, 3]);
        compress_if_large(&mut env, DEFAULT_COMPRESSION_THRESHOLD).unwrap();
        assert!(!env.compressed);
        assert_eq!(env.value, vec![1, 2, 3]);
    }

    #[test]
    fn large_payloads_round_trip() {
        let payload = vec![7u8; 8192];
        let mut env = envelope_with(payload.clone());
        compress_if_large(&mut env, DEFAULT_COMPRESSION_THRESHOLD).unwrap();
        assert!(env.compressed);
        assert!(env.value.len() < payload.len());
        decompress(&mut env).unwrap();
        assert!(!env.compressed);
        assert_eq!(env.value, payload);
    }

    #[test]
    fn corrupt_payload_is_a_hard_error() {
        let mut env = envelope_with(vec![0xde, 0xad, 0xbe, 0xef]);
        env.compressed = true;
        env.compression_format = Some(CompressionFormat::Gzip);
        assert!(decompress(&mut env).is_err());
    }

    #[test]
    fn compressed_without_format_is_rejected() {
        let mut env = envelope_with(vec![1]);
        env.compressed = true;
        assert!(matches!(
            decompress(&mut env),
            Err(CompressError::MissingFormat)
        ));
    }
}
