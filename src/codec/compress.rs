//! Payload Compression
//!
//! The substrate only stores strings, so a compressor must produce text.
//! [`ZstdCompressor`] compresses with zstd and base64-encodes the frame.
//!
//! The envelope records the compressor's [`Compressor::format`] tag next to the
//! compressed body; a reader configured with a different format rejects the
//! payload instead of feeding it garbage.

use crate::error::CompressionError;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use std::fmt;
use std::sync::Arc;

/// Turns serialized payloads into shorter strings and back.
pub trait Compressor: Send + Sync {
    /// Tag written to the envelope's `c` field
    fn format(&self) -> &str;

    /// Compresses a serialized payload.
    fn compress(&self, input: &str) -> Result<String, CompressionError>;

    /// Reverses [`Compressor::compress`].
    fn decompress(&self, input: &str) -> Result<String, CompressionError>;
}

/// zstd + base64.
#[derive(Debug, Clone, Copy)]
pub struct ZstdCompressor {
    level: i32,
}

impl ZstdCompressor {
    /// Format tag written by this compressor.
    pub const FORMAT: &'static str = "zstd";

    /// Creates a compressor with the given zstd level.
    pub fn new(level: i32) -> Self {
        Self { level }
    }
}

impl Default for ZstdCompressor {
    fn default() -> Self {
        Self::new(zstd::DEFAULT_COMPRESSION_LEVEL)
    }
}

impl Compressor for ZstdCompressor {
    fn format(&self) -> &str {
        Self::FORMAT
    }

    fn compress(&self, input: &str) -> Result<String, CompressionError> {
        let frame = zstd::encode_all(input.as_bytes(), self.level)?;
        Ok(BASE64.encode(frame))
    }

    fn decompress(&self, input: &str) -> Result<String, CompressionError> {
        let frame = BASE64.decode(input)?;
        let bytes = zstd::decode_all(frame.as_slice())?;
        Ok(String::from_utf8(bytes)?)
    }
}

/// An item's compression policy.
#[derive(Clone)]
pub struct Compression {
    /// The codec to use
    pub codec: Arc<dyn Compressor>,
    /// Payloads shorter than this are stored uncompressed
    pub min_bytes: usize,
}

impl Compression {
    /// Compresses every payload with the given codec.
    pub fn new(codec: Arc<dyn Compressor>) -> Self {
        Self { codec, min_bytes: 0 }
    }

    /// zstd at the default level.
    pub fn zstd() -> Self {
        Self::new(Arc::new(ZstdCompressor::default()))
    }

    /// Only compress payloads of at least `min_bytes`.
    pub fn min_bytes(mut self, min_bytes: usize) -> Self {
        self.min_bytes = min_bytes;
        self
    }
}

impl fmt::Debug for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Compression")
            .field("format", &self.codec.format())
            .field("min_bytes", &self.min_bytes)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zstd_roundtrip() {
        let codec = ZstdCompressor::default();
        let input = r#"{"_v":["aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"],"t":12}"#;
        let packed = codec.compress(input).unwrap();
        assert_eq!(codec.decompress(&packed).unwrap(), input);
    }

    #[test]
    fn test_zstd_shrinks_repetitive_text() {
        let codec = ZstdCompressor::default();
        let input = "x".repeat(10_000);
        let packed = codec.compress(&input).unwrap();
        assert!(packed.len() < input.len() / 10);
    }

    #[test]
    fn test_zstd_rejects_garbage() {
        let codec = ZstdCompressor::default();
        assert!(matches!(
            codec.decompress("not base64!!"),
            Err(CompressionError::Base64(_))
        ));
        let not_a_frame = BASE64.encode(b"plain bytes");
        assert!(matches!(
            codec.decompress(&not_a_frame),
            Err(CompressionError::Io(_))
        ));
    }
}
