//! Codecs
//!
//! Everything that turns store concepts into substrate strings and back:
//!
//! - [`key`]: logical item name + session + target <-> physical key
//! - [`envelope`]: value + TTL metadata <-> stored payload
//! - [`compress`]: optional payload compression
//!
//! The codecs are pure; they never touch the substrate.

pub mod compress;
pub mod envelope;
pub mod key;

pub use compress::{Compression, Compressor, ZstdCompressor};
pub use envelope::{decode, encode, Decoded, MINUTE_EPOCH_MS};
pub use key::{parse_key, physical_key, KeyParts, StorageTarget, DEFAULT_NAMESPACE};
