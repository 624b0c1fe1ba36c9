//! Envelope Codec
//!
//! Two on-substrate shapes coexist:
//!
//! ```text
//! Bare:     "hello"                                   (value JSON, nothing else)
//! Wrapped:  {"t":1234,"p":{"a":1230},"_v":"hello"}    (TTL metadata)
//!           {"_v":"KLUv/QBY...","c":"zstd"}           (compressed inner payload)
//! ```
//!
//! `t` and `p` are whole minutes since [`MINUTE_EPOCH_MS`] to keep the
//! footprint small. A compressed body decompresses to a Bare or Wrapped payload;
//! only one level of compression is allowed.
//!
//! Decoding tries the Wrapped shape strictly first (known fields only, `_v`
//! required, numeric timestamps) and falls back to Bare on any mismatch.

use crate::error::{DecodeError, SchemaError};
use crate::item::{guarded, ItemConfig};
use crate::storage::expiry::TtlMeta;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// 2024-01-01T00:00:00Z in unix milliseconds.
pub const MINUTE_EPOCH_MS: u64 = 1_704_067_200_000;

const MINUTE_MS: u64 = 60_000;

/// Unix milliseconds to whole minutes since the epoch.
#[inline]
pub fn to_minutes(ms: u64) -> u64 {
    ms.saturating_sub(MINUTE_EPOCH_MS) / MINUTE_MS
}

/// Whole minutes since the epoch back to unix milliseconds.
#[inline]
pub fn from_minutes(minutes: u64) -> u64 {
    MINUTE_EPOCH_MS.saturating_add(minutes.saturating_mul(MINUTE_MS))
}

/// Rounds unix milliseconds up to the next instant the envelope can hold
/// exactly. TTL timestamps are taken through this so a value never expires
/// earlier once reloaded.
#[inline]
pub fn ceil_to_minute(ms: u64) -> u64 {
    let minutes = to_minutes(ms);
    let floored = from_minutes(minutes);
    if floored < ms {
        from_minutes(minutes + 1)
    } else {
        floored
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Wrapped {
    #[serde(default)]
    t: Option<u64>,
    #[serde(default)]
    p: BTreeMap<String, u64>,
    #[serde(rename = "_v")]
    v: Value,
    #[serde(default)]
    c: Option<String>,
}

#[derive(Serialize)]
struct WrappedOut<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    t: Option<u64>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    p: BTreeMap<&'a str, u64>,
    #[serde(rename = "_v")]
    v: &'a Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    c: Option<&'a str>,
}

/// A successfully decoded payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    /// The validated value
    pub value: Value,
    /// TTL metadata, `None` for Bare payloads
    pub meta: Option<TtlMeta>,
    /// The value was repaired by the item's migration and should be re-persisted
    pub migrated: bool,
}

/// Serializes a value for the substrate.
///
/// Emits Bare JSON when there is no metadata and no compression applies.
pub fn encode(
    item: &ItemConfig,
    value: &Value,
    meta: Option<&TtlMeta>,
) -> serde_json::Result<String> {
    let inner = match meta {
        None => serde_json::to_string(value)?,
        Some(meta) => serde_json::to_string(&WrappedOut {
            t: Some(to_minutes(meta.updated_at)),
            p: meta
                .parts
                .iter()
                .map(|(id, at)| (id.as_str(), to_minutes(*at)))
                .collect(),
            v: value,
            c: None,
        })?,
    };

    let Some(compression) = &item.compression else {
        return Ok(inner);
    };
    if inner.len() < compression.min_bytes {
        return Ok(inner);
    }

    match compression.codec.compress(&inner) {
        Ok(body) => serde_json::to_string(&WrappedOut {
            t: None,
            p: BTreeMap::new(),
            v: &Value::String(body),
            c: Some(compression.codec.format()),
        }),
        Err(e) => {
            warn!(item = %item.name, error = %e, "Compression failed, storing uncompressed");
            Ok(inner)
        }
    }
}

/// Parses and validates a stored payload.
pub fn decode(item: &ItemConfig, raw: &str) -> Result<Decoded, DecodeError> {
    let json: Value = serde_json::from_str(raw)?;
    decode_value(item, json, true)
}

fn decode_value(
    item: &ItemConfig,
    json: Value,
    allow_compressed: bool,
) -> Result<Decoded, DecodeError> {
    // Serde would also accept a positional array for the struct; only objects qualify.
    let wrapped = match &json {
        Value::Object(_) => Wrapped::deserialize(&json).ok(),
        _ => None,
    };
    let wrapped = match wrapped {
        Some(wrapped) => wrapped,
        None => {
            let (value, migrated) = validate(item, json)?;
            return Ok(Decoded {
                value,
                meta: None,
                migrated,
            });
        }
    };

    if let Some(found) = wrapped.c {
        if !allow_compressed {
            return Err(DecodeError::NestedCompression);
        }
        let codec = match &item.compression {
            Some(c) if c.codec.format() == found => &c.codec,
            other => {
                return Err(DecodeError::FormatMismatch {
                    expected: other.as_ref().map(|c| c.codec.format().to_string()),
                    found,
                })
            }
        };
        let Value::String(body) = wrapped.v else {
            return Err(DecodeError::FormatMismatch {
                expected: Some("compressed text body".to_string()),
                found,
            });
        };
        let inner = codec.decompress(&body)?;
        let inner: Value = serde_json::from_str(&inner)?;
        return decode_value(item, inner, false);
    }

    let (value, migrated) = validate(item, wrapped.v)?;
    let meta = wrapped.t.map(|t| TtlMeta {
        updated_at: from_minutes(t),
        parts: wrapped
            .p
            .into_iter()
            .map(|(id, at)| (id, from_minutes(at)))
            .collect(),
    });

    Ok(Decoded {
        value,
        meta,
        migrated,
    })
}

/// Runs the item's schema, falling back to its migration on rejection.
///
/// Returns the accepted value and whether migration produced it.
pub fn validate(item: &ItemConfig, value: Value) -> Result<(Value, bool), SchemaError> {
    let name = item.name.as_str();
    let error = match guarded(name, "schema", || item.schema.parse(&value)) {
        Some(Ok(parsed)) => return Ok((parsed, false)),
        Some(Err(error)) => error,
        None => SchemaError::new("schema panicked"),
    };

    let Some(migrate) = &item.migrate else {
        return Err(error);
    };

    let Some(Some(candidate)) = guarded(name, "migrate", || migrate(&value, &error)) else {
        return Err(error);
    };

    match guarded(name, "schema", || item.schema.parse(&candidate)) {
        Some(Ok(parsed)) => {
            debug!(item = name, "Migrated stored value");
            Ok((parsed, true))
        }
        Some(Err(second)) => Err(second),
        None => Err(error),
    }
}
