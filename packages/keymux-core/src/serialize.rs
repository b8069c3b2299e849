//! Value serialization for the text channel and the raw byte envelope.
//!
//! The text channel carries primitives as bare literals (`true`, `42`,
//! unquoted strings) and composites as JSON. [`parse`] is tolerant: any
//! text that is not recognizable JSON comes back as a plain string, so a
//! backend written to by other tools still yields usable values.
//!
//! Raw mode wraps opaque bytes in a tagged base64 envelope
//! (`raw:<len>:<base64>`) so text-only backends can round-trip
//! `set_raw`/`get_raw`.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::error::{Result, StorageError};
use crate::types::Value;

/// Prefix tagging a raw byte envelope in the text channel.
const RAW_PREFIX: &str = "raw:";

/// Stringifies a value for the text channel.
///
/// Primitives serialize to their bare literal form (strings verbatim,
/// without JSON quoting), arrays and maps to JSON.
///
/// # Errors
///
/// Returns [`StorageError::Serialization`] for [`Value::Bytes`]: opaque
/// bytes have no text form and must travel through the raw channel.
pub fn stringify(value: &Value) -> Result<String> {
    match value {
        Value::Null => Ok("null".to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Int(n) => Ok(n.to_string()),
        Value::Float(f) => Ok(f.to_string()),
        Value::String(s) => Ok(s.clone()),
        Value::Bytes(_) => Err(StorageError::Serialization(
            "opaque bytes are not stringifiable; use the raw channel".to_string(),
        )),
        Value::Array(_) | Value::Map(_) => serde_json::to_string(&value.to_json())
            .map_err(|e| StorageError::Serialization(e.to_string())),
    }
}

/// Tolerant text-to-value parser.
///
/// Valid JSON (including bare literals like `true`, `null`, `42`, `1.5`)
/// parses to the corresponding value; everything else is returned as the
/// original string. Never fails.
#[must_use]
pub fn parse(text: &str) -> Value {
    match serde_json::from_str::<serde_json::Value>(text) {
        Ok(json) => Value::from_json(json),
        Err(_) => Value::String(text.to_string()),
    }
}

/// Encodes bytes into the tagged text envelope (`raw:<len>:<base64>`).
#[must_use]
pub fn serialize_raw(bytes: &[u8]) -> String {
    format!("{RAW_PREFIX}{}:{}", bytes.len(), BASE64.encode(bytes))
}

/// Decodes the raw envelope back into bytes.
///
/// Text without the envelope tag, or with a malformed body, is returned
/// as its UTF-8 bytes unchanged.
#[must_use]
pub fn deserialize_raw(text: &str) -> Vec<u8> {
    let Some(rest) = text.strip_prefix(RAW_PREFIX) else {
        return text.as_bytes().to_vec();
    };
    let Some((len_part, body)) = rest.split_once(':') else {
        return text.as_bytes().to_vec();
    };
    let Ok(expected_len) = len_part.parse::<usize>() else {
        return text.as_bytes().to_vec();
    };
    match BASE64.decode(body) {
        Ok(bytes) if bytes.len() == expected_len => bytes,
        _ => text.as_bytes().to_vec(),
    }
}

/// Whether the text carries a raw byte envelope.
#[must_use]
pub fn is_raw_envelope(text: &str) -> bool {
    text.starts_with(RAW_PREFIX)
}
