//! Canonical serialization, SHA-256 digests, and bit-level helpers shared by
//! invite/welcome verification and proof-of-work admission.

use crate::error::CryptoError;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Canonical JSON-like encoding used for signing and PoW base strings.
///
/// - `null` → `"null"`
/// - scalars → their minimal JSON encoding (RFC 8259)
/// - arrays → `[` + comma-joined recursive encodings + `]`, order preserved
/// - objects → `{` + comma-joined `"key":value` in key-ascending (code unit)
///   order + `}`
///
/// Deterministic: no whitespace is ever introduced, array order is never
/// touched, and object keys are always sorted the same way regardless of
/// the order they were inserted in the source value.
pub fn canonicalize(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(_) | Value::Number(_) => {
            serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
        }
        Value::String(s) => encode_json_string(s),
        Value::Array(items) => {
            let joined = items
                .iter()
                .map(canonicalize)
                .collect::<Vec<_>>()
                .join(",");
            format!("[{joined}]")
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_by(|a, b| a.as_str().cmp(b.as_str()));
            let joined = keys
                .iter()
                .map(|k| {
                    let v = &map[k.as_str()];
                    format!("{}:{}", encode_json_string(k), canonicalize(v))
                })
                .collect::<Vec<_>>()
                .join(",");
            format!("{{{joined}}}")
        }
    }
}

fn encode_json_string(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| "\"\"".to_string())
}

/// SHA-256 over the UTF-8 bytes of `data`, hex-encoded lowercase.
pub fn sha256_hex(data: &str) -> String {
    let digest = Sha256::digest(data.as_bytes());
    hex::encode(digest)
}

/// SHA-256 over raw bytes, hex-encoded lowercase.
pub fn sha256_hex_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Count leading zero bits in a hex digest string, inspecting nibbles
/// left-to-right.
pub fn leading_zero_bits(hex_digest: &str) -> u32 {
    let mut bits = 0u32;
    for c in hex_digest.chars() {
        let nibble = match c.to_digit(16) {
            Some(n) => n as u8,
            None => break,
        };
        if nibble == 0 {
            bits += 4;
            continue;
        }
        bits += nibble.leading_zeros() - 4;
        break;
    }
    bits
}

/// Lowercase a hex string and reject anything that is not valid hex.
pub fn normalize_hex_key(key: &str) -> Result<String, CryptoError> {
    let trimmed = key.trim();
    if trimmed.is_empty() || !trimmed.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(CryptoError::InvalidHex(key.to_string()));
    }
    Ok(trimmed.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_object_sorts_keys() {
        let a = json!({"b": 1, "a": 2});
        let b = json!({"a": 2, "b": 1});
        assert_eq!(canonicalize(&a), canonicalize(&b));
        assert_eq!(canonicalize(&a), r#"{"a":2,"b":1}"#);
    }

    #[test]
    fn canonical_array_preserves_order() {
        let v = json!([3, 1, 2]);
        assert_eq!(canonicalize(&v), "[3,1,2]");
    }

    #[test]
    fn canonical_null() {
        assert_eq!(canonicalize(&Value::Null), "null");
    }

    #[test]
    fn sha256_is_deterministic() {
        assert_eq!(sha256_hex("abc"), sha256_hex("abc"));
        assert_ne!(sha256_hex("abc"), sha256_hex("abd"));
    }

    #[test]
    fn leading_zero_bits_counts_nibbles() {
        assert_eq!(leading_zero_bits("00ff"), 8);
        assert_eq!(leading_zero_bits("0fff"), 4);
        assert_eq!(leading_zero_bits("1fff"), 0);
        assert_eq!(leading_zero_bits("0000"), 16);
    }

    #[test]
    fn normalize_hex_key_lowercases_and_trims() {
        assert_eq!(normalize_hex_key(" ABCDEF ").unwrap(), "abcdef");
        assert!(normalize_hex_key("not hex!").is_err());
    }
}
