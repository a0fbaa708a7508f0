//! Canonical JSON encoding and content hashing.
//!
//! Every hash in the system is defined over a single canonical encoding:
//! object keys sorted lexicographically, no insignificant whitespace,
//! UTF-8 output, arrays kept in order. Two values are the same object
//! iff their canonical encodings are byte-equal.
//!
//! SHA-256 over the canonical encoding defines object identity. The
//! 16-hex-character prefix ([`content_hash16`]) is used where storage
//! savings matter (checkpoint content hash, step fingerprints); the full
//! digest feeds the golden-record HMAC.
//!
//! # Examples
//!
//! ```
//! use replayweave::canonical::to_canonical_json;
//! use serde_json::json;
//!
//! let a = json!({"b": 1, "a": [2, 3]});
//! assert_eq!(to_canonical_json(&a), r#"{"a":[2,3],"b":1}"#);
//! ```

use std::collections::BTreeMap;

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Number of hex characters retained by [`content_hash16`].
pub const CONTENT_HASH_LEN: usize = 16;

/// Encode a JSON value in canonical form.
///
/// Object keys are emitted in lexicographic (byte) order, arrays keep
/// their order, and no whitespace is inserted. Numbers use serde_json's
/// display form, which is stable across platforms and never carries
/// trailing zeros for integers.
#[must_use]
pub fn to_canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => write_json_string(s, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            // BTreeMap gives the lexicographic key order regardless of
            // the source map's insertion order.
            let sorted: BTreeMap<&str, &Value> = map.iter().map(|(k, v)| (k.as_str(), v)).collect();
            out.push('{');
            for (i, (key, val)) in sorted.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_json_string(key, out);
                out.push(':');
                write_canonical(val, out);
            }
            out.push('}');
        }
    }
}

/// JSON string escaping per RFC 8259: quote, backslash, and control
/// characters are escaped; everything else passes through as UTF-8.
fn write_json_string(s: &str, out: &mut String) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{08}' => out.push_str("\\b"),
            '\u{0c}' => out.push_str("\\f"),
            c if (c as u32) < 0x20 => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

/// Full SHA-256 digest of arbitrary bytes, hex-encoded.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Full SHA-256 over the canonical encoding of a value, hex-encoded.
#[must_use]
pub fn hash_value(value: &Value) -> String {
    sha256_hex(to_canonical_json(value).as_bytes())
}

/// 16-hex-character content hash of a value.
///
/// This is the identity used by the checkpoint store
/// (`last_result_hash`) and anywhere else a short stable fingerprint is
/// enough.
#[must_use]
pub fn content_hash16(value: &Value) -> String {
    let mut digest = hash_value(value);
    digest.truncate(CONTENT_HASH_LEN);
    digest
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sorts_keys_recursively() {
        let v = json!({"z": {"b": 1, "a": 2}, "a": 0});
        assert_eq!(to_canonical_json(&v), r#"{"a":0,"z":{"a":2,"b":1}}"#);
    }

    #[test]
    fn empty_containers() {
        assert_eq!(to_canonical_json(&json!({})), "{}");
        assert_eq!(to_canonical_json(&json!([])), "[]");
        assert_eq!(to_canonical_json(&json!(null)), "null");
    }

    #[test]
    fn escapes_control_characters() {
        let v = json!({"k": "line\nbreak\u{01}"});
        assert_eq!(to_canonical_json(&v), "{\"k\":\"line\\nbreak\\u0001\"}");
    }

    #[test]
    fn content_hash_is_sixteen_hex() {
        let h = content_hash16(&json!({"v": 1}));
        assert_eq!(h.len(), CONTENT_HASH_LEN);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
