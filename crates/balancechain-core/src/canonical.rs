//! Canonical JSON encoding for deterministic serialization.
//!
//! The rules:
//! - Object keys sorted lexicographically (byte order) at every depth
//! - Arrays keep their order
//! - Compact separators, standard JSON literals
//! - Absent optional fields are omitted entirely
//!
//! The canonical encoding is critical: the same segment must produce
//! identical bytes (and thus identical hashes) across all platforms.
//! The JSON string `"null"` and the null sentinel remain distinct
//! (`"null"` vs `null`), so no value collapses into another.
//!
//! **CRITICAL**: This encoding is FROZEN. Changes break every existing
//! signature and block hash.

use serde_json::Value;

/// Encode a JSON value to its canonical string form.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_value(&mut out, value);
    out
}

/// Canonical encoding as UTF-8 bytes, ready for hashing or signing.
pub fn canonical_bytes(value: &Value) -> Vec<u8> {
    canonical_json(value).into_bytes()
}

fn write_value(out: &mut String, value: &Value) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        // serde_json renders numbers with the shortest round-trip
        // representation, which is stable across platforms.
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => {
            out.push_str(&serde_json::to_string(s).expect("string serialization is infallible"))
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(out, item);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();

            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(
                    &serde_json::to_string(key).expect("string serialization is infallible"),
                );
                out.push(':');
                write_value(out, &map[*key]);
            }
            out.push('}');
        }
    }
}
