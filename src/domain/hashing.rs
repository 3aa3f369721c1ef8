//! Content addressing: 32-char hex hashes and UUIDv7 helpers

use chrono::{DateTime, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Matches a 32-char lowercase hex content hash
pub static HASH_REGEXP_32: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9a-f]{32}$").unwrap());

/// Hash a string into a 32-char hex digest (truncated SHA-256)
pub fn hash_string(s: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(s.as_bytes());
    hex::encode(&hasher.finalize()[..16])
}

/// Hash arbitrary JSON content deterministically. Object keys are sorted
/// recursively so semantically identical payloads produce identical ids.
pub fn hash_content(value: &Value) -> String {
    hash_string(&canonical_json(value))
}

/// Serialize JSON with recursively sorted object keys and no whitespace
pub fn canonical_json(value: &Value) -> String {
    fn write(value: &Value, out: &mut String) {
        match value {
            Value::Object(map) => {
                out.push('{');
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                for (i, key) in keys.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    out.push_str(&serde_json::to_string(key).unwrap_or_default());
                    out.push(':');
                    write(&map[*key], out);
                }
                out.push('}');
            }
            Value::Array(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    write(item, out);
                }
                out.push(']');
            }
            other => out.push_str(&other.to_string()),
        }
    }
    let mut out = String::new();
    write(value, &mut out);
    out
}

/// Time-ordered completion id
pub fn uuid7() -> Uuid {
    Uuid::now_v7()
}

/// Extract the generation time embedded in a UUIDv7
pub fn uuid7_generation_time(id: &Uuid) -> DateTime<Utc> {
    match id.get_timestamp() {
        Some(ts) => {
            let (secs, nanos) = ts.to_unix();
            Utc.timestamp_opt(secs as i64, nanos)
                .single()
                .unwrap_or_else(Utc::now)
        }
        None => Utc::now(),
    }
}

/// Validate a caller-provided id against the 32-hex content hash shape.
/// Anything else must never be interpolated into SQL.
pub fn is_valid_hash_id(id: &str) -> bool {
    HASH_REGEXP_32.is_match(id)
}
