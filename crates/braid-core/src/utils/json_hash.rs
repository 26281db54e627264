//! Canonical JSON hashing for fingerprints and consensus identity.
//!
//! Hashes `serde_json::Value` trees directly without serializing, with two
//! normalizations applied on the way down:
//!
//! - object keys are hashed in sorted order, so key ordering never affects
//!   identity (`eth_call` objects arrive with arbitrary key order);
//! - hex strings are canonicalized (lowercase, quantity zero-stripping) via
//!   [`crate::utils::hex_num::canonicalize_hex`].
//!
//! The same traversal backs request fingerprints and consensus response
//! comparison, so the two layers can never disagree about value identity.

use ahash::AHasher;
use serde_json::Value;
use std::hash::{Hash, Hasher};

use crate::utils::hex_num::canonicalize_hex;

/// Hashes a `serde_json::Value` into the given hasher.
///
/// Each JSON type is prefixed with a discriminant byte to prevent
/// cross-type collisions: null 0, bool 1, number 2, string 3, array 4,
/// object 5.
pub fn hash_json_value(value: &Value, hasher: &mut impl Hasher) {
    match value {
        Value::Null => 0u8.hash(hasher),
        Value::Bool(b) => {
            1u8.hash(hasher);
            b.hash(hasher);
        }
        Value::Number(n) => {
            2u8.hash(hasher);
            if let Some(i) = n.as_i64() {
                0u8.hash(hasher);
                i.hash(hasher);
            } else if let Some(u) = n.as_u64() {
                1u8.hash(hasher);
                u.hash(hasher);
            } else if let Some(f) = n.as_f64() {
                2u8.hash(hasher);
                // Normalize NaN so semantically equal values never hash
                // differently across upstreams; infinities already have
                // unique bit patterns.
                let bits = if f.is_nan() {
                    f64::NAN.to_bits()
                } else {
                    f.to_bits()
                };
                bits.hash(hasher);
            }
        }
        Value::String(s) => {
            3u8.hash(hasher);
            if s.starts_with("0x") || s.starts_with("0X") {
                canonicalize_hex(s).hash(hasher);
            } else {
                s.hash(hasher);
            }
        }
        Value::Array(arr) => {
            4u8.hash(hasher);
            arr.len().hash(hasher);
            for element in arr {
                hash_json_value(element, hasher);
            }
        }
        Value::Object(obj) => {
            5u8.hash(hasher);
            obj.len().hash(hasher);

            let mut sorted_keys: Vec<&String> = obj.keys().collect();
            sorted_keys.sort_unstable();

            for key in sorted_keys {
                key.hash(hasher);
                if let Some(v) = obj.get(key) {
                    hash_json_value(v, hasher);
                }
            }
        }
    }
}

/// Hashes a JSON value to a `u64` with a fresh hasher.
#[must_use]
pub fn hash_value(value: &Value) -> u64 {
    let mut hasher = AHasher::default();
    hash_json_value(value, &mut hasher);
    hasher.finish()
}

/// Computes the consensus identity hash of a response payload.
///
/// Only the `result`/`error` content participates; `jsonrpc` and `id` are
/// stripped so identical payloads from different upstreams compare equal.
#[must_use]
pub fn hash_response(response: &crate::types::JsonRpcResponse) -> u64 {
    let mut hasher = AHasher::default();
    match (&response.result, &response.error) {
        (Some(result), _) => {
            0u8.hash(&mut hasher);
            hash_json_value(result, &mut hasher);
        }
        (None, Some(error)) => {
            1u8.hash(&mut hasher);
            error.code.hash(&mut hasher);
            error.message.hash(&mut hasher);
        }
        (None, None) => 2u8.hash(&mut hasher),
    }
    hasher.finish()
}
