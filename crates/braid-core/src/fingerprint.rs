//! Request fingerprinting.
//!
//! The fingerprint is a deterministic hash over
//! `(network, method, canonical(params))` and serves as both the cache key
//! and the single-flight deduplication key. Canonicalization happens inside
//! [`crate::utils::json_hash`]: hex case, quantity zero-padding, and object
//! key order never change a fingerprint.
//!
//! Symbolic block tags (`latest`, `finalized`, ...) are resolved to numeric
//! references before hashing *only* when the caller passes a resolver —
//! the cache layer does so for methods whose policy declares resolution
//! safe. Otherwise the tag is hashed literally and two requests for
//! `latest` at different heights share a fingerprint only for as long as
//! their policy's TTL allows.

use ahash::AHasher;
use std::hash::{Hash, Hasher};

use crate::{
    types::JsonRpcRequest,
    utils::{
        block_param::BlockTag,
        hex_num::format_quantity,
        json_hash::hash_json_value,
    },
};

/// A resolver mapping symbolic block tags to concrete block numbers.
///
/// Typically backed by the serving network's poller snapshots.
pub type TagResolver<'a> = &'a dyn Fn(BlockTag) -> Option<u64>;

/// Computes the fingerprint of a request.
///
/// With `resolve_tags` set, any string parameter that parses as a symbolic
/// tag is replaced by the resolved block number before hashing; unresolvable
/// tags fall back to their literal form.
#[must_use]
pub fn fingerprint(
    network: &str,
    request: &JsonRpcRequest,
    resolve_tags: Option<TagResolver<'_>>,
) -> u64 {
    let mut hasher = AHasher::default();
    network.hash(&mut hasher);
    request.method.hash(&mut hasher);

    match (&request.params, resolve_tags) {
        (Some(params), Some(resolver)) => {
            let resolved = resolve_value(params, resolver);
            hash_json_value(&resolved, &mut hasher);
        }
        (Some(params), None) => hash_json_value(params, &mut hasher),
        (None, _) => 0u8.hash(&mut hasher),
    }

    hasher.finish()
}

/// Renders a fingerprint as a fixed-width hex key segment.
#[must_use]
pub fn as_key_segment(fingerprint: u64) -> String {
    format!("{fingerprint:016x}")
}

fn tag_of(s: &str) -> Option<BlockTag> {
    match s {
        "latest" => Some(BlockTag::Latest),
        "earliest" => Some(BlockTag::Earliest),
        "pending" => Some(BlockTag::Pending),
        "safe" => Some(BlockTag::Safe),
        "finalized" => Some(BlockTag::Finalized),
        _ => None,
    }
}

fn resolve_value(value: &serde_json::Value, resolver: TagResolver<'_>) -> serde_json::Value {
    match value {
        serde_json::Value::String(s) => {
            if let Some(tag) = tag_of(s) {
                if let Some(number) = resolver(tag) {
                    return serde_json::Value::String(format_quantity(number));
                }
            }
            value.clone()
        }
        serde_json::Value::Array(arr) => {
            serde_json::Value::Array(arr.iter().map(|v| resolve_value(v, resolver)).collect())
        }
        serde_json::Value::Object(obj) => serde_json::Value::Object(
            obj.iter().map(|(k, v)| (k.clone(), resolve_value(v, resolver))).collect(),
        ),
        _ => value.clone(),
    }
}
