//! Hex quantity parsing and canonicalization.
//!
//! EVM JSON-RPC encodes quantities as `0x`-prefixed hex with no leading
//! zeros, but upstreams are sloppy: mixed case, padded zeros, and bare hex
//! all occur in the wild. Canonicalization here keeps request fingerprints
//! stable across those variations.

/// Parses a `0x`-prefixed (or bare) hex string into a `u64`.
#[must_use]
pub fn parse_quantity(s: &str) -> Option<u64> {
    let s = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
    u64::from_str_radix(s, 16).ok()
}

/// Formats a block number as a canonical `0x`-prefixed hex quantity.
#[must_use]
pub fn format_quantity(value: u64) -> String {
    format!("0x{value:x}")
}

/// Canonicalizes a hex string for fingerprinting.
///
/// - All hex is lowercased.
/// - Fixed-width values (20-byte addresses, 32-byte hashes) keep their
///   padding; only the case changes.
/// - Everything else is treated as a quantity: leading zeros are stripped
///   down to a single digit, so `0x01` and `0x1` fingerprint identically
///   and `0x0` is preserved.
///
/// Non-hex strings are returned unchanged.
#[must_use]
pub fn canonicalize_hex(s: &str) -> String {
    let Some(body) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) else {
        return s.to_string();
    };
    if body.is_empty() || !body.chars().all(|c| c.is_ascii_hexdigit()) {
        return s.to_string();
    }

    let lower = body.to_ascii_lowercase();

    // Addresses and hashes are identified by their fixed width.
    if lower.len() == 40 || lower.len() == 64 {
        return format!("0x{lower}");
    }

    let stripped = lower.trim_start_matches('0');
    if stripped.is_empty() {
        "0x0".to_string()
    } else {
        format!("0x{stripped}")
    }
}
