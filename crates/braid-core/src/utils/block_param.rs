//! Block parameter parsing.
//!
//! Centralizes the handling of block numbers, tags, and hashes so the
//! catalog, cache, and fingerprint layers all agree on what a block
//! reference means.

use thiserror::Error;

/// Error type for block parameter parsing.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid hex string: {0}")]
    InvalidHex(String),
    #[error("invalid block parameter: {0}")]
    InvalidParam(String),
}

/// A block reference extracted from a request or response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockRef {
    /// Specific block number.
    Number(u64),
    /// 32-byte block hash (kept as its canonical lowercase hex string).
    Hash(String),
    /// Symbolic tag (latest, finalized, ...).
    Tag(BlockTag),
    /// The method declares an arbitrary reference ("*"): cacheable without
    /// a concrete block, keyed only by the request fingerprint.
    Arbitrary,
}

impl BlockRef {
    /// Returns the concrete block number, if this reference has one.
    #[must_use]
    pub fn number(&self) -> Option<u64> {
        match self {
            BlockRef::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Renders the reference as a cache-key segment.
    #[must_use]
    pub fn as_key_segment(&self) -> String {
        match self {
            BlockRef::Number(n) => n.to_string(),
            BlockRef::Hash(h) => h.clone(),
            BlockRef::Tag(t) => t.as_str().to_string(),
            BlockRef::Arbitrary => "*".to_string(),
        }
    }
}

/// Standard EVM block tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockTag {
    Latest,
    Earliest,
    Pending,
    Safe,
    Finalized,
}

impl BlockTag {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            BlockTag::Latest => "latest",
            BlockTag::Earliest => "earliest",
            BlockTag::Pending => "pending",
            BlockTag::Safe => "safe",
            BlockTag::Finalized => "finalized",
        }
    }
}

/// Parses a block parameter string into a [`BlockRef`].
///
/// Handles symbolic tags, hex quantities, 32-byte hashes, and decimal
/// numbers.
///
/// # Examples
/// ```
/// use braid_core::utils::block_param::{parse, BlockRef, BlockTag};
///
/// assert_eq!(parse("latest").unwrap(), BlockRef::Tag(BlockTag::Latest));
/// assert_eq!(parse("0x10").unwrap(), BlockRef::Number(16));
/// assert_eq!(parse("100").unwrap(), BlockRef::Number(100));
/// ```
///
/// # Errors
/// Returns [`ParseError`] if the input is not a valid block parameter.
pub fn parse(param: &str) -> Result<BlockRef, ParseError> {
    match param {
        "latest" => Ok(BlockRef::Tag(BlockTag::Latest)),
        "earliest" => Ok(BlockRef::Tag(BlockTag::Earliest)),
        "pending" => Ok(BlockRef::Tag(BlockTag::Pending)),
        "safe" => Ok(BlockRef::Tag(BlockTag::Safe)),
        "finalized" => Ok(BlockRef::Tag(BlockTag::Finalized)),
        s => {
            if let Some(body) = s.strip_prefix("0x") {
                if body.len() == 64 && body.chars().all(|c| c.is_ascii_hexdigit()) {
                    return Ok(BlockRef::Hash(s.to_ascii_lowercase()));
                }
                return u64::from_str_radix(body, 16)
                    .map(BlockRef::Number)
                    .map_err(|_| ParseError::InvalidHex(s.to_string()));
            }
            s.parse::<u64>()
                .map(BlockRef::Number)
                .map_err(|_| ParseError::InvalidParam(s.to_string()))
        }
    }
}

/// Extracts a block reference from a JSON value (string or number).
#[must_use]
pub fn from_json_value(value: &serde_json::Value) -> Option<BlockRef> {
    match value {
        serde_json::Value::String(s) => parse(s).ok(),
        serde_json::Value::Number(n) => n.as_u64().map(BlockRef::Number),
        _ => None,
    }
}
