//! Method catalog: per-method block-reference paths and finality classes.
//!
//! Every cacheable decision in the gateway starts here. Each RPC method maps
//! to a [`MethodSpec`] describing where a block reference lives in the
//! request parameters (`req_refs`) and/or the response body (`resp_refs`),
//! and which [`FinalityClass`] governs how responses are classified:
//!
//! - **Static** (`eth_chainId`): the answer never changes; responses are
//!   `finalized` immediately.
//! - **Realtime** (`eth_blockNumber`): the answer changes every block;
//!   responses are `realtime` and only cacheable with sub-second TTLs.
//! - **WithBlock** (`eth_getLogs`): the request or response names a block;
//!   finality follows from comparing it to the upstream's finalized head.
//! - **Special** (`eth_getTransactionReceipt`): the object is identified by
//!   hash and may reorg; finality is `unknown` but caching is safe because
//!   the caller owns the hash.

use std::{collections::HashMap, sync::LazyLock};

use crate::{
    types::Finality,
    utils::block_param::{self, BlockRef, BlockTag},
};

/// Finality class of an RPC method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalityClass {
    Static,
    Realtime,
    WithBlock,
    Special,
}

/// One segment of a reference path into the request params or response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefSeg {
    /// Positional index into the params array.
    Index(usize),
    /// Object key lookup.
    Key(&'static str),
    /// Arbitrary reference: cacheable without a concrete block.
    Any,
}

/// Catalog entry for a single RPC method.
#[derive(Debug, Clone, Copy)]
pub struct MethodSpec {
    pub finality_class: FinalityClass,
    /// Paths into the request params that may hold a block reference.
    pub req_refs: &'static [&'static [RefSeg]],
    /// Paths into the response result that may hold a block reference.
    pub resp_refs: &'static [&'static [RefSeg]],
}

const NO_REFS: &[&[RefSeg]] = &[];
const FIRST_PARAM: &[&[RefSeg]] = &[&[RefSeg::Index(0)]];
const SECOND_PARAM: &[&[RefSeg]] = &[&[RefSeg::Index(1)]];
const THIRD_PARAM: &[&[RefSeg]] = &[&[RefSeg::Index(2)]];
const ARBITRARY: &[&[RefSeg]] = &[&[RefSeg::Any]];
const NUMBER_OR_HASH: &[&[RefSeg]] = &[&[RefSeg::Key("number")], &[RefSeg::Key("hash")]];
const BLOCK_NUMBER_OR_HASH: &[&[RefSeg]] =
    &[&[RefSeg::Key("blockNumber")], &[RefSeg::Key("blockHash")]];
const LOGS_FILTER: &[&[RefSeg]] = &[
    &[RefSeg::Index(0), RefSeg::Key("fromBlock")],
    &[RefSeg::Index(0), RefSeg::Key("toBlock")],
    &[RefSeg::Index(0), RefSeg::Key("blockHash")],
];

const fn static_method() -> MethodSpec {
    MethodSpec { finality_class: FinalityClass::Static, req_refs: NO_REFS, resp_refs: NO_REFS }
}

const fn realtime_method() -> MethodSpec {
    MethodSpec { finality_class: FinalityClass::Realtime, req_refs: NO_REFS, resp_refs: NO_REFS }
}

const fn with_block(req: &'static [&'static [RefSeg]], resp: &'static [&'static [RefSeg]]) -> MethodSpec {
    MethodSpec { finality_class: FinalityClass::WithBlock, req_refs: req, resp_refs: resp }
}

const fn special(resp: &'static [&'static [RefSeg]]) -> MethodSpec {
    MethodSpec { finality_class: FinalityClass::Special, req_refs: ARBITRARY, resp_refs: resp }
}

/// Default method catalog.
static CATALOG: LazyLock<HashMap<&'static str, MethodSpec>> = LazyLock::new(|| {
    let mut m = HashMap::new();

    // Fixed values.
    m.insert("eth_chainId", static_method());
    m.insert("net_version", static_method());

    // Per-block values.
    m.insert("eth_blockNumber", realtime_method());
    m.insert("eth_gasPrice", realtime_method());
    m.insert("eth_maxPriorityFeePerGas", realtime_method());
    m.insert("eth_blobBaseFee", realtime_method());
    m.insert("eth_syncing", realtime_method());
    m.insert("eth_mining", realtime_method());
    m.insert("eth_hashrate", realtime_method());
    m.insert("net_peerCount", realtime_method());

    // Block-referencing methods.
    m.insert("eth_getLogs", with_block(LOGS_FILTER, NO_REFS));
    m.insert("eth_getBlockByNumber", with_block(FIRST_PARAM, NUMBER_OR_HASH));
    m.insert("eth_getBlockByHash", with_block(FIRST_PARAM, NUMBER_OR_HASH));
    m.insert("eth_getBlockTransactionCountByNumber", with_block(FIRST_PARAM, NO_REFS));
    m.insert(
        "eth_getTransactionByBlockNumberAndIndex",
        with_block(FIRST_PARAM, BLOCK_NUMBER_OR_HASH),
    );
    m.insert("eth_getBlockReceipts", with_block(FIRST_PARAM, BLOCK_NUMBER_OR_HASH));
    m.insert("eth_getBalance", with_block(SECOND_PARAM, NO_REFS));
    m.insert("eth_getCode", with_block(SECOND_PARAM, NO_REFS));
    m.insert("eth_getTransactionCount", with_block(SECOND_PARAM, NO_REFS));
    m.insert("eth_call", with_block(SECOND_PARAM, NO_REFS));
    m.insert("eth_estimateGas", with_block(SECOND_PARAM, NO_REFS));
    m.insert("eth_feeHistory", with_block(SECOND_PARAM, NO_REFS));
    m.insert("eth_getStorageAt", with_block(THIRD_PARAM, NO_REFS));
    m.insert("eth_getProof", with_block(THIRD_PARAM, NO_REFS));

    // Hash-identified objects.
    m.insert("eth_getTransactionReceipt", special(BLOCK_NUMBER_OR_HASH));
    m.insert("eth_getTransactionByHash", special(BLOCK_NUMBER_OR_HASH));
    m.insert("debug_traceTransaction", special(NO_REFS));
    m.insert("eth_getUncleByBlockHashAndIndex", special(NUMBER_OR_HASH));

    m
});

/// Looks up the catalog entry for a method.
#[must_use]
pub fn lookup(method: &str) -> Option<&'static MethodSpec> {
    CATALOG.get(method)
}

/// Walks one reference path into a JSON value.
fn walk_path(root: &serde_json::Value, path: &[RefSeg]) -> Option<BlockRef> {
    let mut current = root;
    for seg in path {
        match seg {
            RefSeg::Any => return Some(BlockRef::Arbitrary),
            RefSeg::Index(i) => current = current.as_array()?.get(*i)?,
            RefSeg::Key(k) => current = current.as_object()?.get(*k)?,
        }
    }
    block_param::from_json_value(current)
}

/// Resolves all reference paths against a root value and merges the results.
///
/// Symbolic tags win over concrete numbers (a range ending in `latest` is
/// only as durable as `latest`); among concrete numbers the highest wins
/// (the durability of a range follows its newest block); hashes are used
/// only when nothing better resolves.
fn resolve_refs(root: &serde_json::Value, paths: &[&[RefSeg]]) -> Option<BlockRef> {
    let mut best_number: Option<u64> = None;
    let mut hash: Option<String> = None;

    for path in paths {
        match walk_path(root, path) {
            Some(BlockRef::Tag(tag)) => return Some(BlockRef::Tag(tag)),
            Some(BlockRef::Arbitrary) => return Some(BlockRef::Arbitrary),
            Some(BlockRef::Number(n)) => {
                best_number = Some(best_number.map_or(n, |b| b.max(n)));
            }
            Some(BlockRef::Hash(h)) => hash = Some(h),
            None => {}
        }
    }

    best_number.map(BlockRef::Number).or(hash.map(BlockRef::Hash))
}

/// Extracts the block reference from a request's parameters.
#[must_use]
pub fn request_block_ref(spec: &MethodSpec, params: Option<&serde_json::Value>) -> Option<BlockRef> {
    let params = params?;
    resolve_refs(params, spec.req_refs)
}

/// Extracts the block reference from a response body.
#[must_use]
pub fn response_block_ref(spec: &MethodSpec, result: Option<&serde_json::Value>) -> Option<BlockRef> {
    let result = result?;
    // Response refs are paths into the result object itself (not the params
    // array), so each path is walked from the result root.
    resolve_refs(result, spec.resp_refs)
}

/// Classifies the finality of a response.
///
/// `block_ref` is the best reference available (response refs preferred over
/// request refs); `finalized_block` is the serving upstream's finalized head
/// at dispatch time.
#[must_use]
pub fn classify_finality(
    class: FinalityClass,
    block_ref: Option<&BlockRef>,
    finalized_block: Option<u64>,
) -> Finality {
    match class {
        FinalityClass::Static => Finality::Finalized,
        FinalityClass::Realtime => Finality::Realtime,
        FinalityClass::Special => Finality::Unknown,
        FinalityClass::WithBlock => match block_ref {
            Some(BlockRef::Number(n)) => match finalized_block {
                Some(finalized) if *n <= finalized => Finality::Finalized,
                Some(_) => Finality::Unfinalized,
                None => Finality::Unknown,
            },
            Some(BlockRef::Tag(BlockTag::Earliest | BlockTag::Finalized | BlockTag::Safe)) => {
                Finality::Finalized
            }
            Some(BlockRef::Tag(BlockTag::Latest | BlockTag::Pending)) => Finality::Unfinalized,
            Some(BlockRef::Hash(_) | BlockRef::Arbitrary) | None => Finality::Unknown,
        },
    }
}
