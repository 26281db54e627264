//! Consensus round execution.
//!
//! Fans a request out to the top-N scored, healthy, eligible upstreams
//! concurrently and waits until either T identical responses arrive (early
//! agreement: remaining attempts are cancelled) or every participant has
//! responded or timed out. Identity is the canonical response hash with
//! `jsonrpc`/`id` stripped; only non-error responses and explicit
//! execution-revert errors participate in comparison.

use futures_util::future::select_all;
use std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    sync::Arc,
    time::Duration,
};
use tracing::{debug, info, warn};

use crate::{
    consensus::{
        config::{ConsensusConfig, DisputeBehavior},
        misbehavior::MisbehaviorTracker,
    },
    types::{JsonRpcRequest, JsonRpcResponse},
    upstream::{
        endpoint::Upstream,
        errors::{RpcErrorCategory, UpstreamError},
        metrics::{MetricsKey, MetricsTracker},
    },
    utils::json_hash,
};

/// One group of identical responses.
struct ResponseGroup {
    response: JsonRpcResponse,
    upstreams: Vec<Arc<str>>,
}

/// A participant's completed, comparison-eligible response.
struct Vote {
    upstream: Arc<str>,
    /// The participant's latest block at dispatch time.
    head: u64,
    hash: u64,
}

type RoundOutcome = (Arc<str>, u64, Result<JsonRpcResponse, UpstreamError>);
type RoundFuture<'a> = Pin<Box<dyn Future<Output = RoundOutcome> + Send + 'a>>;

pub struct ConsensusEngine {
    network: Arc<str>,
    config: ConsensusConfig,
    metrics: Arc<MetricsTracker>,
    misbehavior: Option<Arc<MisbehaviorTracker>>,
}

impl ConsensusEngine {
    #[must_use]
    pub fn new(network: Arc<str>, config: ConsensusConfig, metrics: Arc<MetricsTracker>) -> Self {
        let misbehavior = config
            .punish_misbehavior
            .clone()
            .map(|punish| Arc::new(MisbehaviorTracker::new(punish)));
        if misbehavior.is_some() {
            info!(network = %network, "misbehavior punishment enabled for consensus");
        }
        Self { network, config, metrics, misbehavior }
    }

    /// Whether `method` is subject to consensus on this network.
    #[must_use]
    pub fn applies_to(&self, method: &str) -> bool {
        self.config.applies_to(method)
    }

    /// The cordon tracker, for the selector's eligibility filter.
    #[must_use]
    pub fn misbehavior(&self) -> Option<&Arc<MisbehaviorTracker>> {
        self.misbehavior.as_ref()
    }

    /// Executes one consensus round.
    ///
    /// `candidates` must already be scored, healthy, and eligible (the
    /// selector's output); the engine takes the top
    /// `required_participants` of them.
    ///
    /// # Errors
    ///
    /// - [`UpstreamError::ConsensusLowParticipants`] under the
    ///   `returnError` low-participant behavior
    /// - [`UpstreamError::ConsensusDispute`] under the `returnError`
    ///   dispute behavior
    /// - [`UpstreamError::NoHealthyUpstreams`] when nothing responded
    pub async fn execute(
        &self,
        request: &Arc<JsonRpcRequest>,
        candidates: &[Arc<Upstream>],
    ) -> Result<JsonRpcResponse, UpstreamError> {
        let wanted = self.config.required_participants.max(1);
        let participants: Vec<Arc<Upstream>> = candidates.iter().take(wanted).cloned().collect();

        if participants.is_empty() {
            return Err(UpstreamError::NoHealthyUpstreams);
        }

        let behavior = if participants.len() < wanted {
            debug!(
                network = %self.network,
                available = participants.len(),
                required = wanted,
                "consensus round below required participants"
            );
            match self.config.low_participants_behavior {
                DisputeBehavior::ReturnError => {
                    return Err(UpstreamError::ConsensusLowParticipants(format!(
                        "{} of {} required upstreams available",
                        participants.len(),
                        wanted
                    )));
                }
                DisputeBehavior::OnlyBlockHeadLeader => {
                    return self.leader_only(request, &participants).await;
                }
                other => other,
            }
        } else {
            self.config.dispute_behavior
        };

        self.run_round(request, &participants, behavior).await
    }

    /// Dispatches to the block-head leader alone.
    async fn leader_only(
        &self,
        request: &Arc<JsonRpcRequest>,
        participants: &[Arc<Upstream>],
    ) -> Result<JsonRpcResponse, UpstreamError> {
        let leader = participants
            .iter()
            .max_by_key(|u| (u.snapshot().latest, std::cmp::Reverse(Arc::clone(u.id()))))
            .ok_or(UpstreamError::NoHealthyUpstreams)?;
        leader.forward(request).await
    }

    #[allow(clippy::too_many_lines)]
    async fn run_round(
        &self,
        request: &Arc<JsonRpcRequest>,
        participants: &[Arc<Upstream>],
        behavior: DisputeBehavior,
    ) -> Result<JsonRpcResponse, UpstreamError> {
        let threshold = self.config.agreement_threshold.max(1);
        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(self.config.timeout_seconds);

        let mut futures: Vec<RoundFuture<'_>> = participants
            .iter()
            .map(|upstream| {
                let up = Arc::clone(upstream);
                let req = Arc::clone(request);
                let fut: RoundFuture<'_> = Box::pin(async move {
                    let head = up.snapshot().latest;
                    let result = up.forward(&req).await;
                    (Arc::clone(up.id()), head, result)
                });
                fut
            })
            .collect();

        let mut groups: HashMap<u64, ResponseGroup> = HashMap::new();
        let mut votes: Vec<Vote> = Vec::new();
        let mut last_error: Option<UpstreamError> = None;

        loop {
            if futures.is_empty() {
                break;
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match tokio::time::timeout(remaining, select_all(futures)).await {
                Ok(((upstream, head, result), _index, rest)) => {
                    futures = rest;
                    match result {
                        Ok(response) => {
                            let hash = json_hash::hash_response(&response);
                            let group = groups.entry(hash).or_insert_with(|| ResponseGroup {
                                response,
                                upstreams: Vec::new(),
                            });
                            group.upstreams.push(Arc::clone(&upstream));
                            votes.push(Vote { upstream, head, hash });

                            if group.upstreams.len() >= threshold {
                                // Early agreement: cancel the stragglers.
                                drop(futures);
                                return Ok(self.finish(request, groups, &votes, hash));
                            }
                        }
                        Err(error) => {
                            // Execution reverts are a result, not a fault:
                            // they participate in agreement comparison as
                            // an error envelope.
                            if error.rpc_category() == Some(RpcErrorCategory::ExecutionError) {
                                if let UpstreamError::Rpc(code, message) = &error {
                                    let envelope = JsonRpcResponse::error(
                                        *code,
                                        message.clone(),
                                        Arc::clone(&request.id),
                                    );
                                    let hash = json_hash::hash_response(&envelope);
                                    let group =
                                        groups.entry(hash).or_insert_with(|| ResponseGroup {
                                            response: envelope,
                                            upstreams: Vec::new(),
                                        });
                                    group.upstreams.push(Arc::clone(&upstream));
                                    votes.push(Vote { upstream, head, hash });

                                    if group.upstreams.len() >= threshold {
                                        drop(futures);
                                        return Ok(self.finish(request, groups, &votes, hash));
                                    }
                                    continue;
                                }
                            }
                            warn!(
                                network = %self.network,
                                upstream = %upstream,
                                error = %error,
                                "consensus participant failed"
                            );
                            last_error = Some(error);
                        }
                    }
                }
                Err(_) => {
                    debug!(network = %self.network, "consensus round timed out with partial votes");
                    break;
                }
            }
        }

        if groups.is_empty() {
            return Err(last_error.unwrap_or(UpstreamError::NoHealthyUpstreams));
        }

        // The full round completed without reaching the threshold.
        self.resolve_dispute(request, groups, &votes, behavior)
    }

    /// Returns the winning response and punishes disagreeing respondents.
    fn finish(
        &self,
        request: &Arc<JsonRpcRequest>,
        groups: HashMap<u64, ResponseGroup>,
        votes: &[Vote],
        winning_hash: u64,
    ) -> JsonRpcResponse {
        self.punish_losers(request, votes, winning_hash);
        groups
            .into_iter()
            .find_map(|(hash, group)| (hash == winning_hash).then_some(group.response))
            .unwrap_or_else(|| {
                // The winning hash always maps to a stored group.
                JsonRpcResponse::error(-32603, "consensus bookkeeping failed".into(), Arc::clone(&request.id))
            })
    }

    fn resolve_dispute(
        &self,
        request: &Arc<JsonRpcRequest>,
        groups: HashMap<u64, ResponseGroup>,
        votes: &[Vote],
        behavior: DisputeBehavior,
    ) -> Result<JsonRpcResponse, UpstreamError> {
        match behavior {
            DisputeBehavior::ReturnError => Err(UpstreamError::ConsensusDispute(format!(
                "no group reached threshold {} across {} distinct responses",
                self.config.agreement_threshold,
                groups.len()
            ))),
            DisputeBehavior::AcceptMostCommonValidResult => {
                let hash = Self::most_common_hash(&groups);
                Ok(self.finish(request, groups, votes, hash))
            }
            DisputeBehavior::PreferBlockHeadLeader => {
                let hash = Self::leader_hash(votes).unwrap_or_else(|| Self::most_common_hash(&groups));
                Ok(self.finish(request, groups, votes, hash))
            }
            DisputeBehavior::OnlyBlockHeadLeader => match Self::leader_hash(votes) {
                Some(hash) => Ok(self.finish(request, groups, votes, hash)),
                None => Err(UpstreamError::ConsensusDispute(
                    "block head leader produced no comparable response".to_string(),
                )),
            },
        }
    }

    /// Largest group; ties break by the lexicographically smallest member
    /// upstream id for determinism.
    fn most_common_hash(groups: &HashMap<u64, ResponseGroup>) -> u64 {
        groups
            .iter()
            .max_by(|(_, a), (_, b)| {
                a.upstreams
                    .len()
                    .cmp(&b.upstreams.len())
                    .then_with(|| b.min_id().cmp(&a.min_id()))
            })
            .map_or(0, |(hash, _)| *hash)
    }

    /// Hash voted by the respondent with the highest observed block.
    ///
    /// Returns `None` when heads are unknown (all zero) or the top heads
    /// tie across different hashes, pushing resolution to most-common.
    fn leader_hash(votes: &[Vote]) -> Option<u64> {
        let top = votes.iter().map(|v| v.head).max()?;
        if top == 0 {
            return None;
        }
        let mut leaders: Vec<&Vote> = votes.iter().filter(|v| v.head == top).collect();
        leaders.sort_by(|a, b| a.upstream.cmp(&b.upstream));
        let first_hash = leaders.first()?.hash;
        if leaders.iter().all(|v| v.hash == first_hash) {
            Some(first_hash)
        } else {
            None
        }
    }

    fn punish_losers(&self, request: &Arc<JsonRpcRequest>, votes: &[Vote], winning_hash: u64) {
        let method: Arc<str> = Arc::from(request.method.as_str());
        for vote in votes.iter().filter(|v| v.hash != winning_hash) {
            // Soft penalty: degrade the score so selection drifts away.
            let key = MetricsKey {
                upstream: Arc::clone(&vote.upstream),
                network: Arc::clone(&self.network),
                method: Arc::clone(&method),
            };
            self.metrics.series(&key).record_error();

            // Hard penalty: count toward cordoning.
            if let Some(tracker) = &self.misbehavior {
                if tracker.record_dispute(&vote.upstream, &method) {
                    warn!(
                        network = %self.network,
                        upstream = %vote.upstream,
                        method = %method,
                        "upstream cordoned after consensus disputes"
                    );
                }
            }
        }
    }
}

impl ResponseGroup {
    fn min_id(&self) -> Arc<str> {
        self.upstreams
            .iter()
            .min()
            .cloned()
            .unwrap_or_else(|| Arc::from(""))
    }
}
