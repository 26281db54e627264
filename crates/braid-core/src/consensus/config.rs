//! Consensus configuration types and defaults.

use serde::{Deserialize, Serialize};

/// Configuration for network-level consensus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusConfig {
    /// Number of upstreams queried per round (N, default: 3).
    #[serde(default = "default_required_participants")]
    pub required_participants: usize,

    /// Identical responses required for agreement (T ≤ N, default: 2).
    #[serde(default = "default_agreement_threshold")]
    pub agreement_threshold: usize,

    /// Behavior when no group of ≥ T responses agrees.
    #[serde(default)]
    pub dispute_behavior: DisputeBehavior,

    /// Behavior when fewer than N healthy upstreams are available.
    #[serde(default)]
    pub low_participants_behavior: LowParticipantsBehavior,

    /// Methods requiring consensus; empty means every method.
    #[serde(default)]
    pub methods: Vec<String>,

    /// Round timeout in seconds (default: 10).
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,

    /// Misbehavior punishment; `None` disables cordoning.
    #[serde(default)]
    pub punish_misbehavior: Option<MisbehaviorConfig>,
}

fn default_required_participants() -> usize {
    3
}
fn default_agreement_threshold() -> usize {
    2
}
fn default_timeout_seconds() -> u64 {
    10
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            required_participants: default_required_participants(),
            agreement_threshold: default_agreement_threshold(),
            dispute_behavior: DisputeBehavior::default(),
            low_participants_behavior: LowParticipantsBehavior::default(),
            methods: Vec::new(),
            timeout_seconds: default_timeout_seconds(),
            punish_misbehavior: None,
        }
    }
}

impl ConsensusConfig {
    /// Returns whether `method` is subject to consensus.
    #[must_use]
    pub fn applies_to(&self, method: &str) -> bool {
        self.methods.is_empty() || self.methods.iter().any(|m| crate::utils::glob::matches(m, method))
    }
}

/// Resolution strategy when responses disagree, and equally when too few
/// participants are available.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DisputeBehavior {
    /// Surface a consensus-dispute error.
    #[default]
    ReturnError,
    /// Return the largest group's representative response.
    AcceptMostCommonValidResult,
    /// Return the response from the upstream with the highest observed
    /// block; fall back to most-common on ties or unknown heads.
    PreferBlockHeadLeader,
    /// Return the leader's response or error if it has none.
    OnlyBlockHeadLeader,
}

/// Behavior with fewer than `required_participants` healthy upstreams.
pub type LowParticipantsBehavior = DisputeBehavior;

/// Misbehavior punishment parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MisbehaviorConfig {
    /// Disputes within the window before cordoning.
    #[serde(default = "default_dispute_threshold")]
    pub dispute_threshold: u32,

    /// Sliding window for dispute counting in seconds (default: 300).
    #[serde(default = "default_dispute_window_secs")]
    pub dispute_window_secs: u64,

    /// Cordon duration in seconds (default: 60).
    #[serde(default = "default_sit_out_penalty_secs")]
    pub sit_out_penalty_secs: u64,
}

fn default_dispute_threshold() -> u32 {
    3
}
fn default_dispute_window_secs() -> u64 {
    300
}
fn default_sit_out_penalty_secs() -> u64 {
    60
}

impl Default for MisbehaviorConfig {
    fn default() -> Self {
        Self {
            dispute_threshold: default_dispute_threshold(),
            dispute_window_secs: default_dispute_window_secs(),
            sit_out_penalty_secs: default_sit_out_penalty_secs(),
        }
    }
}
