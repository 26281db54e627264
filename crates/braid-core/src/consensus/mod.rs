//! Multi-upstream consensus.
//!
//! - [`config`]: participants, threshold, dispute/low-participant behavior
//! - [`engine`]: the fan-out round with early agreement termination
//! - [`misbehavior`]: dispute tracking and cordoning

pub mod config;
pub mod engine;
pub mod misbehavior;

pub use config::{ConsensusConfig, DisputeBehavior, LowParticipantsBehavior, MisbehaviorConfig};
pub use engine::ConsensusEngine;
pub use misbehavior::MisbehaviorTracker;
