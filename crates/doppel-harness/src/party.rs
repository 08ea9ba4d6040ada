//! The narrow interface a party under test must expose.
//!
//! The harness treats every party — genuine engine or black-box challenger
//! — as an opaque stepping process. Everything about how a party works
//! internally is out of scope; these contracts are the only dependency.
//!
//! The engine/challenger asymmetry is the point of the protocol: a
//! challenger is never granted morphism registration, which the
//! orchestrator enforces by role.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::digest::{Salt, StateDigest};
use crate::self_closure::MorphismRecord;

/// Upper bound on projection dimensionality a party may report.
pub const MAX_PROJECTION_DIMS: usize = 16;

/// Replay encoding of a masked stimulus. Parties and the counterfactual
/// replay must fold the same value when an input was withheld.
pub const MASKED_STIMULUS_SENTINEL: i64 = i64::MIN + 0x5eed;

/// Canonical replay encoding of a delivered stimulus.
pub fn encode_stimulus(stimulus_millionths: Option<i64>) -> i64 {
    stimulus_millionths.unwrap_or(MASKED_STIMULUS_SENTINEL)
}

// ---------------------------------------------------------------------------
// Roles and step I/O
// ---------------------------------------------------------------------------

/// Which side of the challenge a party plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartyRole {
    /// Claims internal structure; may register morphisms.
    Engine,
    /// Input/output access only; never registers morphisms.
    Challenger,
}

impl PartyRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Engine => "engine",
            Self::Challenger => "challenger",
        }
    }
}

impl fmt::Display for PartyRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The stimulus delivered to a party for one step.
///
/// `stimulus` is `None` when the input is masked by a stress window: the
/// party knows the input was withheld, not what it was.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepInput {
    pub step: u64,
    pub stimulus_millionths: Option<i64>,
}

/// What a party returns from one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepOutput {
    /// Externally observable output (fixed-point millionths).
    pub output_millionths: i64,
    /// Opaque digest of internal state at the step boundary. A stateless
    /// challenger may return a constant.
    pub state_digest: StateDigest,
    /// Hide-then-reveal binding of this step's secret salt.
    pub salt_commitment: StateDigest,
    /// Discretized low-dimensional decode of internal state, used by the
    /// coherence trace and the approximate closure channel.
    pub projection: Vec<i64>,
    /// Virtual ticks the party consumed producing this step.
    pub ticks_consumed: u64,
}

/// A cited `(morphism, digest)` pair in a diagonal answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citation {
    pub morphism_id: String,
    pub claimed_digest: StateDigest,
}

// ---------------------------------------------------------------------------
// PartyError
// ---------------------------------------------------------------------------

/// Errors a party may surface while stepping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartyError {
    /// The party failed to produce a step.
    StepFailed { step: u64, reason: String },
    /// The party reported an invalid projection (too many dims).
    ProjectionTooWide { dims: usize, max: usize },
}

impl fmt::Display for PartyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StepFailed { step, reason } => write!(f, "step {step} failed: {reason}"),
            Self::ProjectionTooWide { dims, max } => {
                write!(f, "projection has {dims} dims, max {max}")
            }
        }
    }
}

impl std::error::Error for PartyError {}

// ---------------------------------------------------------------------------
// Party trait
// ---------------------------------------------------------------------------

/// Contract every party under test implements.
pub trait Party {
    /// Stable identifier for reports and ledgers.
    fn party_id(&self) -> &str;

    fn role(&self) -> PartyRole;

    /// Advance one step under the delivered stimulus.
    fn step(&mut self, input: StepInput) -> Result<StepOutput, PartyError>;

    /// Optionally emit a claimed new rule at this step boundary.
    ///
    /// Engine-only capability: the orchestrator never invokes this for a
    /// challenger, and a challenger implementation should return `None`.
    fn propose_morphism(&mut self, step: u64) -> Option<MorphismRecord>;

    /// Answer a diagonal query: which morphisms does the party believe
    /// were in effect at `step`, with their digests.
    fn explain(&self, step: u64) -> Vec<Citation>;

    /// Disclose the commitment salt for a prior step, or defer.
    fn reveal(&mut self, step: u64) -> Option<Salt>;

    /// Self-description used by the MDL estimate: enough bytes to
    /// reconstruct the party's stepping behavior.
    fn description_bytes(&self) -> Vec<u8>;

    /// Ablation hook: disable or restore a named internal mechanism.
    /// Default is a no-op for parties without the named mechanism.
    fn set_ablation(&mut self, _capability: &str, _active: bool) {}
}

/// Validate a step output against interface limits.
pub fn validate_step_output(output: &StepOutput) -> Result<(), PartyError> {
    if output.projection.len() > MAX_PROJECTION_DIMS {
        return Err(PartyError::ProjectionTooWide {
            dims: output.projection.len(),
            max: MAX_PROJECTION_DIMS,
        });
    }
    Ok(())
}
