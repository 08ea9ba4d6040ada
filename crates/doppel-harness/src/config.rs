//! Published protocol configuration.
//!
//! Every knob that shapes scoring — thresholds, defer budgets, verdict
//! weights — lives here, is validated up front, and is committed to the
//! ledger as the genesis chain link before the first step. Adjusting the
//! config after the fact breaks every chain in the session, so weighting
//! cannot be silently tuned per run to favor a desired outcome.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::digest::StateDigest;
use crate::torsion_stress::{
    PerturbationKind, ScheduleError, StressSchedule, StressWindow,
};

pub const PROTOCOL_CONFIG_SCHEMA_VERSION: &str = "doppel-harness.protocol-config.v1";

/// Fixed-point scale: 1_000_000 ≡ 1.0.
const MILLION: i64 = 1_000_000;

// ---------------------------------------------------------------------------
// VerdictWeights
// ---------------------------------------------------------------------------

/// Fixed weighting of the four test components. Must sum to 1.0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerdictWeights {
    pub closure_millionths: i64,
    pub stress_millionths: i64,
    pub diagonal_millionths: i64,
    pub mdl_millionths: i64,
}

impl VerdictWeights {
    /// Equal weighting across the four tests.
    pub fn balanced() -> Self {
        Self {
            closure_millionths: 250_000,
            stress_millionths: 250_000,
            diagonal_millionths: 250_000,
            mdl_millionths: 250_000,
        }
    }

    pub fn sum(&self) -> i64 {
        self.closure_millionths
            + self.stress_millionths
            + self.diagonal_millionths
            + self.mdl_millionths
    }
}

// ---------------------------------------------------------------------------
// ProtocolConfig
// ---------------------------------------------------------------------------

/// The full published protocol configuration for a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolConfig {
    pub schema_version: String,
    /// Session PRNG seed: stimuli, query selection, and fixture salts all
    /// derive from it.
    pub session_seed: u64,
    /// Number of lock-step steps in the session.
    pub steps: u64,
    /// Virtual tick budget per party per step.
    pub step_tick_budget: u64,
    /// Retries for an over-budget step before scoring a timeout.
    pub timeout_retry_cap: u32,
    /// Minimum ticks between a commit and its reveal.
    pub reveal_delay_ticks: u64,
    /// Deferred reveals allowed before `incomplete` escalates to fail.
    pub max_defer_count: u32,
    /// Closure score below this over the rolling window reports
    /// `closure_fail`.
    pub closure_threshold_millionths: i64,
    /// Replay target distance after a morphism's origin step.
    pub closure_check_horizon: u64,
    /// Sessions in the rolling closure window.
    pub closure_window_sessions: usize,
    /// Diagonal queries issued per session.
    pub diagonal_query_count: usize,
    /// Queries target steps at or after this bound.
    pub diagonal_min_step: u64,
    /// Minimum correct fraction (below 1.0: lossy summarization of old
    /// history is legitimate).
    pub diagonal_threshold_millionths: i64,
    /// K: recovery tail length after each stress window.
    pub recovery_window_steps: u64,
    /// Seed fraction that must rebound for the campaign invariant.
    pub rebound_quorum_millionths: i64,
    /// Behavior-match fraction above which a smaller challenger disproves
    /// separation.
    pub mdl_behavior_match_threshold_millionths: i64,
    /// Sessions in the rolling MDL margin window.
    pub mdl_window_sessions: usize,
    pub weights: VerdictWeights,
    pub stress_schedule: StressSchedule,
}

/// Configuration validation failures.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ConfigError {
    #[error("schema_version `{actual}` != expected `{expected}`")]
    SchemaMismatch { expected: String, actual: String },
    #[error("steps must be positive")]
    ZeroSteps,
    #[error("step_tick_budget must be positive")]
    ZeroTickBudget,
    #[error("verdict weights sum to {sum}, expected 1000000")]
    WeightsNotNormalized { sum: i64 },
    #[error("{name} = {value} outside [0, 1000000]")]
    ThresholdOutOfRange { name: String, value: i64 },
    #[error("diagonal_min_step {min_step} >= steps {steps}")]
    DiagonalMinStepOutOfRange { min_step: u64, steps: u64 },
    #[error("stress schedule invalid: {0}")]
    Schedule(#[from] ScheduleError),
}

impl ProtocolConfig {
    /// Baseline configuration: 100 steps, one full-mask window at 40–50,
    /// equal verdict weights. The starting point for tests and the CLI.
    pub fn baseline(session_seed: u64) -> Self {
        Self {
            schema_version: PROTOCOL_CONFIG_SCHEMA_VERSION.to_string(),
            session_seed,
            steps: 100,
            step_tick_budget: 1_000,
            timeout_retry_cap: 2,
            reveal_delay_ticks: 5_000,
            max_defer_count: 3,
            closure_threshold_millionths: 600_000,
            closure_check_horizon: 9,
            closure_window_sessions: 5,
            diagonal_query_count: 5,
            diagonal_min_step: 60,
            diagonal_threshold_millionths: 700_000,
            recovery_window_steps: 8,
            rebound_quorum_millionths: 900_000,
            mdl_behavior_match_threshold_millionths: 900_000,
            mdl_window_sessions: 5,
            weights: VerdictWeights::balanced(),
            stress_schedule: StressSchedule::new(vec![StressWindow {
                kind: PerturbationKind::MaskInputs { mask_pct: 100 },
                onset_step: 40,
                duration: 10,
                seed: session_seed ^ 0xdead_beef,
            }]),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.schema_version != PROTOCOL_CONFIG_SCHEMA_VERSION {
            return Err(ConfigError::SchemaMismatch {
                expected: PROTOCOL_CONFIG_SCHEMA_VERSION.to_string(),
                actual: self.schema_version.clone(),
            });
        }
        if self.steps == 0 {
            return Err(ConfigError::ZeroSteps);
        }
        if self.step_tick_budget == 0 {
            return Err(ConfigError::ZeroTickBudget);
        }
        let sum = self.weights.sum();
        if sum != MILLION {
            return Err(ConfigError::WeightsNotNormalized { sum });
        }
        for (name, value) in [
            ("closure_threshold_millionths", self.closure_threshold_millionths),
            ("diagonal_threshold_millionths", self.diagonal_threshold_millionths),
            ("rebound_quorum_millionths", self.rebound_quorum_millionths),
            (
                "mdl_behavior_match_threshold_millionths",
                self.mdl_behavior_match_threshold_millionths,
            ),
        ] {
            if !(0..=MILLION).contains(&value) {
                return Err(ConfigError::ThresholdOutOfRange {
                    name: name.to_string(),
                    value,
                });
            }
        }
        if self.diagonal_query_count > 0 && self.diagonal_min_step >= self.steps {
            return Err(ConfigError::DiagonalMinStepOutOfRange {
                min_step: self.diagonal_min_step,
                steps: self.steps,
            });
        }
        self.stress_schedule.validate()?;
        Ok(())
    }

    /// Canonical serialization used for the config commitment.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("config serialization is infallible")
    }

    /// Digest committed as the genesis chain link of every ledger in the
    /// session.
    pub fn config_digest(&self) -> StateDigest {
        StateDigest::compute_parts(&[b"doppel.protocol-config.v1", &self.canonical_bytes()])
    }

    /// Virtual tick at which a step's commit is stamped.
    pub fn commit_tick(&self, step: u64) -> u64 {
        step * self.step_tick_budget
    }

    /// Virtual tick at which the reveal phase opens.
    pub fn reveal_phase_tick(&self) -> u64 {
        self.steps * self.step_tick_budget + self.reveal_delay_ticks
    }
}
