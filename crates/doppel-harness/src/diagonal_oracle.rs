//! Diagonal self-query oracle.
//!
//! After reveal, the oracle asks "how did you produce step t?" at seeded
//! random historical steps, never announced in advance. A party answers
//! with morphism citations; each cited `(morphism_id, digest)` pair is
//! checked against the ledger-backed morphism registry. Fabricated ids,
//! stale digests, citations of never-applied rules, and silence where
//! rules were provably active all fail the query instance.
//!
//! The passing bar is a configured fraction below 1.0: lossy
//! summarization of old history is legitimate, fabrication is not.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::party::Citation;
use crate::rng::Xorshift64;
use crate::self_closure::SelfClosureVerifier;

pub const DIAGONAL_ORACLE_SCHEMA_VERSION: &str = "doppel-harness.diagonal-oracle.v1";

/// Fixed-point scale: 1_000_000 ≡ 1.0.
const MILLION: i64 = 1_000_000;

// ---------------------------------------------------------------------------
// Failure classes
// ---------------------------------------------------------------------------

/// Why a single citation (or a whole answer) failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagonalFailure {
    /// Cited id does not resolve to any registered morphism.
    UnresolvedMorphism { morphism_id: String },
    /// Cited digest does not match the registered rule digest.
    DigestMismatch { morphism_id: String },
    /// Cited morphism was registered but never verified applied.
    NeverApplied { morphism_id: String },
    /// Cited morphism originates after the queried step.
    OriginAfterStep {
        morphism_id: String,
        origin: u64,
        step: u64,
    },
    /// Applied morphisms were provably active at the step, but the party
    /// cited nothing.
    MissingCitations { expected: usize },
}

impl fmt::Display for DiagonalFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnresolvedMorphism { morphism_id } => {
                write!(f, "citation {morphism_id} does not resolve")
            }
            Self::DigestMismatch { morphism_id } => {
                write!(f, "citation {morphism_id}: digest mismatch")
            }
            Self::NeverApplied { morphism_id } => {
                write!(f, "citation {morphism_id}: claimed but never applied")
            }
            Self::OriginAfterStep {
                morphism_id,
                origin,
                step,
            } => write!(
                f,
                "citation {morphism_id}: origin {origin} after queried step {step}"
            ),
            Self::MissingCitations { expected } => {
                write!(f, "no citations where {expected} applied morphisms were active")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Case and report
// ---------------------------------------------------------------------------

/// Result of one diagonal query instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagonalCaseResult {
    pub step: u64,
    pub citations: Vec<Citation>,
    /// True when no morphisms were active and the party cited nothing:
    /// a pass with no evidentiary weight.
    pub vacuous: bool,
    pub pass: bool,
    pub failures: Vec<DiagonalFailure>,
}

/// Per-session diagonal report for one party.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagonalReport {
    pub schema_version: String,
    pub party_id: String,
    pub cases: Vec<DiagonalCaseResult>,
    pub correct_fraction_millionths: i64,
    pub threshold_millionths: i64,
    /// All cases were vacuous: the statistic carries no weight.
    pub all_vacuous: bool,
    pub pass: bool,
}

// ---------------------------------------------------------------------------
// DiagonalOracle
// ---------------------------------------------------------------------------

/// Issues and judges diagonal self-queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagonalOracle {
    pub query_count: usize,
    pub min_step: u64,
    pub threshold_millionths: i64,
}

impl DiagonalOracle {
    pub fn new(query_count: usize, min_step: u64, threshold_millionths: i64) -> Self {
        Self {
            query_count,
            min_step,
            threshold_millionths,
        }
    }

    /// Choose query steps in `[min_step, steps_total)` without
    /// replacement, seeded. When the range is smaller than the query
    /// count, every eligible step is queried.
    pub fn select_steps(&self, rng: &mut Xorshift64, steps_total: u64) -> Vec<u64> {
        let mut eligible: Vec<u64> = (self.min_step..steps_total).collect();
        if eligible.len() <= self.query_count {
            return eligible;
        }
        let mut chosen = Vec::with_capacity(self.query_count);
        for _ in 0..self.query_count {
            let index = rng.next_usize(eligible.len());
            chosen.push(eligible.swap_remove(index));
        }
        chosen.sort_unstable();
        chosen
    }

    /// Judge one answer against the morphism registry.
    pub fn judge_case(
        &self,
        step: u64,
        citations: Vec<Citation>,
        verifier: &SelfClosureVerifier,
    ) -> DiagonalCaseResult {
        let expected_active = verifier
            .morphisms()
            .iter()
            .filter(|m| m.applied && m.produced_at_step <= step)
            .count();

        let mut failures = Vec::new();
        if citations.is_empty() {
            if expected_active > 0 {
                failures.push(DiagonalFailure::MissingCitations {
                    expected: expected_active,
                });
            }
            let vacuous = expected_active == 0;
            return DiagonalCaseResult {
                step,
                citations,
                vacuous,
                pass: failures.is_empty(),
                failures,
            };
        }

        for citation in &citations {
            match verifier.morphism(&citation.morphism_id) {
                None => failures.push(DiagonalFailure::UnresolvedMorphism {
                    morphism_id: citation.morphism_id.clone(),
                }),
                Some(morphism) => {
                    if morphism.produced_at_step > step {
                        failures.push(DiagonalFailure::OriginAfterStep {
                            morphism_id: citation.morphism_id.clone(),
                            origin: morphism.produced_at_step,
                            step,
                        });
                    } else if !morphism.applied {
                        failures.push(DiagonalFailure::NeverApplied {
                            morphism_id: citation.morphism_id.clone(),
                        });
                    } else if !citation.claimed_digest.constant_time_eq(&morphism.rule_digest) {
                        failures.push(DiagonalFailure::DigestMismatch {
                            morphism_id: citation.morphism_id.clone(),
                        });
                    }
                }
            }
        }

        DiagonalCaseResult {
            step,
            citations,
            vacuous: false,
            pass: failures.is_empty(),
            failures,
        }
    }

    /// Aggregate per-case results into the session report.
    pub fn report(&self, party_id: impl Into<String>, cases: Vec<DiagonalCaseResult>) -> DiagonalReport {
        let total = cases.len();
        let correct = cases.iter().filter(|c| c.pass).count();
        let all_vacuous = total > 0 && cases.iter().all(|c| c.vacuous);
        let correct_fraction_millionths = if total == 0 {
            0
        } else {
            correct as i64 * MILLION / total as i64
        };
        DiagonalReport {
            schema_version: DIAGONAL_ORACLE_SCHEMA_VERSION.to_string(),
            party_id: party_id.into(),
            cases,
            correct_fraction_millionths,
            threshold_millionths: self.threshold_millionths,
            all_vacuous,
            pass: total > 0 && correct_fraction_millionths >= self.threshold_millionths,
        }
    }
}
