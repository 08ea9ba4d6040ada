//! Test results and the aggregate verdict.
//!
//! A verdict is produced once per party at session close and never
//! mutated. Aggregation uses the fixed weighting from the committed
//! protocol config; component scores and the aggregate are integer
//! millionths so that replaying a session reproduces the verdict
//! byte-for-byte.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::VerdictWeights;
use crate::finding::{Finding, FindingCode};
use crate::torsion_stress::WindowOutcome;

pub const VERDICT_SCHEMA_VERSION: &str = "doppel-harness.verdict.v1";

/// Fixed-point scale: 1_000_000 ≡ 1.0.
const MILLION: i64 = 1_000_000;

// ---------------------------------------------------------------------------
// TestTag / TestResult
// ---------------------------------------------------------------------------

/// Outcome classification shared by the four test kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestTag {
    Pass,
    Fail,
    Indeterminate,
}

/// Per-test numeric evidence, tagged by kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TestResult {
    Closure {
        /// Applied fraction over checks run; `None` when nothing was
        /// checkable.
        score_millionths: Option<i64>,
        registered: usize,
        checked: usize,
        applied: usize,
        threshold_millionths: i64,
        tag: TestTag,
    },
    Stress {
        outcome: WindowOutcome,
        windows_evaluated: usize,
        /// Onsets of windows that failed the rebound invariant.
        no_rebound_onsets: Vec<u64>,
        /// Capabilities ablated in failing windows, if any.
        ablated_capabilities: Vec<String>,
        tag: TestTag,
    },
    Diagonal {
        correct_fraction_millionths: i64,
        cases: usize,
        threshold_millionths: i64,
        all_vacuous: bool,
        tag: TestTag,
    },
    Mdl {
        margin_bytes: i64,
        behavior_match_millionths: Option<i64>,
        separation_disproved: bool,
        tag: TestTag,
    },
}

impl TestResult {
    pub fn closure(
        score_millionths: Option<i64>,
        registered: usize,
        checked: usize,
        applied: usize,
        threshold_millionths: i64,
    ) -> Self {
        let tag = match score_millionths {
            None => TestTag::Indeterminate,
            Some(score) if score < threshold_millionths => TestTag::Fail,
            Some(_) => TestTag::Pass,
        };
        Self::Closure {
            score_millionths,
            registered,
            checked,
            applied,
            threshold_millionths,
            tag,
        }
    }

    pub fn stress(
        outcome: WindowOutcome,
        windows_evaluated: usize,
        no_rebound_onsets: Vec<u64>,
        ablated_capabilities: Vec<String>,
    ) -> Self {
        let tag = match outcome {
            WindowOutcome::Rebounded => TestTag::Pass,
            WindowOutcome::NoRebound => TestTag::Fail,
            WindowOutcome::Indeterminate => TestTag::Indeterminate,
        };
        Self::Stress {
            outcome,
            windows_evaluated,
            no_rebound_onsets,
            ablated_capabilities,
            tag,
        }
    }

    pub fn diagonal(
        correct_fraction_millionths: i64,
        cases: usize,
        threshold_millionths: i64,
        all_vacuous: bool,
        pass: bool,
    ) -> Self {
        let tag = if cases == 0 || all_vacuous {
            TestTag::Indeterminate
        } else if pass {
            TestTag::Pass
        } else {
            TestTag::Fail
        };
        Self::Diagonal {
            correct_fraction_millionths,
            cases,
            threshold_millionths,
            all_vacuous,
            tag,
        }
    }

    pub fn mdl(
        margin_bytes: i64,
        behavior_match_millionths: Option<i64>,
        separation_disproved: bool,
    ) -> Self {
        let tag = if separation_disproved {
            TestTag::Fail
        } else if margin_bytes > 0 {
            TestTag::Pass
        } else {
            TestTag::Indeterminate
        };
        Self::Mdl {
            margin_bytes,
            behavior_match_millionths,
            separation_disproved,
            tag,
        }
    }

    pub fn tag(&self) -> TestTag {
        match self {
            Self::Closure { tag, .. }
            | Self::Stress { tag, .. }
            | Self::Diagonal { tag, .. }
            | Self::Mdl { tag, .. } => *tag,
        }
    }

    pub fn kind_str(&self) -> &'static str {
        match self {
            Self::Closure { .. } => "closure",
            Self::Stress { .. } => "stress",
            Self::Diagonal { .. } => "diagonal",
            Self::Mdl { .. } => "mdl",
        }
    }

    /// Component score feeding the weighted aggregate.
    pub fn component_score_millionths(&self) -> i64 {
        match self {
            Self::Closure {
                score_millionths, ..
            } => score_millionths.unwrap_or(MILLION / 2),
            Self::Stress { outcome, .. } => match outcome {
                WindowOutcome::Rebounded => MILLION,
                WindowOutcome::NoRebound => 0,
                WindowOutcome::Indeterminate => MILLION / 2,
            },
            Self::Diagonal {
                correct_fraction_millionths,
                all_vacuous,
                cases,
                ..
            } => {
                if *cases == 0 || *all_vacuous {
                    MILLION / 2
                } else {
                    *correct_fraction_millionths
                }
            }
            Self::Mdl {
                margin_bytes,
                separation_disproved,
                ..
            } => {
                if *separation_disproved {
                    0
                } else if *margin_bytes > 0 {
                    MILLION
                } else if *margin_bytes < 0 {
                    0
                } else {
                    MILLION / 2
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// VerdictTag / Verdict
// ---------------------------------------------------------------------------

/// Aggregate classification for a party's session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictTag {
    /// All four tests passed: separation claim supported this session.
    GenuineSupported,
    /// Mixed or indeterminate evidence.
    Inconclusive,
    ClosureFail,
    StressFail,
    DiagonalFail,
    SeparationDisproved,
    IntegrityViolation,
    Aborted,
}

impl VerdictTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GenuineSupported => "genuine_supported",
            Self::Inconclusive => "inconclusive",
            Self::ClosureFail => "closure_fail",
            Self::StressFail => "stress_fail",
            Self::DiagonalFail => "diagonal_fail",
            Self::SeparationDisproved => "separation_disproved",
            Self::IntegrityViolation => "integrity_violation",
            Self::Aborted => "aborted",
        }
    }
}

impl fmt::Display for VerdictTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A party's sealed verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub schema_version: String,
    pub party_id: String,
    pub per_test: Vec<TestResult>,
    pub aggregate_score_millionths: i64,
    pub verdict_tag: VerdictTag,
    /// Full evidence trail for this party.
    pub findings: Vec<Finding>,
}

/// Weighted aggregate over the four component scores.
pub fn aggregate_score_millionths(weights: &VerdictWeights, per_test: &[TestResult]) -> i64 {
    let weight_of = |result: &TestResult| match result {
        TestResult::Closure { .. } => weights.closure_millionths,
        TestResult::Stress { .. } => weights.stress_millionths,
        TestResult::Diagonal { .. } => weights.diagonal_millionths,
        TestResult::Mdl { .. } => weights.mdl_millionths,
    };
    per_test
        .iter()
        .map(|result| weight_of(result) * result.component_score_millionths() / MILLION)
        .sum()
}

/// Fixed-precedence tag decision.
///
/// Integrity beats everything; an inverted MDL margin is surfaced ahead
/// of the informative failures; all-pass is required for support.
pub fn decide_tag(per_test: &[TestResult], findings: &[Finding]) -> VerdictTag {
    if findings
        .iter()
        .any(|f| f.code == FindingCode::IntegrityViolation)
    {
        return VerdictTag::IntegrityViolation;
    }
    if per_test
        .iter()
        .any(|r| matches!(r, TestResult::Mdl { separation_disproved: true, .. }))
    {
        return VerdictTag::SeparationDisproved;
    }
    for (kind, tag) in [
        ("stress", VerdictTag::StressFail),
        ("closure", VerdictTag::ClosureFail),
        ("diagonal", VerdictTag::DiagonalFail),
    ] {
        if per_test
            .iter()
            .any(|r| r.kind_str() == kind && r.tag() == TestTag::Fail)
        {
            return tag;
        }
    }
    if !per_test.is_empty() && per_test.iter().all(|r| r.tag() == TestTag::Pass) {
        return VerdictTag::GenuineSupported;
    }
    VerdictTag::Inconclusive
}

impl Verdict {
    pub fn new(
        party_id: impl Into<String>,
        per_test: Vec<TestResult>,
        weights: &VerdictWeights,
        findings: Vec<Finding>,
    ) -> Self {
        let aggregate = aggregate_score_millionths(weights, &per_test);
        let verdict_tag = decide_tag(&per_test, &findings);
        Self {
            schema_version: VERDICT_SCHEMA_VERSION.to_string(),
            party_id: party_id.into(),
            per_test,
            aggregate_score_millionths: aggregate,
            verdict_tag,
            findings,
        }
    }
}
