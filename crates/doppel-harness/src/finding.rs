//! Finding taxonomy for the separation protocol.
//!
//! Only [`FindingCode::IntegrityViolation`] aborts a session. Every other
//! code is evidence about the party under test, recorded in the verdict's
//! evidence trail while the session runs to completion. Nothing is
//! recovered silently.
//!
//! Codes are append-only: assigned names are permanent and never reused.

use std::fmt;

use serde::{Deserialize, Serialize};

pub const FINDING_REGISTRY_VERSION: u32 = 1;
pub const FINDING_COMPATIBILITY_POLICY: &str =
    "append-only: assigned codes are permanent, never reused, and may only be marked deprecated";

/// How a finding affects the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingSeverity {
    /// Aborts the session. Tamper detected; evidence cannot be trusted.
    Fatal,
    /// First-class result about the party under test. Session continues.
    Informative,
    /// Scored against one test only, never the whole session.
    Soft,
}

/// Protocol finding codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingCode {
    /// Hash or salt-commitment mismatch: tamper detected.
    IntegrityViolation,
    /// Per-step tick budget exceeded past the retry cap.
    Timeout,
    /// Rule-synthesis claims unsubstantiated by counterfactual replay.
    ClosureFail,
    /// No measurable self-stabilization under perturbation.
    StressFail,
    /// Self-query citations did not resolve against the ledger.
    DiagonalFail,
    /// MDL margin inverted: a smaller challenger tracked the engine.
    SeparationDisproved,
    /// Reveal deferred within budget.
    Incomplete,
}

impl FindingCode {
    pub const ALL: [FindingCode; 7] = [
        FindingCode::IntegrityViolation,
        FindingCode::Timeout,
        FindingCode::ClosureFail,
        FindingCode::StressFail,
        FindingCode::DiagonalFail,
        FindingCode::SeparationDisproved,
        FindingCode::Incomplete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::IntegrityViolation => "integrity_violation",
            Self::Timeout => "timeout",
            Self::ClosureFail => "closure_fail",
            Self::StressFail => "stress_fail",
            Self::DiagonalFail => "diagonal_fail",
            Self::SeparationDisproved => "separation_disproved",
            Self::Incomplete => "incomplete",
        }
    }

    pub fn severity(&self) -> FindingSeverity {
        match self {
            Self::IntegrityViolation => FindingSeverity::Fatal,
            Self::Timeout => FindingSeverity::Soft,
            Self::ClosureFail => FindingSeverity::Informative,
            Self::StressFail => FindingSeverity::Informative,
            Self::DiagonalFail => FindingSeverity::Informative,
            Self::SeparationDisproved => FindingSeverity::Informative,
            Self::Incomplete => FindingSeverity::Soft,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.severity() == FindingSeverity::Fatal
    }
}

impl fmt::Display for FindingCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recorded finding: one entry in a session's evidence trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub code: FindingCode,
    /// Step the finding anchors to, if step-scoped.
    pub step: Option<u64>,
    /// Party the finding is about, if party-scoped.
    pub party_id: Option<String>,
    /// Human-readable evidence detail.
    pub detail: String,
}

impl Finding {
    pub fn new(code: FindingCode, detail: impl Into<String>) -> Self {
        Self {
            code,
            step: None,
            party_id: None,
            detail: detail.into(),
        }
    }

    pub fn at_step(mut self, step: u64) -> Self {
        self.step = Some(step);
        self
    }

    pub fn for_party(mut self, party_id: impl Into<String>) -> Self {
        self.party_id = Some(party_id.into());
        self
    }
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code)?;
        if let Some(step) = self.step {
            write!(f, " @step {step}")?;
        }
        if let Some(party) = &self.party_id {
            write!(f, " [{party}]")?;
        }
        write!(f, ": {}", self.detail)
    }
}
