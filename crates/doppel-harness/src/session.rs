//! Challenge session: one run of {engine, optional challenger} across N
//! lock-step steps.
//!
//! A session is open while the run is in progress and sealed exactly once
//! at the end — as `Sealed` (normal close), `Aborted` (operator cancel,
//! partial ledger flushed, nothing deleted), or `IntegrityViolation`
//! (tamper detected, fatal). No entity is mutated after it leaves its
//! open phase; the audit store refuses unsealed sessions.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::commitment_ledger::{CommitmentLedger, RevealStatus};
use crate::config::{ConfigError, ProtocolConfig};
use crate::diagonal_oracle::DiagonalReport;
use crate::digest::{derive_content_id, StateDigest};
use crate::finding::Finding;
use crate::harness_log::HarnessEvent;
use crate::mdl_margin::{MdlAssessment, TranscriptEntry};
use crate::party::PartyRole;
use crate::self_closure::SelfClosureVerifier;
use crate::torsion_stress::StressTrace;
use crate::verdict::Verdict;

pub const SESSION_SCHEMA_VERSION: &str = "doppel-harness.challenge-session.v1";

// ---------------------------------------------------------------------------
// SessionState
// ---------------------------------------------------------------------------

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Open,
    Sealed,
    Aborted,
    IntegrityViolation,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Sealed => "sealed",
            Self::Aborted => "aborted",
            Self::IntegrityViolation => "integrity_violation",
        }
    }

    pub fn is_terminal(&self) -> bool {
        *self != Self::Open
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session lifecycle errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionError {
    /// Attempted mutation or re-seal after the session left its open phase.
    SealedMutation { state: SessionState },
    /// Configuration rejected at open.
    InvalidConfig { message: String },
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SealedMutation { state } => {
                write!(f, "session already {state}: mutation refused")
            }
            Self::InvalidConfig { message } => write!(f, "invalid config: {message}"),
        }
    }
}

impl std::error::Error for SessionError {}

// ---------------------------------------------------------------------------
// PartyRecord
// ---------------------------------------------------------------------------

/// Everything recorded about one party during a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartyRecord {
    pub party_id: String,
    pub role: PartyRole,
    pub ledger: CommitmentLedger,
    /// Externally visible behavior: delivered stimulus and output per step.
    pub transcript: Vec<TranscriptEntry>,
    /// Reported state projections per step.
    pub projections: BTreeMap<u64, Vec<i64>>,
    /// Digests of the projections, the approximate closure channel.
    pub projection_digests: BTreeMap<u64, StateDigest>,
    /// Steps scored as timeouts after the retry cap.
    pub timeout_steps: Vec<u64>,
    pub reveal_status: RevealStatus,
    pub stress_trace: Option<StressTrace>,
    pub diagonal_report: Option<DiagonalReport>,
}

impl PartyRecord {
    pub fn new(party_id: impl Into<String>, role: PartyRole, ledger: CommitmentLedger) -> Self {
        Self {
            party_id: party_id.into(),
            role,
            ledger,
            transcript: Vec::new(),
            projections: BTreeMap::new(),
            projection_digests: BTreeMap::new(),
            timeout_steps: Vec::new(),
            reveal_status: RevealStatus::Complete,
            stress_trace: None,
            diagonal_report: None,
        }
    }
}

// ---------------------------------------------------------------------------
// ChallengeSession
// ---------------------------------------------------------------------------

/// One full run of the separation protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeSession {
    pub schema_version: String,
    /// Content-addressed id derived from the config (seed included).
    pub session_id: String,
    pub seed: u64,
    pub config: ProtocolConfig,
    /// Genesis chain link of every ledger in the session.
    pub config_digest: StateDigest,
    pub state: SessionState,
    pub engine: PartyRecord,
    pub challenger: Option<PartyRecord>,
    /// Task objective per step (pre-perturbation).
    pub raw_stimuli: Vec<i64>,
    /// Delivered stimulus per step; `None` where masked.
    pub delivered_inputs: Vec<Option<i64>>,
    /// Replay encoding of the delivered stimuli (mask sentinel included).
    pub delivered_stimuli: Vec<i64>,
    /// Engine morphism registry plus replay checks.
    pub verifier: SelfClosureVerifier,
    pub mdl: Option<MdlAssessment>,
    pub events: Vec<HarnessEvent>,
    pub findings: Vec<Finding>,
    /// One verdict per party, produced at seal time.
    pub verdicts: Vec<Verdict>,
    pub sealed_at_ticks: Option<u64>,
}

impl ChallengeSession {
    /// Open a session for a validated config.
    pub fn open(
        config: ProtocolConfig,
        engine_id: &str,
        challenger_id: Option<&str>,
    ) -> Result<Self, SessionError> {
        config.validate().map_err(|e: ConfigError| {
            SessionError::InvalidConfig {
                message: e.to_string(),
            }
        })?;
        let config_digest = config.config_digest();
        let session_id = derive_content_id(
            "ses",
            &[
                config_digest.as_bytes().as_slice(),
                engine_id.as_bytes(),
                challenger_id.unwrap_or("").as_bytes(),
            ]
            .concat(),
        );
        let engine_ledger = CommitmentLedger::new(
            engine_id,
            config_digest,
            config.reveal_delay_ticks,
            config.max_defer_count,
        );
        let challenger = challenger_id.map(|id| {
            PartyRecord::new(
                id,
                PartyRole::Challenger,
                CommitmentLedger::new(
                    id,
                    config_digest,
                    config.reveal_delay_ticks,
                    config.max_defer_count,
                ),
            )
        });
        Ok(Self {
            schema_version: SESSION_SCHEMA_VERSION.to_string(),
            session_id,
            seed: config.session_seed,
            config,
            config_digest,
            state: SessionState::Open,
            engine: PartyRecord::new(engine_id, PartyRole::Engine, engine_ledger),
            challenger,
            raw_stimuli: Vec::new(),
            delivered_inputs: Vec::new(),
            delivered_stimuli: Vec::new(),
            verifier: SelfClosureVerifier::new(),
            mdl: None,
            events: Vec::new(),
            findings: Vec::new(),
            verdicts: Vec::new(),
            sealed_at_ticks: None,
        })
    }

    pub fn is_open(&self) -> bool {
        self.state == SessionState::Open
    }

    pub fn assert_open(&self) -> Result<(), SessionError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(SessionError::SealedMutation { state: self.state })
        }
    }

    /// Seal the session exactly once. Re-sealing is refused: audit trails
    /// are never rewritten.
    pub fn seal(&mut self, state: SessionState, now_ticks: u64) -> Result<(), SessionError> {
        self.assert_open()?;
        debug_assert!(state.is_terminal());
        self.state = state;
        self.sealed_at_ticks = Some(now_ticks);
        Ok(())
    }

    pub fn log(&mut self, event: HarnessEvent) {
        self.events.push(event);
    }

    pub fn record_finding(&mut self, finding: Finding) {
        self.findings.push(finding);
    }

    /// Findings scoped to one party.
    pub fn findings_for(&self, party_id: &str) -> Vec<Finding> {
        self.findings
            .iter()
            .filter(|f| f.party_id.as_deref() == Some(party_id))
            .cloned()
            .collect()
    }

    pub fn verdict_for(&self, party_id: &str) -> Option<&Verdict> {
        self.verdicts.iter().find(|v| v.party_id == party_id)
    }

    /// Canonical JSON of the whole sealed session — the unit of the
    /// replay-determinism property.
    pub fn canonical_json(&self) -> String {
        serde_json::to_string(self).expect("session serialization is infallible")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::finding::FindingCode;

    fn open_session() -> ChallengeSession {
        ChallengeSession::open(
            ProtocolConfig::baseline(42),
            "engine-a",
            Some("mimic-b"),
        )
        .expect("open")
    }

    #[test]
    fn open_builds_ledgers_with_config_genesis() {
        let session = open_session();
        assert!(session.is_open());
        assert_eq!(session.engine.ledger.genesis_link, session.config_digest);
        let challenger = session.challenger.as_ref().expect("challenger");
        assert_eq!(challenger.ledger.genesis_link, session.config_digest);
        assert_eq!(challenger.role, PartyRole::Challenger);
        assert!(session.session_id.starts_with("ses-"));
    }

    #[test]
    fn session_id_is_config_addressed() {
        let a = open_session();
        let b = open_session();
        assert_eq!(a.session_id, b.session_id);

        let other = ChallengeSession::open(ProtocolConfig::baseline(43), "engine-a", Some("mimic-b"))
            .expect("open");
        assert_ne!(a.session_id, other.session_id);
    }

    #[test]
    fn open_rejects_invalid_config() {
        let mut config = ProtocolConfig::baseline(1);
        config.steps = 0;
        let err = ChallengeSession::open(config, "engine-a", None).expect_err("invalid");
        assert!(matches!(err, SessionError::InvalidConfig { .. }));
    }

    #[test]
    fn seal_is_single_shot() {
        let mut session = open_session();
        session.seal(SessionState::Sealed, 105_000).expect("seal");
        assert_eq!(session.state, SessionState::Sealed);
        assert_eq!(session.sealed_at_ticks, Some(105_000));
        let err = session
            .seal(SessionState::Aborted, 106_000)
            .expect_err("re-seal refused");
        assert!(matches!(
            err,
            SessionError::SealedMutation {
                state: SessionState::Sealed
            }
        ));
    }

    #[test]
    fn abort_seals_without_deleting_anything() {
        let mut session = open_session();
        session.record_finding(
            Finding::new(FindingCode::Incomplete, "reveal deferred").for_party("engine-a"),
        );
        session.seal(SessionState::Aborted, 50_000).expect("abort");
        assert_eq!(session.state, SessionState::Aborted);
        // The partial evidence trail is preserved.
        assert_eq!(session.findings.len(), 1);
    }

    #[test]
    fn findings_for_filters_by_party() {
        let mut session = open_session();
        session.record_finding(
            Finding::new(FindingCode::Timeout, "slow step").for_party("engine-a"),
        );
        session.record_finding(
            Finding::new(FindingCode::DiagonalFail, "fabricated id").for_party("mimic-b"),
        );
        session.record_finding(Finding::new(FindingCode::Incomplete, "unscoped"));
        assert_eq!(session.findings_for("engine-a").len(), 1);
        assert_eq!(session.findings_for("mimic-b").len(), 1);
    }

    #[test]
    fn canonical_json_round_trips() {
        let session = open_session();
        let json = session.canonical_json();
        let restored: ChallengeSession = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(session, restored);
        assert_eq!(json, restored.canonical_json());
    }

    #[test]
    fn state_names() {
        assert_eq!(SessionState::Open.as_str(), "open");
        assert_eq!(SessionState::IntegrityViolation.as_str(), "integrity_violation");
        assert!(!SessionState::Open.is_terminal());
        assert!(SessionState::Aborted.is_terminal());
    }
}
