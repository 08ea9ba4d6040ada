//! Append-only audit store for sealed sessions.
//!
//! Sealed sessions are wrapped in an envelope stamped with wall-clock
//! RFC3339 at append time (the session body itself stays on virtual
//! ticks, so the replay-determinism property is unaffected) and are never
//! removed. The store refuses open sessions: a session must leave its
//! open phase before it becomes audit material.
//!
//! `reverify` re-checks a sealed session from public data only — chain
//! links, revealed salts, counterfactual replay, and the verdict
//! arithmetic — so a third party can re-verify without any secrets.

use std::fs;
use std::path::Path;
use std::sync::Mutex;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::commitment_ledger::ChainIntegrityError;
use crate::self_closure::{MorphismRecord, SelfClosureVerifier};
use crate::session::{ChallengeSession, SessionState};
use crate::verdict::aggregate_score_millionths;

pub const AUDIT_STORE_SCHEMA_VERSION: &str = "doppel-harness.audit-store.v1";

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// A sealed session plus its archive metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedSessionEnvelope {
    pub schema_version: String,
    pub session_id: String,
    pub seed: u64,
    pub state: SessionState,
    /// Wall-clock stamp at append time.
    pub archived_rfc3339: String,
    pub session: ChallengeSession,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Audit store failures.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum AuditError {
    #[error("session {session_id} is still open; seal before archiving")]
    SessionStillOpen { session_id: String },
    #[error("export failed: {message}")]
    Export { message: String },
}

/// Independent reverification failures.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ReverifyError {
    #[error("chain verification failed for {party_id}: {error}")]
    Chain {
        party_id: String,
        error: ChainIntegrityError,
    },
    #[error("counterfactual replay diverged from the recorded checks")]
    ReplayMismatch,
    #[error("verdict aggregate for {party_id} does not recompute")]
    VerdictMismatch { party_id: String },
}

// ---------------------------------------------------------------------------
// AuditStore
// ---------------------------------------------------------------------------

/// Thread-shared append-only archive. Appends from parallel trials are
/// serialized by the interior mutex; nothing is ever removed.
#[derive(Debug, Default)]
pub struct AuditStore {
    inner: Mutex<Vec<SealedSessionEnvelope>>,
}

impl AuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<SealedSessionEnvelope>> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Archive a sealed session. Open sessions are refused.
    pub fn append(&self, session: ChallengeSession) -> Result<(), AuditError> {
        if session.is_open() {
            return Err(AuditError::SessionStillOpen {
                session_id: session.session_id.clone(),
            });
        }
        let envelope = SealedSessionEnvelope {
            schema_version: AUDIT_STORE_SCHEMA_VERSION.to_string(),
            session_id: session.session_id.clone(),
            seed: session.seed,
            state: session.state,
            archived_rfc3339: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            session,
        };
        self.lock().push(envelope);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Snapshot of the archive in append order.
    pub fn sessions(&self) -> Vec<SealedSessionEnvelope> {
        self.lock().clone()
    }

    pub fn find(&self, session_id: &str) -> Option<SealedSessionEnvelope> {
        self.lock()
            .iter()
            .find(|e| e.session_id == session_id)
            .cloned()
    }

    /// Export the archive as JSONL, one envelope per line.
    pub fn export_jsonl(&self, path: &Path) -> Result<usize, AuditError> {
        let envelopes = self.sessions();
        let mut out = String::new();
        for envelope in &envelopes {
            let line = serde_json::to_string(envelope).map_err(|e| AuditError::Export {
                message: e.to_string(),
            })?;
            out.push_str(&line);
            out.push('\n');
        }
        fs::write(path, out).map_err(|e| AuditError::Export {
            message: e.to_string(),
        })?;
        Ok(envelopes.len())
    }
}

// ---------------------------------------------------------------------------
// Third-party reverification
// ---------------------------------------------------------------------------

/// Re-verify a sealed session from its public record alone.
pub fn reverify(session: &ChallengeSession) -> Result<(), ReverifyError> {
    session
        .engine
        .ledger
        .verify_chain()
        .map_err(|error| ReverifyError::Chain {
            party_id: session.engine.party_id.clone(),
            error,
        })?;
    if let Some(challenger) = &session.challenger {
        challenger
            .ledger
            .verify_chain()
            .map_err(|error| ReverifyError::Chain {
                party_id: challenger.party_id.clone(),
                error,
            })?;
    }

    // Re-run the counterfactual replay from the recorded morphisms and
    // compare against the stored checks.
    let mut fresh = SelfClosureVerifier::new();
    for morphism in session.verifier.morphisms() {
        let unverified = MorphismRecord {
            applied: false,
            ..morphism.clone()
        };
        fresh
            .register(unverified)
            .map_err(|_| ReverifyError::ReplayMismatch)?;
    }
    let last_step = session.config.steps.saturating_sub(1);
    fresh
        .run_all_checks(
            &session.engine.ledger,
            &session.delivered_stimuli,
            &session.engine.projection_digests,
            session.config.closure_check_horizon,
            last_step,
        )
        .map_err(|_| ReverifyError::ReplayMismatch)?;
    if fresh.checks() != session.verifier.checks() {
        return Err(ReverifyError::ReplayMismatch);
    }

    // Verdict arithmetic must recompute from its own inputs.
    for verdict in &session.verdicts {
        let recomputed = aggregate_score_millionths(&session.config.weights, &verdict.per_test);
        if recomputed != verdict.aggregate_score_millionths {
            return Err(ReverifyError::VerdictMismatch {
                party_id: verdict.party_id.clone(),
            });
        }
    }
    Ok(())
}
