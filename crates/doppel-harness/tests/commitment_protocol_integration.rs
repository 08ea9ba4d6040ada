//! Integration tests for the commitment protocol driven through full
//! sessions: tamper evidence on real ledgers, defer-budget enforcement,
//! and the reveal ordering guarantees.

use doppel_harness::audit_store::{reverify, ReverifyError};
use doppel_harness::commitment_ledger::RevealStatus;
use doppel_harness::config::ProtocolConfig;
use doppel_harness::digest::StateDigest;
use doppel_harness::finding::FindingCode;
use doppel_harness::fixtures::{EngineParams, MimicChallenger, MimicParams, RecursiveEngine};
use doppel_harness::orchestrator::{CancelFlag, MimicChallengeOrchestrator};
use doppel_harness::session::{ChallengeSession, SessionState};
use doppel_harness::torsion_stress::{PerturbationKind, StressSchedule, StressWindow};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Short-session config: 20 steps, one small mask window, 3 diagonal
/// queries late in the run.
fn short_config(seed: u64) -> ProtocolConfig {
    let mut config = ProtocolConfig::baseline(seed);
    config.steps = 20;
    config.stress_schedule = StressSchedule::new(vec![StressWindow {
        kind: PerturbationKind::MaskInputs { mask_pct: 100 },
        onset_step: 8,
        duration: 3,
        seed: seed ^ 0xdead_beef,
    }]);
    config.diagonal_query_count = 3;
    config.diagonal_min_step = 12;
    config
}

fn run_short_session(seed: u64, engine_params: EngineParams) -> ChallengeSession {
    let orchestrator = MimicChallengeOrchestrator::new(short_config(seed)).expect("config");
    let mut engine = RecursiveEngine::new("engine-a", seed, engine_params);
    let mut mimic = MimicChallenger::new("mimic-b", seed, MimicParams::default());
    orchestrator
        .run_session(&mut engine, Some(&mut mimic), &CancelFlag::new())
        .expect("session")
}

// ---------------------------------------------------------------------------
// Commitments and chains
// ---------------------------------------------------------------------------

#[test]
fn session_commits_every_step_for_both_parties() {
    let session = run_short_session(11, EngineParams::default());
    assert_eq!(session.state, SessionState::Sealed);
    assert_eq!(session.engine.ledger.len(), 20);
    let challenger = session.challenger.as_ref().expect("challenger");
    assert_eq!(challenger.ledger.len(), 20);

    session.engine.ledger.verify_chain().expect("engine chain");
    challenger.ledger.verify_chain().expect("challenger chain");
}

#[test]
fn chains_are_anchored_to_the_committed_config() {
    let session = run_short_session(11, EngineParams::default());
    let genesis = session.engine.ledger.records()[0].prev_chain_hash;
    assert_eq!(genesis, session.config_digest);
    // A different config (weights tuned) would anchor differently.
    let mut tuned = short_config(11);
    tuned.weights.closure_millionths = 100_000;
    tuned.weights.mdl_millionths = 400_000;
    assert_ne!(genesis, tuned.config_digest());
}

#[test]
fn all_reveals_verify_in_a_clean_session() {
    let session = run_short_session(13, EngineParams::default());
    for step in 0..20u64 {
        assert!(
            session.engine.ledger.revealed_digest(step).is_some(),
            "engine reveal missing at step {step}"
        );
    }
    assert_eq!(session.engine.reveal_status, RevealStatus::Complete);
    assert!(!session.engine.ledger.is_tainted());
}

#[test]
fn tampering_with_a_sealed_ledger_fails_reverification() {
    let mut session = run_short_session(17, EngineParams::default());
    reverify(&session).expect("clean session reverifies");

    session.engine.ledger.records_mut_for_tamper_tests()[5].state_digest =
        StateDigest::compute(b"forged state");
    let err = reverify(&session).expect_err("tamper detected");
    assert!(matches!(err, ReverifyError::Chain { .. }));
}

// ---------------------------------------------------------------------------
// Defer budget enforcement
// ---------------------------------------------------------------------------

#[test]
fn defers_up_to_the_cap_score_incomplete() {
    let config = short_config(19);
    let cap = config.max_defer_count;
    let session = run_short_session(
        19,
        EngineParams {
            defer_rounds: cap,
            ..EngineParams::default()
        },
    );
    assert_eq!(session.state, SessionState::Sealed);
    assert_eq!(session.engine.reveal_status, RevealStatus::Incomplete);
    // Soft findings only; nothing fatal.
    assert!(session
        .findings
        .iter()
        .any(|f| f.code == FindingCode::Incomplete));
    assert!(!session
        .findings
        .iter()
        .any(|f| f.code == FindingCode::IntegrityViolation));
    // Every commitment was still eventually revealed.
    assert_eq!(session.engine.ledger.defer_count(), cap);
    assert!(session.engine.ledger.unrevealed_steps().is_empty());
}

#[test]
fn one_defer_past_the_cap_escalates_to_fail() {
    let config = short_config(19);
    let cap = config.max_defer_count;
    let session = run_short_session(
        19,
        EngineParams {
            defer_rounds: cap + 1,
            ..EngineParams::default()
        },
    );
    assert_eq!(session.engine.reveal_status, RevealStatus::Failed);
    let escalated = session
        .findings
        .iter()
        .find(|f| f.code == FindingCode::Incomplete && f.detail.contains("escalated"))
        .expect("escalation finding");
    assert_eq!(escalated.party_id.as_deref(), Some("engine-a"));
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

#[test]
fn cancelled_session_is_sealed_aborted_with_partial_ledger() {
    let orchestrator = MimicChallengeOrchestrator::new(short_config(23)).expect("config");
    let mut engine = RecursiveEngine::new("engine-a", 23, EngineParams::default());
    let cancel = CancelFlag::new();
    cancel.cancel();
    let session = orchestrator
        .run_session(&mut engine, None, &cancel)
        .expect("aborted session is still returned");
    assert_eq!(session.state, SessionState::Aborted);
    // Nothing was deleted; the (empty) trail is archived as-is.
    assert!(session
        .events
        .iter()
        .any(|e| e.event == "operator_abort"));
}
