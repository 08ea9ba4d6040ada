//! Replay determinism: with a fixed seed, a fully revealed session —
//! traces, replay checks, verdicts, the whole sealed record — is
//! byte-identical across repeated executions, and reverifies from public
//! data alone.

use doppel_harness::audit_store::reverify;
use doppel_harness::config::ProtocolConfig;
use doppel_harness::fixtures::{EngineParams, MimicChallenger, MimicParams, RecursiveEngine};
use doppel_harness::orchestrator::{CancelFlag, MimicChallengeOrchestrator};
use doppel_harness::session::ChallengeSession;

fn run_once(seed: u64) -> ChallengeSession {
    let orchestrator =
        MimicChallengeOrchestrator::new(ProtocolConfig::baseline(seed)).expect("config");
    let mut engine = RecursiveEngine::new("engine-a", seed, EngineParams::default());
    let mut mimic = MimicChallenger::new("mimic-b", seed, MimicParams::default());
    orchestrator
        .run_session(&mut engine, Some(&mut mimic), &CancelFlag::new())
        .expect("session")
}

#[test]
fn same_seed_produces_bit_identical_sealed_sessions() {
    let first = run_once(42);
    let second = run_once(42);
    assert_eq!(first.canonical_json(), second.canonical_json());
}

#[test]
fn verdicts_are_bit_identical_across_executions() {
    let first = run_once(7);
    let second = run_once(7);
    assert_eq!(
        serde_json::to_string(&first.verdicts).expect("serialize"),
        serde_json::to_string(&second.verdicts).expect("serialize")
    );
}

#[test]
fn different_seeds_produce_different_sessions() {
    let a = run_once(1);
    let b = run_once(2);
    assert_ne!(a.session_id, b.session_id);
    assert_ne!(a.raw_stimuli, b.raw_stimuli);
}

#[test]
fn sealed_sessions_reverify_from_public_data() {
    let session = run_once(42);
    reverify(&session).expect("reverification from public record");
}

#[test]
fn replay_checks_recompute_identically() {
    let first = run_once(9);
    let second = run_once(9);
    assert_eq!(first.verifier.checks(), second.verifier.checks());
    assert!(!first.verifier.checks().is_empty());
}
