//! MDL margin sign stability (§ separation economics):
//! - a challenger that matches behavior with a provably smaller
//!   description disproves separation for the session;
//! - a matching challenger deliberately padded past the engine's
//!   description length yields a sustained positive margin.

use doppel_harness::audit_store::AuditStore;
use doppel_harness::config::ProtocolConfig;
use doppel_harness::fixtures::{
    EngineParams, MimicBehavior, MimicChallenger, MimicParams, RecursiveEngine,
};
use doppel_harness::orchestrator::{run_campaign, CancelFlag, MimicChallengeOrchestrator};
use doppel_harness::finding::FindingCode;
use doppel_harness::verdict::VerdictTag;

/// Engine outputs for a given config, recorded from an engine-only run.
/// The engine is deterministic per seed, so a fresh instance in the
/// challenge session reproduces these outputs exactly.
fn recorded_engine_outputs(config: &ProtocolConfig, engine_params: &EngineParams) -> Vec<i64> {
    let orchestrator = MimicChallengeOrchestrator::new(config.clone()).expect("config");
    let mut engine = RecursiveEngine::new(
        format!("engine-{:04}", config.session_seed),
        config.session_seed,
        engine_params.clone(),
    );
    let session = orchestrator
        .run_session(&mut engine, None, &CancelFlag::new())
        .expect("recording session");
    session
        .engine
        .transcript
        .iter()
        .map(|entry| entry.output_millionths)
        .collect()
}

/// Mirror of the per-seed config derivation used by `run_campaign`.
fn config_for_seed(base: &ProtocolConfig, seed: u64) -> ProtocolConfig {
    let mut config = base.clone();
    config.session_seed = seed;
    for window in &mut config.stress_schedule.windows {
        window.seed ^= seed;
    }
    config
}

#[test]
fn smaller_matching_challenger_disproves_separation() {
    let seed = 31;
    let config = ProtocolConfig::baseline(seed);
    // Engine with a deliberately padded (incompressible) description.
    let engine_params = EngineParams {
        description_padding: 65_536,
        ..EngineParams::default()
    };
    let outputs = recorded_engine_outputs(&config, &engine_params);

    let orchestrator = MimicChallengeOrchestrator::new(config).expect("config");
    let mut engine = RecursiveEngine::new(format!("engine-{seed:04}"), seed, engine_params);
    let mut mimic = MimicChallenger::new(
        "mimic-replay",
        seed,
        MimicParams {
            behavior: MimicBehavior::Replay { outputs },
            fabricate_citations: false,
            description_padding: 0,
            ticks_per_step: 50,
        },
    );
    let session = orchestrator
        .run_session(&mut engine, Some(&mut mimic), &CancelFlag::new())
        .expect("session");

    let mdl = session.mdl.as_ref().expect("mdl assessed");
    assert_eq!(mdl.behavior_match_millionths, Some(1_000_000));
    assert!(mdl.separation_disproved, "expected disproof: {mdl:?}");
    assert!(mdl.margin_bytes < 0);

    // The result is surfaced, never hidden: finding + verdict tag.
    assert!(session
        .findings
        .iter()
        .any(|f| f.code == FindingCode::SeparationDisproved));
    let engine_verdict = session
        .verdict_for(&session.engine.party_id)
        .expect("engine verdict");
    assert_eq!(engine_verdict.verdict_tag, VerdictTag::SeparationDisproved);
}

#[test]
fn padded_matching_challenger_yields_sustained_positive_margin() {
    let base = ProtocolConfig::baseline(1);
    let seeds = [41u64, 42, 43, 44, 45];
    let engine_params = EngineParams::default();

    // Record each seed's engine outputs up front.
    let tables: Vec<(u64, Vec<i64>)> = seeds
        .iter()
        .map(|&seed| {
            let config = config_for_seed(&base, seed);
            (seed, recorded_engine_outputs(&config, &engine_params))
        })
        .collect();

    let store = AuditStore::new();
    let report = run_campaign(
        &base,
        &seeds,
        |seed| RecursiveEngine::new(format!("engine-{seed:04}"), seed, engine_params.clone()),
        |seed| {
            let outputs = tables
                .iter()
                .find(|(s, _)| *s == seed)
                .map(|(_, outputs)| outputs.clone())
                .unwrap_or_default();
            Some(MimicChallenger::new(
                format!("mimic-{seed:04}"),
                seed,
                MimicParams {
                    behavior: MimicBehavior::Replay { outputs },
                    fabricate_citations: false,
                    // Padded far past the engine description + ledger.
                    description_padding: 262_144,
                    ticks_per_step: 50,
                },
            ))
        },
        &store,
    )
    .expect("campaign");

    assert!(
        report.mdl_sustained_positive,
        "expected sustained positive margin: {:?}",
        report
            .per_seed
            .iter()
            .map(|s| s.mdl_margin_bytes)
            .collect::<Vec<_>>()
    );
    for outcome in &report.per_seed {
        assert!(outcome.mdl_margin_bytes > 0, "seed {}: {outcome:?}", outcome.seed);
        assert!(!outcome.separation_disproved);
    }
}

#[test]
fn non_matching_challenger_never_disproves() {
    let seed = 51;
    let orchestrator =
        MimicChallengeOrchestrator::new(ProtocolConfig::baseline(seed)).expect("config");
    let mut engine =
        RecursiveEngine::new(format!("engine-{seed:04}"), seed, EngineParams::default());
    // Tiny description, but constant output: no behavior match.
    let mut mimic = MimicChallenger::new("mimic-const", seed, MimicParams::default());
    let session = orchestrator
        .run_session(&mut engine, Some(&mut mimic), &CancelFlag::new())
        .expect("session");

    let mdl = session.mdl.as_ref().expect("mdl assessed");
    assert!(!mdl.separation_disproved);
    let matched = mdl.behavior_match_millionths.expect("match computed");
    assert!(matched < 900_000, "unexpected behavior match: {matched}");
}
