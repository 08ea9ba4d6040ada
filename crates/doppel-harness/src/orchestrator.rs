//! Mimic challenge orchestrator.
//!
//! Drives the engine and (optionally) a challenger in lock-step under
//! identical stimuli, commits state digests before each perturbation,
//! opens commitments after the reveal delay, runs the closure, stress,
//! diagonal, and MDL tests, and seals a verdict per party.
//!
//! The asymmetry is the protocol: the challenger never registers
//! morphisms and never sees internal digests — it must track the engine
//! from the outside.
//!
//! Campaigns run many seeds as isolated parallel trials; no shared
//! mutable state crosses session boundaries except the read-only base
//! config and the append-only audit store.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::audit_store::{AuditError, AuditStore};
use crate::commitment_ledger::{RevealOutcome, RevealStatus};
use crate::config::{ConfigError, ProtocolConfig};
use crate::diagonal_oracle::DiagonalOracle;
use crate::digest::StateDigest;
use crate::finding::{Finding, FindingCode};
use crate::harness_log::HarnessEvent;
use crate::mdl_margin::{self, TranscriptEntry};
use crate::party::{encode_stimulus, validate_step_output, Party, StepInput, StepOutput};
use crate::rng::Xorshift64;
use crate::self_closure::{ClosureError, SelfClosureVerifier};
use crate::session::{ChallengeSession, PartyRecord, SessionError, SessionState};
use crate::torsion_stress::{
    coherence_millionths, error_millionths, ReboundSummary, StressTraceBuilder, WindowOutcome,
};
use crate::verdict::{TestResult, Verdict};

pub const ORCHESTRATOR_COMPONENT: &str = "orchestrator";
pub const CAMPAIGN_REPORT_SCHEMA_VERSION: &str = "doppel-harness.campaign-report.v1";

/// Fixed-point scale: 1_000_000 ≡ 1.0.
const MILLION: i64 = 1_000_000;

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Operator abort flag. Cancelling a session flushes the partial ledger
/// and seals it `aborted`; records are never deleted.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Protocol-level orchestration errors. Party misbehavior is never an
/// error — it is scored; these are harness defects or bad configuration.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("config rejected: {0}")]
    Config(#[from] ConfigError),
    #[error("session lifecycle: {0}")]
    Session(#[from] SessionError),
    #[error("closure verification: {0}")]
    Closure(#[from] ClosureError),
    #[error("audit store: {0}")]
    Audit(#[from] AuditError),
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Runs sessions for one validated protocol config.
#[derive(Debug, Clone)]
pub struct MimicChallengeOrchestrator {
    config: ProtocolConfig,
}

/// Outcome of stepping one party once, after retries.
enum StepAttempt {
    Accepted(StepOutput),
    TimedOut,
}

impl MimicChallengeOrchestrator {
    pub fn new(config: ProtocolConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    /// Run one full session. Party misbehavior is recorded as evidence;
    /// only harness defects return `Err`.
    pub fn run_session(
        &self,
        engine: &mut dyn Party,
        mut challenger: Option<&mut dyn Party>,
        cancel: &CancelFlag,
    ) -> Result<ChallengeSession, OrchestratorError> {
        let config = self.config.clone();
        let challenger_id = challenger.as_deref().map(|c| c.party_id().to_string());
        let mut session =
            ChallengeSession::open(config.clone(), engine.party_id(), challenger_id.as_deref())?;
        let session_id = session.session_id.clone();
        let seed = session.seed;

        session.log(HarnessEvent::new(
            &session_id,
            seed,
            ORCHESTRATOR_COMPONENT,
            "config_committed",
            session.config_digest.to_hex(),
        ));

        let mut rng = Xorshift64::new(seed);
        let mut engine_trace =
            StressTraceBuilder::new(engine.party_id(), config.recovery_window_steps);
        let mut challenger_trace = challenger_id
            .as_ref()
            .map(|id| StressTraceBuilder::new(id.clone(), config.recovery_window_steps));
        let mut previous_ablation: Option<String> = None;
        let mut target = 0i64;

        // ---- Lock-step drive ------------------------------------------------
        for step in 0..config.steps {
            if cancel.is_cancelled() {
                let now = config.commit_tick(step);
                session.log(
                    HarnessEvent::new(
                        &session_id,
                        seed,
                        ORCHESTRATOR_COMPONENT,
                        "operator_abort",
                        "session_aborted",
                    )
                    .at_step(step),
                );
                session.seal(SessionState::Aborted, now)?;
                return Ok(session);
            }

            target = if step == 0 {
                rng.next_i64_range(-600_000, 600_000)
            } else {
                (target + rng.next_i64_range(-20_000, 20_000)).clamp(-MILLION, MILLION)
            };
            session.raw_stimuli.push(target);

            let delivered = config.stress_schedule.deliver(step, target);
            session.delivered_inputs.push(delivered);
            session.delivered_stimuli.push(encode_stimulus(delivered));

            // Ablation transitions at window boundaries.
            let current_ablation = config
                .stress_schedule
                .active_ablation(step)
                .map(|c| c.to_string());
            if current_ablation != previous_ablation {
                if let Some(capability) = &previous_ablation {
                    engine.set_ablation(capability, false);
                    if let Some(ch) = challenger.as_deref_mut() {
                        ch.set_ablation(capability, false);
                    }
                }
                if let Some(capability) = &current_ablation {
                    engine.set_ablation(capability, true);
                    if let Some(ch) = challenger.as_deref_mut() {
                        ch.set_ablation(capability, true);
                    }
                    session.log(
                        HarnessEvent::new(
                            &session_id,
                            seed,
                            ORCHESTRATOR_COMPONENT,
                            "ablation_enter",
                            capability.clone(),
                        )
                        .at_step(step),
                    );
                }
                previous_ablation = current_ablation;
            }

            let input = StepInput {
                step,
                stimulus_millionths: delivered,
            };
            let now = config.commit_tick(step);
            let stressed = config.stress_schedule.window_at(step).is_some();

            Self::drive_party_step(
                &config,
                &mut session.engine,
                engine,
                input,
                now,
                target,
                stressed,
                &mut engine_trace,
                &mut session.events,
                &mut session.findings,
                &session_id,
                seed,
            );
            if let (Some(record), Some(ch), Some(trace)) = (
                session.challenger.as_mut(),
                challenger.as_deref_mut(),
                challenger_trace.as_mut(),
            ) {
                Self::drive_party_step(
                    &config,
                    record,
                    ch,
                    input,
                    now,
                    target,
                    stressed,
                    trace,
                    &mut session.events,
                    &mut session.findings,
                    &session_id,
                    seed,
                );
            }

            // Engine-only capability: morphism registration.
            if let Some(morphism) = engine.propose_morphism(step) {
                let morphism_id = morphism.morphism_id.clone();
                match session.verifier.register(morphism) {
                    Ok(_) => session.log(
                        HarnessEvent::new(
                            &session_id,
                            seed,
                            "self_closure",
                            "morphism_registered",
                            morphism_id,
                        )
                        .at_step(step)
                        .for_party(engine.party_id()),
                    ),
                    Err(e) => session.log(
                        HarnessEvent::new(
                            &session_id,
                            seed,
                            "self_closure",
                            "morphism_rejected",
                            e.to_string(),
                        )
                        .at_step(step)
                        .for_party(engine.party_id()),
                    ),
                }
            }
        }
        if let Some(capability) = &previous_ablation {
            engine.set_ablation(capability, false);
            if let Some(ch) = challenger.as_deref_mut() {
                ch.set_ablation(capability, false);
            }
        }

        // ---- Reveal phase ---------------------------------------------------
        let reveal_tick = config.reveal_phase_tick();
        Self::reveal_phase(
            &mut session.engine,
            engine,
            reveal_tick,
            &mut session.events,
            &mut session.findings,
            &session_id,
            seed,
        );
        if let (Some(record), Some(ch)) = (session.challenger.as_mut(), challenger.as_deref_mut())
        {
            Self::reveal_phase(
                record,
                ch,
                reveal_tick,
                &mut session.events,
                &mut session.findings,
                &session_id,
                seed,
            );
        }

        let tainted = session.engine.ledger.is_tainted()
            || session
                .challenger
                .as_ref()
                .map(|c| c.ledger.is_tainted())
                .unwrap_or(false);
        if tainted {
            // Fatal: abort without running the remaining tests. The
            // partial evidence trail is preserved and sealed.
            let engine_findings = session.findings_for(&session.engine.party_id);
            let engine_verdict = Verdict::new(
                session.engine.party_id.clone(),
                Vec::new(),
                &config.weights,
                engine_findings,
            );
            session.verdicts.push(engine_verdict);
            if let Some(challenger_record) = session.challenger.as_ref() {
                let findings = session.findings_for(&challenger_record.party_id);
                let verdict = Verdict::new(
                    challenger_record.party_id.clone(),
                    Vec::new(),
                    &config.weights,
                    findings,
                );
                session.verdicts.push(verdict);
            }
            session.seal(SessionState::IntegrityViolation, reveal_tick)?;
            return Ok(session);
        }

        // ---- Closure test ---------------------------------------------------
        let last_step = config.steps - 1;
        session.verifier.run_all_checks(
            &session.engine.ledger,
            &session.delivered_stimuli,
            &session.engine.projection_digests,
            config.closure_check_horizon,
            last_step,
        )?;
        let closure_score = session.verifier.closure_score_millionths();
        let checked = session.verifier.checks().len();
        let applied = session
            .verifier
            .checks()
            .iter()
            .filter(|c| c.applied)
            .count();
        let registered = session.verifier.registered_count();
        let engine_closure = TestResult::closure(
            closure_score,
            registered,
            checked,
            applied,
            config.closure_threshold_millionths,
        );
        if let Some(score) = closure_score {
            if score < config.closure_threshold_millionths {
                session.record_finding(
                    Finding::new(
                        FindingCode::ClosureFail,
                        format!(
                            "closure score {score} below threshold {} ({applied}/{checked} applied)",
                            config.closure_threshold_millionths
                        ),
                    )
                    .for_party(session.engine.party_id.clone()),
                );
            }
        }

        // ---- Stress test ----------------------------------------------------
        let engine_stress_trace = engine_trace.finalize(&config.stress_schedule);
        let engine_stress = Self::stress_result(&engine_stress_trace);
        if engine_stress.tag() == crate::verdict::TestTag::Fail {
            let onsets: Vec<u64> = engine_stress_trace
                .assessments
                .iter()
                .filter(|a| a.outcome == WindowOutcome::NoRebound)
                .map(|a| a.onset_step)
                .collect();
            session.record_finding(
                Finding::new(
                    FindingCode::StressFail,
                    format!("no rebound in windows at {onsets:?}"),
                )
                .for_party(session.engine.party_id.clone()),
            );
        }
        session.engine.stress_trace = Some(engine_stress_trace);

        let challenger_stress = if let (Some(record), Some(trace)) =
            (session.challenger.as_mut(), challenger_trace)
        {
            let trace = trace.finalize(&config.stress_schedule);
            let result = Self::stress_result(&trace);
            record.stress_trace = Some(trace);
            Some(result)
        } else {
            None
        };

        // ---- Diagonal test --------------------------------------------------
        let oracle = DiagonalOracle::new(
            config.diagonal_query_count,
            config.diagonal_min_step,
            config.diagonal_threshold_millionths,
        );
        let query_steps = oracle.select_steps(&mut rng, config.steps);
        session.log(HarnessEvent::new(
            &session_id,
            seed,
            "diagonal_oracle",
            "queries_selected",
            format!("{query_steps:?}"),
        ));

        let engine_diagonal = {
            let cases: Vec<_> = query_steps
                .iter()
                .map(|&step| oracle.judge_case(step, engine.explain(step), &session.verifier))
                .collect();
            let report = oracle.report(session.engine.party_id.clone(), cases);
            for case in report.cases.iter().filter(|c| !c.pass) {
                session.record_finding(
                    Finding::new(
                        FindingCode::DiagonalFail,
                        case.failures
                            .iter()
                            .map(|f| f.to_string())
                            .collect::<Vec<_>>()
                            .join("; "),
                    )
                    .at_step(case.step)
                    .for_party(session.engine.party_id.clone()),
                );
            }
            let result = TestResult::diagonal(
                report.correct_fraction_millionths,
                report.cases.len(),
                report.threshold_millionths,
                report.all_vacuous,
                report.pass,
            );
            session.engine.diagonal_report = Some(report);
            result
        };

        let challenger_diagonal = if let (Some(record), Some(ch)) =
            (session.challenger.as_mut(), challenger.as_deref())
        {
            // The challenger never registered anything: its citations are
            // judged against an empty registry.
            let empty_registry = SelfClosureVerifier::new();
            let cases: Vec<_> = query_steps
                .iter()
                .map(|&step| oracle.judge_case(step, ch.explain(step), &empty_registry))
                .collect();
            let report = oracle.report(record.party_id.clone(), cases);
            let mut findings = Vec::new();
            for case in report.cases.iter().filter(|c| !c.pass) {
                findings.push(
                    Finding::new(
                        FindingCode::DiagonalFail,
                        case.failures
                            .iter()
                            .map(|f| f.to_string())
                            .collect::<Vec<_>>()
                            .join("; "),
                    )
                    .at_step(case.step)
                    .for_party(record.party_id.clone()),
                );
            }
            let result = TestResult::diagonal(
                report.correct_fraction_millionths,
                report.cases.len(),
                report.threshold_millionths,
                report.all_vacuous,
                report.pass,
            );
            record.diagonal_report = Some(report);
            for finding in findings {
                session.record_finding(finding);
            }
            Some(result)
        } else {
            None
        };

        // ---- MDL margin -----------------------------------------------------
        let engine_description_bytes = {
            let mut bytes = engine.description_bytes();
            bytes.extend_from_slice(
                &serde_json::to_vec(&session.engine.ledger)
                    .expect("ledger serialization is infallible"),
            );
            bytes
        };
        let challenger_operands: Option<(Vec<TranscriptEntry>, Vec<u8>)> = session
            .challenger
            .as_ref()
            .zip(challenger.as_deref())
            .map(|(record, ch)| (record.transcript.clone(), ch.description_bytes()));
        let assessment = mdl_margin::assess(
            &session.engine.transcript,
            &engine_description_bytes,
            challenger_operands
                .as_ref()
                .map(|(t, d)| (t.as_slice(), d.as_slice())),
            config.mdl_behavior_match_threshold_millionths,
        );
        if assessment.separation_disproved {
            session.record_finding(
                Finding::new(
                    FindingCode::SeparationDisproved,
                    format!(
                        "challenger matched behavior with smaller description \
                         ({} < {} compressed bytes)",
                        assessment
                            .challenger_description
                            .map(|e| e.compressed_len)
                            .unwrap_or(0),
                        assessment.engine_description.compressed_len
                    ),
                )
                .for_party(session.engine.party_id.clone()),
            );
            session.log(HarnessEvent::new(
                &session_id,
                seed,
                "mdl_margin",
                "separation_disproved",
                "surfaced",
            ));
        }
        let mdl_result = TestResult::mdl(
            assessment.margin_bytes,
            assessment.behavior_match_millionths,
            assessment.separation_disproved,
        );
        session.mdl = Some(assessment);

        // ---- Verdicts and seal ----------------------------------------------
        let engine_per_test = vec![
            engine_closure,
            engine_stress,
            engine_diagonal,
            mdl_result.clone(),
        ];
        let engine_findings = session.findings_for(&session.engine.party_id);
        session.verdicts.push(Verdict::new(
            session.engine.party_id.clone(),
            engine_per_test,
            &config.weights,
            engine_findings,
        ));

        if let Some(challenger_record) = session.challenger.as_ref() {
            let per_test = vec![
                TestResult::closure(None, 0, 0, 0, config.closure_threshold_millionths),
                challenger_stress.expect("challenger stress recorded"),
                challenger_diagonal.expect("challenger diagonal recorded"),
                mdl_result,
            ];
            let findings = session.findings_for(&challenger_record.party_id);
            session.verdicts.push(Verdict::new(
                challenger_record.party_id.clone(),
                per_test,
                &config.weights,
                findings,
            ));
        }

        session.seal(SessionState::Sealed, reveal_tick)?;
        Ok(session)
    }

    /// Step one party with retry-on-budget-overrun, then commit.
    #[allow(clippy::too_many_arguments)]
    fn drive_party_step(
        config: &ProtocolConfig,
        record: &mut PartyRecord,
        party: &mut dyn Party,
        input: StepInput,
        now_ticks: u64,
        target_millionths: i64,
        stressed: bool,
        trace: &mut StressTraceBuilder,
        events: &mut Vec<HarnessEvent>,
        findings: &mut Vec<Finding>,
        session_id: &str,
        seed: u64,
    ) {
        let step = input.step;
        let attempt = Self::step_with_retries(config, party, input, events, session_id, seed);

        match attempt {
            StepAttempt::Accepted(output) => {
                let previous_projection = step
                    .checked_sub(1)
                    .and_then(|prev| record.projections.get(&prev).cloned())
                    .unwrap_or_else(|| output.projection.clone());
                let error = error_millionths(output.output_millionths, target_millionths);
                let coherence = coherence_millionths(&previous_projection, &output.projection);
                trace.record(step, error, coherence, stressed);

                record.transcript.push(TranscriptEntry {
                    step,
                    stimulus_millionths: input.stimulus_millionths,
                    output_millionths: output.output_millionths,
                });
                let projection_digest = StateDigest::compute_parts(&[
                    b"doppel.projection.v1",
                    &output
                        .projection
                        .iter()
                        .flat_map(|v| v.to_le_bytes())
                        .collect::<Vec<u8>>(),
                ]);
                record.projections.insert(step, output.projection.clone());
                record.projection_digests.insert(step, projection_digest);

                if let Err(e) = record.ledger.commit(
                    step,
                    output.state_digest,
                    output.salt_commitment,
                    now_ticks,
                ) {
                    events.push(
                        HarnessEvent::new(
                            session_id,
                            seed,
                            "commitment_ledger",
                            "commit_rejected",
                            e.to_string(),
                        )
                        .at_step(step)
                        .for_party(record.party_id.clone()),
                    );
                }
            }
            StepAttempt::TimedOut => {
                record.timeout_steps.push(step);
                findings.push(
                    Finding::new(
                        FindingCode::Timeout,
                        format!(
                            "step exceeded {} ticks after {} retries",
                            config.step_tick_budget, config.timeout_retry_cap
                        ),
                    )
                    .at_step(step)
                    .for_party(record.party_id.clone()),
                );
                // Behavioral gap: a timed-out step contributes maximal
                // error and no commitment.
                trace.record(
                    step,
                    error_millionths(0, target_millionths).max(MILLION),
                    0,
                    stressed,
                );
                record.transcript.push(TranscriptEntry {
                    step,
                    stimulus_millionths: input.stimulus_millionths,
                    output_millionths: 0,
                });
            }
        }
    }

    fn step_with_retries(
        config: &ProtocolConfig,
        party: &mut dyn Party,
        input: StepInput,
        events: &mut Vec<HarnessEvent>,
        session_id: &str,
        seed: u64,
    ) -> StepAttempt {
        for attempt in 0..=config.timeout_retry_cap {
            match party.step(input) {
                Ok(output) => {
                    if let Err(e) = validate_step_output(&output) {
                        events.push(
                            HarnessEvent::new(
                                session_id,
                                seed,
                                ORCHESTRATOR_COMPONENT,
                                "step_output_invalid",
                                e.to_string(),
                            )
                            .at_step(input.step)
                            .for_party(party.party_id()),
                        );
                        return StepAttempt::TimedOut;
                    }
                    if output.ticks_consumed <= config.step_tick_budget {
                        return StepAttempt::Accepted(output);
                    }
                    events.push(
                        HarnessEvent::new(
                            session_id,
                            seed,
                            ORCHESTRATOR_COMPONENT,
                            "step_over_budget",
                            format!("attempt {attempt}: {} ticks", output.ticks_consumed),
                        )
                        .at_step(input.step)
                        .for_party(party.party_id()),
                    );
                }
                Err(e) => {
                    events.push(
                        HarnessEvent::new(
                            session_id,
                            seed,
                            ORCHESTRATOR_COMPONENT,
                            "step_error",
                            e.to_string(),
                        )
                        .at_step(input.step)
                        .for_party(party.party_id()),
                    );
                }
            }
        }
        StepAttempt::TimedOut
    }

    /// Open every commitment for one party. Deferral is budgeted; a salt
    /// mismatch taints the ledger and the caller escalates. The final
    /// status is persisted on the party record.
    fn reveal_phase(
        record: &mut PartyRecord,
        party: &mut dyn Party,
        reveal_tick: u64,
        events: &mut Vec<HarnessEvent>,
        findings: &mut Vec<Finding>,
        session_id: &str,
        seed: u64,
    ) {
        let mut status = RevealStatus::Complete;
        let steps: Vec<u64> = record.ledger.records().iter().map(|r| r.step).collect();
        'steps: for step in steps {
            loop {
                match party.reveal(step) {
                    Some(salt) => {
                        match record.ledger.reveal(step, Some(salt), reveal_tick) {
                            Ok(RevealOutcome::Verified) => {}
                            Ok(RevealOutcome::Mismatch) => {
                                findings.push(
                                    Finding::new(
                                        FindingCode::IntegrityViolation,
                                        "revealed salt does not verify against commitment",
                                    )
                                    .at_step(step)
                                    .for_party(record.party_id.clone()),
                                );
                                events.push(
                                    HarnessEvent::new(
                                        session_id,
                                        seed,
                                        "commitment_ledger",
                                        "reveal_mismatch",
                                        "session_tainted",
                                    )
                                    .at_step(step)
                                    .for_party(record.party_id.clone())
                                    .with_error_code(FindingCode::IntegrityViolation.as_str()),
                                );
                                record.reveal_status = status;
                                return;
                            }
                            Ok(RevealOutcome::Deferred { .. }) => {}
                            Err(e) => {
                                events.push(
                                    HarnessEvent::new(
                                        session_id,
                                        seed,
                                        "commitment_ledger",
                                        "reveal_rejected",
                                        e.to_string(),
                                    )
                                    .at_step(step)
                                    .for_party(record.party_id.clone()),
                                );
                            }
                        }
                        break;
                    }
                    None => match record.ledger.reveal(step, None, reveal_tick) {
                        Ok(RevealOutcome::Deferred {
                            defer_count,
                            budget_exhausted,
                        }) => {
                            if budget_exhausted {
                                status = RevealStatus::Failed;
                                findings.push(
                                    Finding::new(
                                        FindingCode::Incomplete,
                                        format!(
                                            "defer budget exhausted after {defer_count} deferrals; \
                                             escalated to fail"
                                        ),
                                    )
                                    .at_step(step)
                                    .for_party(record.party_id.clone()),
                                );
                                break 'steps;
                            }
                            if status == RevealStatus::Complete {
                                status = RevealStatus::Incomplete;
                            }
                            findings.push(
                                Finding::new(
                                    FindingCode::Incomplete,
                                    format!("reveal deferred ({defer_count} so far)"),
                                )
                                .at_step(step)
                                .for_party(record.party_id.clone()),
                            );
                        }
                        Ok(_) | Err(_) => break,
                    },
                }
            }
        }
        events.push(
            HarnessEvent::new(
                session_id,
                seed,
                "commitment_ledger",
                "reveal_phase_done",
                status.as_str(),
            )
            .for_party(record.party_id.clone()),
        );
        record.reveal_status = status;
    }

    fn stress_result(trace: &crate::torsion_stress::StressTrace) -> TestResult {
        let no_rebound_onsets: Vec<u64> = trace
            .assessments
            .iter()
            .filter(|a| a.outcome == WindowOutcome::NoRebound)
            .map(|a| a.onset_step)
            .collect();
        let ablated: Vec<String> = trace
            .assessments
            .iter()
            .filter(|a| a.outcome == WindowOutcome::NoRebound)
            .filter_map(|a| a.ablated_capability.clone())
            .collect();
        TestResult::stress(
            trace.session_outcome(),
            trace.assessments.len(),
            no_rebound_onsets,
            ablated,
        )
    }
}

// ---------------------------------------------------------------------------
// Campaign
// ---------------------------------------------------------------------------

/// One seed's summary row in a campaign report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedOutcome {
    pub seed: u64,
    pub session_id: String,
    pub engine_verdict_tag: crate::verdict::VerdictTag,
    pub challenger_verdict_tag: Option<crate::verdict::VerdictTag>,
    pub engine_stress_outcome: WindowOutcome,
    pub challenger_stress_outcome: Option<WindowOutcome>,
    pub closure_score_millionths: Option<i64>,
    pub mdl_margin_bytes: i64,
    pub separation_disproved: bool,
}

/// Aggregate report across the seed population.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignReport {
    pub schema_version: String,
    pub sessions: usize,
    pub per_seed: Vec<SeedOutcome>,
    pub engine_rebound: ReboundSummary,
    pub challenger_rebound: Option<ReboundSummary>,
    pub closure_mean_millionths: Option<i64>,
    pub closure_below_threshold: bool,
    pub mdl_sustained_positive: bool,
    pub findings: Vec<Finding>,
}

/// Run one session per seed as isolated parallel trials and aggregate.
///
/// Factories build fresh parties per seed so no party state crosses a
/// session boundary. Sealed sessions land in the audit store.
pub fn run_campaign<E, C, FE, FC>(
    base_config: &ProtocolConfig,
    trial_seeds: &[u64],
    make_engine: FE,
    make_challenger: FC,
    store: &AuditStore,
) -> Result<CampaignReport, OrchestratorError>
where
    E: Party,
    C: Party,
    FE: Fn(u64) -> E + Sync,
    FC: Fn(u64) -> Option<C> + Sync,
{
    base_config.validate()?;

    let sessions: Vec<Result<ChallengeSession, OrchestratorError>> = thread::scope(|scope| {
        let handles: Vec<_> = trial_seeds
            .iter()
            .map(|&seed| {
                let make_engine = &make_engine;
                let make_challenger = &make_challenger;
                scope.spawn(move || {
                    let mut config = base_config.clone();
                    config.session_seed = seed;
                    for window in &mut config.stress_schedule.windows {
                        window.seed ^= seed;
                    }
                    let orchestrator = MimicChallengeOrchestrator::new(config)?;
                    let mut engine = make_engine(seed);
                    let mut challenger = make_challenger(seed);
                    let cancel = CancelFlag::new();
                    orchestrator.run_session(
                        &mut engine,
                        challenger.as_mut().map(|c| c as &mut dyn Party),
                        &cancel,
                    )
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("session thread panicked"))
            .collect()
    });

    let mut per_seed = Vec::new();
    let mut engine_outcomes = Vec::new();
    let mut challenger_outcomes = Vec::new();
    let mut mdl_window = crate::mdl_margin::MdlWindow::new(base_config.mdl_window_sessions);
    let mut closure_window =
        crate::self_closure::ClosureWindow::new(base_config.closure_window_sessions);
    let mut findings = Vec::new();
    let mut any_challenger = false;

    for (index, session) in sessions.into_iter().enumerate() {
        let session = session?;
        let seed = trial_seeds[index];

        let engine_verdict = session
            .verdict_for(&session.engine.party_id)
            .cloned()
            .map(|v| v.verdict_tag)
            .unwrap_or(crate::verdict::VerdictTag::Inconclusive);
        let challenger_verdict = session
            .challenger
            .as_ref()
            .and_then(|c| session.verdict_for(&c.party_id))
            .map(|v| v.verdict_tag);

        let engine_stress_outcome = session
            .engine
            .stress_trace
            .as_ref()
            .map(|t| t.session_outcome())
            .unwrap_or(WindowOutcome::Indeterminate);
        engine_outcomes.push(engine_stress_outcome);

        let challenger_stress_outcome = session.challenger.as_ref().map(|c| {
            any_challenger = true;
            c.stress_trace
                .as_ref()
                .map(|t| t.session_outcome())
                .unwrap_or(WindowOutcome::Indeterminate)
        });
        if let Some(outcome) = challenger_stress_outcome {
            challenger_outcomes.push(outcome);
        }

        let closure_score = session.verifier.closure_score_millionths();
        if let Some(score) = closure_score {
            closure_window.push(score);
        }
        let (margin, disproved) = session
            .mdl
            .as_ref()
            .map(|m| (m.margin_bytes, m.separation_disproved))
            .unwrap_or((0, false));
        mdl_window.push(margin);

        per_seed.push(SeedOutcome {
            seed,
            session_id: session.session_id.clone(),
            engine_verdict_tag: engine_verdict,
            challenger_verdict_tag: challenger_verdict,
            engine_stress_outcome,
            challenger_stress_outcome,
            closure_score_millionths: closure_score,
            mdl_margin_bytes: margin,
            separation_disproved: disproved,
        });
        if disproved {
            findings.push(Finding::new(
                FindingCode::SeparationDisproved,
                format!("seed {seed}: challenger matched with smaller description"),
            ));
        }

        store.append(session)?;
    }

    let engine_rebound =
        ReboundSummary::from_outcomes(&engine_outcomes, base_config.rebound_quorum_millionths);
    if !engine_rebound.pass {
        findings.push(Finding::new(
            FindingCode::StressFail,
            format!(
                "rebound quorum unmet: {}/{} seeds",
                engine_rebound.seeds_rebounded, engine_rebound.seeds_assessed
            ),
        ));
    }
    let challenger_rebound = if any_challenger {
        Some(ReboundSummary::from_outcomes(
            &challenger_outcomes,
            base_config.rebound_quorum_millionths,
        ))
    } else {
        None
    };

    let closure_mean = closure_window.mean_millionths();
    let closure_below_threshold =
        closure_window.below_threshold(base_config.closure_threshold_millionths);
    if closure_below_threshold {
        findings.push(Finding::new(
            FindingCode::ClosureFail,
            format!(
                "rolling closure mean {:?} below threshold {}",
                closure_mean, base_config.closure_threshold_millionths
            ),
        ));
    }

    Ok(CampaignReport {
        schema_version: CAMPAIGN_REPORT_SCHEMA_VERSION.to_string(),
        sessions: per_seed.len(),
        per_seed,
        engine_rebound,
        challenger_rebound,
        closure_mean_millionths: closure_mean,
        closure_below_threshold,
        mdl_sustained_positive: mdl_window.sustained_positive(),
        findings,
    })
}
