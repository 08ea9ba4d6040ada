//! Reference parties for harness validation.
//!
//! [`RecursiveEngine`] is a genuine stateful engine built to exhibit
//! exactly the properties the protocol tests for: it tracks the stimulus
//! with a corrective gain, periodically synthesizes a new transition rule
//! that genuinely governs its digest evolution from then on, keeps its
//! own history for diagonal answers, and self-corrects after stress. Its
//! correction and rule-application machinery is one named mechanism
//! (`self_closure`), so ablating it removes both the rebound and the
//! rule application — the causal-attribution control of the stress
//! harness.
//!
//! [`MimicChallenger`] is the adversarial baseline: input/output access
//! only, in several configurations (constant output, replayed lookup
//! table, padded description, fabricated citations).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::digest::{salt_commitment, Salt, StateDigest};
use crate::party::{
    encode_stimulus, Citation, Party, PartyError, PartyRole, StepInput, StepOutput,
};
use crate::rng::Xorshift64;
use crate::self_closure::{MorphismRecord, TransitionRule};

/// Fixed-point scale: 1_000_000 ≡ 1.0.
const MILLION: i64 = 1_000_000;

/// Capability name of the engine's correction + rule-application path.
pub const SELF_CLOSURE_CAPABILITY: &str = "self_closure";

/// Systematic per-step state drift while the mechanism is ablated.
const ABLATED_DRIFT_MILLIONTHS: i64 = 60_000;

// ---------------------------------------------------------------------------
// RecursiveEngine
// ---------------------------------------------------------------------------

/// Tunables for the genuine engine fixture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineParams {
    /// Corrective gain toward the stimulus.
    pub gain_millionths: i64,
    /// A new rule is synthesized every this many steps.
    pub morphism_interval: u64,
    /// Steps needed to rebuild the mechanism after an ablation ends.
    pub resynthesis_delay: u64,
    /// Reveal deferrals before the engine discloses (défer policy).
    pub defer_rounds: u32,
    /// Incompressible padding appended to the self-description.
    pub description_padding: usize,
    /// Ticks reported per step (above budget simulates a slow party).
    pub ticks_per_step: u64,
}

impl Default for EngineParams {
    fn default() -> Self {
        Self {
            gain_millionths: 500_000,
            morphism_interval: 10,
            resynthesis_delay: 12,
            defer_rounds: 0,
            description_padding: 0,
            ticks_per_step: 100,
        }
    }
}

/// A rule the engine has synthesized, with its registry identity.
#[derive(Debug, Clone)]
struct SynthesizedRule {
    produced_at_step: u64,
    rule: TransitionRule,
    morphism_id: String,
    rule_digest: StateDigest,
}

/// Genuine stateful engine fixture with self-correcting dynamics.
#[derive(Debug, Clone)]
pub struct RecursiveEngine {
    party_id: String,
    params: EngineParams,
    rng: Xorshift64,
    estimate_millionths: i64,
    digest: StateDigest,
    rules: Vec<SynthesizedRule>,
    salts: BTreeMap<u64, Salt>,
    defers_remaining: u32,
    mechanism_down: bool,
    recovery_at_step: Option<u64>,
    last_step: u64,
    description_padding_bytes: Vec<u8>,
}

impl RecursiveEngine {
    pub fn new(party_id: impl Into<String>, seed: u64, params: EngineParams) -> Self {
        let party_id = party_id.into();
        let mut rng = Xorshift64::new(seed ^ 0x7265_6375_7273_6521);
        let mut description_padding_bytes = Vec::with_capacity(params.description_padding);
        while description_padding_bytes.len() < params.description_padding {
            description_padding_bytes.extend_from_slice(&rng.next_u64().to_le_bytes());
        }
        description_padding_bytes.truncate(params.description_padding);
        let digest = StateDigest::compute_parts(&[
            b"doppel.fixture.engine-genesis.v1",
            party_id.as_bytes(),
            &seed.to_le_bytes(),
        ]);
        Self {
            party_id,
            defers_remaining: params.defer_rounds,
            params,
            rng,
            estimate_millionths: 0,
            digest,
            rules: Vec::new(),
            salts: BTreeMap::new(),
            mechanism_down: false,
            recovery_at_step: None,
            last_step: 0,
            description_padding_bytes,
        }
    }

    /// The rule governing digest evolution at `step` (strictly after its
    /// origin).
    fn rule_active_at(&self, step: u64) -> Option<&SynthesizedRule> {
        self.rules
            .iter()
            .filter(|r| r.produced_at_step < step)
            .max_by_key(|r| r.produced_at_step)
    }

    /// The rule the engine believes explains `step` (origin at or before).
    fn rule_believed_at(&self, step: u64) -> Option<&SynthesizedRule> {
        self.rules
            .iter()
            .filter(|r| r.produced_at_step <= step)
            .max_by_key(|r| r.produced_at_step)
    }
}

impl Party for RecursiveEngine {
    fn party_id(&self) -> &str {
        &self.party_id
    }

    fn role(&self) -> PartyRole {
        PartyRole::Engine
    }

    fn step(&mut self, input: StepInput) -> Result<StepOutput, PartyError> {
        let step = input.step;
        self.last_step = step;

        if let Some(recovery_at) = self.recovery_at_step {
            if self.mechanism_down && step >= recovery_at {
                self.mechanism_down = false;
                self.recovery_at_step = None;
            }
        }

        if self.mechanism_down {
            // Uncorrected internal drift: the state diffuses without the
            // self-closure path.
            self.estimate_millionths =
                (self.estimate_millionths + ABLATED_DRIFT_MILLIONTHS).clamp(-2 * MILLION, 2 * MILLION);
            self.digest = StateDigest::compute_parts(&[
                b"doppel.fixture.engine-ablated.v1",
                self.digest.as_bytes(),
                &encode_stimulus(input.stimulus_millionths).to_le_bytes(),
            ]);
        } else {
            if let Some(stimulus) = input.stimulus_millionths {
                let delta = stimulus - self.estimate_millionths;
                self.estimate_millionths += delta * self.params.gain_millionths / MILLION;
            }
            // Digest evolves by the active synthesized rule; plain hashing
            // before the first rule exists.
            self.digest = match self.rule_active_at(step) {
                Some(active) => active
                    .rule
                    .apply(&self.digest, encode_stimulus(input.stimulus_millionths)),
                None if step > 0 => StateDigest::compute_parts(&[
                    b"doppel.fixture.engine-preclosure.v1",
                    self.digest.as_bytes(),
                    &encode_stimulus(input.stimulus_millionths).to_le_bytes(),
                ]),
                None => self.digest,
            };
        }

        let salt = Salt(self.rng.next_bytes_32());
        let binding = salt_commitment(&salt, &self.digest, step);
        self.salts.insert(step, salt);

        Ok(StepOutput {
            output_millionths: self.estimate_millionths,
            state_digest: self.digest,
            salt_commitment: binding,
            // Discretized decode of the internal state: coarse buckets
            // keep the coherence trace stable under tracking jitter.
            projection: vec![self.estimate_millionths / 50_000],
            ticks_consumed: self.params.ticks_per_step,
        })
    }

    fn propose_morphism(&mut self, step: u64) -> Option<MorphismRecord> {
        if step % self.params.morphism_interval != 0 {
            return None;
        }
        let mut rule_bytes = Vec::with_capacity(24);
        rule_bytes.extend_from_slice(b"gain-retune:");
        rule_bytes.extend_from_slice(&self.rng.next_u64().to_le_bytes());
        rule_bytes.extend_from_slice(&step.to_le_bytes());
        let rule = TransitionRule::new(rule_bytes);
        let record = MorphismRecord::derive("gain-retune", step, rule.clone());
        self.rules.push(SynthesizedRule {
            produced_at_step: step,
            rule,
            morphism_id: record.morphism_id.clone(),
            rule_digest: record.rule_digest,
        });
        Some(record)
    }

    fn explain(&self, step: u64) -> Vec<Citation> {
        match self.rule_believed_at(step) {
            Some(rule) => vec![Citation {
                morphism_id: rule.morphism_id.clone(),
                claimed_digest: rule.rule_digest,
            }],
            None => Vec::new(),
        }
    }

    fn reveal(&mut self, step: u64) -> Option<Salt> {
        if self.defers_remaining > 0 {
            self.defers_remaining -= 1;
            return None;
        }
        self.salts.get(&step).copied()
    }

    fn description_bytes(&self) -> Vec<u8> {
        let mut bytes = serde_json::to_vec(&self.params).expect("params serialize");
        bytes.extend_from_slice(self.party_id.as_bytes());
        for rule in &self.rules {
            bytes.extend_from_slice(&rule.produced_at_step.to_le_bytes());
            bytes.extend_from_slice(&rule.rule.rule_bytes);
        }
        bytes.extend_from_slice(&self.description_padding_bytes);
        bytes
    }

    fn set_ablation(&mut self, capability: &str, active: bool) {
        if capability != SELF_CLOSURE_CAPABILITY {
            return;
        }
        if active {
            self.mechanism_down = true;
            self.recovery_at_step = None;
        } else if self.mechanism_down {
            // Rebuilding the knocked-out mechanism takes time; recovery
            // is not instantaneous when the window ends.
            self.recovery_at_step = Some(self.last_step + 1 + self.params.resynthesis_delay);
        }
    }
}

// ---------------------------------------------------------------------------
// MimicChallenger
// ---------------------------------------------------------------------------

/// How the mimic produces outputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MimicBehavior {
    /// A fixed output regardless of stimulus.
    Constant { output_millionths: i64 },
    /// A recorded lookup table replayed step by step (the "cheating"
    /// tracker for the MDL sign fixtures).
    Replay { outputs: Vec<i64> },
}

/// Tunables for the black-box challenger fixture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MimicParams {
    pub behavior: MimicBehavior,
    /// Answer diagonal queries with ids that do not resolve.
    pub fabricate_citations: bool,
    /// Incompressible padding appended to the self-description.
    pub description_padding: usize,
    pub ticks_per_step: u64,
}

impl Default for MimicParams {
    fn default() -> Self {
        Self {
            behavior: MimicBehavior::Constant {
                output_millionths: 900_000,
            },
            fabricate_citations: true,
            description_padding: 0,
            ticks_per_step: 50,
        }
    }
}

/// Black-box challenger: input/output access only, constant internal
/// digest, no morphism capability.
#[derive(Debug, Clone)]
pub struct MimicChallenger {
    party_id: String,
    params: MimicParams,
    rng: Xorshift64,
    digest: StateDigest,
    salts: BTreeMap<u64, Salt>,
    description_padding_bytes: Vec<u8>,
}

impl MimicChallenger {
    pub fn new(party_id: impl Into<String>, seed: u64, params: MimicParams) -> Self {
        let party_id = party_id.into();
        let mut rng = Xorshift64::new(seed ^ 0x6d69_6d69_6363_6863);
        let mut description_padding_bytes = Vec::with_capacity(params.description_padding);
        while description_padding_bytes.len() < params.description_padding {
            description_padding_bytes.extend_from_slice(&rng.next_u64().to_le_bytes());
        }
        description_padding_bytes.truncate(params.description_padding);
        let digest =
            StateDigest::compute_parts(&[b"doppel.fixture.mimic.v1", party_id.as_bytes()]);
        Self {
            party_id,
            params,
            rng,
            digest,
            salts: BTreeMap::new(),
            description_padding_bytes,
        }
    }
}

impl Party for MimicChallenger {
    fn party_id(&self) -> &str {
        &self.party_id
    }

    fn role(&self) -> PartyRole {
        PartyRole::Challenger
    }

    fn step(&mut self, input: StepInput) -> Result<StepOutput, PartyError> {
        let output_millionths = match &self.params.behavior {
            MimicBehavior::Constant { output_millionths } => *output_millionths,
            MimicBehavior::Replay { outputs } => {
                outputs.get(input.step as usize).copied().unwrap_or(0)
            }
        };
        let salt = Salt(self.rng.next_bytes_32());
        let binding = salt_commitment(&salt, &self.digest, input.step);
        self.salts.insert(input.step, salt);
        Ok(StepOutput {
            output_millionths,
            // Stateless: the digest never changes.
            state_digest: self.digest,
            salt_commitment: binding,
            projection: vec![0],
            ticks_consumed: self.params.ticks_per_step,
        })
    }

    fn propose_morphism(&mut self, _step: u64) -> Option<MorphismRecord> {
        None
    }

    fn explain(&self, step: u64) -> Vec<Citation> {
        if self.params.fabricate_citations {
            vec![Citation {
                morphism_id: format!("mrf-{step:016x}"),
                claimed_digest: StateDigest::compute_parts(&[
                    b"doppel.fixture.fabricated.v1",
                    &step.to_le_bytes(),
                ]),
            }]
        } else {
            Vec::new()
        }
    }

    fn reveal(&mut self, step: u64) -> Option<Salt> {
        self.salts.get(&step).copied()
    }

    fn description_bytes(&self) -> Vec<u8> {
        let mut bytes = serde_json::to_vec(&self.params).expect("params serialize");
        bytes.extend_from_slice(self.party_id.as_bytes());
        bytes.extend_from_slice(&self.description_padding_bytes);
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stepped_engine(steps: u64) -> RecursiveEngine {
        let mut engine = RecursiveEngine::new("engine-a", 42, EngineParams::default());
        for step in 0..steps {
            engine
                .step(StepInput {
                    step,
                    stimulus_millionths: Some(300_000),
                })
                .expect("step");
            engine.propose_morphism(step);
        }
        engine
    }

    #[test]
    fn engine_converges_toward_constant_stimulus() {
        let mut engine = RecursiveEngine::new("engine-a", 1, EngineParams::default());
        let mut last_output = 0;
        for step in 0..20 {
            let out = engine
                .step(StepInput {
                    step,
                    stimulus_millionths: Some(400_000),
                })
                .expect("step");
            last_output = out.output_millionths;
        }
        assert!((last_output - 400_000).abs() < 1_000);
    }

    #[test]
    fn engine_holds_estimate_on_masked_input() {
        let mut engine = RecursiveEngine::new("engine-a", 1, EngineParams::default());
        for step in 0..10 {
            engine
                .step(StepInput {
                    step,
                    stimulus_millionths: Some(400_000),
                })
                .expect("step");
        }
        let before = engine.estimate_millionths;
        let out = engine
            .step(StepInput {
                step: 10,
                stimulus_millionths: None,
            })
            .expect("masked step");
        assert_eq!(out.output_millionths, before);
    }

    #[test]
    fn engine_digest_follows_registered_rule() {
        let mut engine = RecursiveEngine::new("engine-a", 7, EngineParams::default());
        let out0 = engine
            .step(StepInput {
                step: 0,
                stimulus_millionths: Some(100_000),
            })
            .expect("step 0");
        let morphism = engine.propose_morphism(0).expect("rule at step 0");

        let out1 = engine
            .step(StepInput {
                step: 1,
                stimulus_millionths: Some(120_000),
            })
            .expect("step 1");
        let expected = morphism
            .rule
            .apply(&out0.state_digest, encode_stimulus(Some(120_000)));
        assert_eq!(out1.state_digest, expected);
    }

    #[test]
    fn engine_proposes_on_interval_only() {
        let mut engine = RecursiveEngine::new("engine-a", 7, EngineParams::default());
        assert!(engine.propose_morphism(0).is_some());
        assert!(engine.propose_morphism(3).is_none());
        assert!(engine.propose_morphism(10).is_some());
        assert!(engine.propose_morphism(11).is_none());
    }

    #[test]
    fn engine_explains_with_registered_identity() {
        let engine = stepped_engine(25);
        let citations = engine.explain(15);
        assert_eq!(citations.len(), 1);
        // The believed rule at step 15 originates at step 10.
        let believed = engine.rule_believed_at(15).expect("rule");
        assert_eq!(believed.produced_at_step, 10);
        assert_eq!(citations[0].morphism_id, believed.morphism_id);
    }

    #[test]
    fn engine_reveals_committed_salts() {
        let mut engine = stepped_engine(5);
        let salt = engine.reveal(3).expect("salt for step 3");
        assert_eq!(engine.salts.get(&3).copied(), Some(salt));
        assert!(engine.reveal(99).is_none());
    }

    #[test]
    fn engine_defer_policy_counts_down() {
        let mut engine = RecursiveEngine::new(
            "engine-a",
            1,
            EngineParams {
                defer_rounds: 2,
                ..EngineParams::default()
            },
        );
        engine
            .step(StepInput {
                step: 0,
                stimulus_millionths: Some(0),
            })
            .expect("step");
        assert!(engine.reveal(0).is_none());
        assert!(engine.reveal(0).is_none());
        assert!(engine.reveal(0).is_some());
    }

    #[test]
    fn ablation_stops_rule_application_and_recovery_is_delayed() {
        let mut engine = RecursiveEngine::new("engine-a", 9, EngineParams::default());
        let out0 = engine
            .step(StepInput {
                step: 0,
                stimulus_millionths: Some(100_000),
            })
            .expect("step 0");
        let morphism = engine.propose_morphism(0).expect("rule");

        engine.set_ablation(SELF_CLOSURE_CAPABILITY, true);
        let out1 = engine
            .step(StepInput {
                step: 1,
                stimulus_millionths: Some(100_000),
            })
            .expect("ablated step");
        let would_be = morphism
            .rule
            .apply(&out0.state_digest, encode_stimulus(Some(100_000)));
        assert_ne!(out1.state_digest, would_be);

        // Ablation ends, but the mechanism needs resynthesis_delay steps.
        engine.set_ablation(SELF_CLOSURE_CAPABILITY, false);
        let out2 = engine
            .step(StepInput {
                step: 2,
                stimulus_millionths: Some(100_000),
            })
            .expect("still down");
        // Drift continues: output moves away instead of correcting.
        assert!(out2.output_millionths > out1.output_millionths);
        assert!(engine.mechanism_down);

        // Well past the resynthesis horizon the mechanism is back.
        for step in 3..20 {
            engine
                .step(StepInput {
                    step,
                    stimulus_millionths: Some(100_000),
                })
                .expect("step");
        }
        assert!(!engine.mechanism_down);
    }

    #[test]
    fn engine_description_padding_is_applied() {
        let lean = RecursiveEngine::new("engine-a", 3, EngineParams::default());
        let padded = RecursiveEngine::new(
            "engine-a",
            3,
            EngineParams {
                description_padding: 10_000,
                ..EngineParams::default()
            },
        );
        assert!(padded.description_bytes().len() >= lean.description_bytes().len() + 10_000);
    }

    #[test]
    fn mimic_constant_output_and_digest() {
        let mut mimic = MimicChallenger::new("mimic-b", 5, MimicParams::default());
        let a = mimic
            .step(StepInput {
                step: 0,
                stimulus_millionths: Some(123_456),
            })
            .expect("step");
        let b = mimic
            .step(StepInput {
                step: 1,
                stimulus_millionths: Some(-654_321),
            })
            .expect("step");
        assert_eq!(a.output_millionths, 900_000);
        assert_eq!(b.output_millionths, 900_000);
        assert_eq!(a.state_digest, b.state_digest);
    }

    #[test]
    fn mimic_never_proposes_morphisms() {
        let mut mimic = MimicChallenger::new("mimic-b", 5, MimicParams::default());
        for step in 0..50 {
            assert!(mimic.propose_morphism(step).is_none());
        }
    }

    #[test]
    fn mimic_fabricates_or_stays_silent() {
        let fabricating = MimicChallenger::new("mimic-b", 5, MimicParams::default());
        assert_eq!(fabricating.explain(10).len(), 1);

        let silent = MimicChallenger::new(
            "mimic-c",
            5,
            MimicParams {
                fabricate_citations: false,
                ..MimicParams::default()
            },
        );
        assert!(silent.explain(10).is_empty());
    }

    #[test]
    fn mimic_replay_mode_replays_table() {
        let mut mimic = MimicChallenger::new(
            "mimic-r",
            5,
            MimicParams {
                behavior: MimicBehavior::Replay {
                    outputs: vec![10, 20, 30],
                },
                ..MimicParams::default()
            },
        );
        for (step, expected) in [(0u64, 10i64), (1, 20), (2, 30), (3, 0)] {
            let out = mimic
                .step(StepInput {
                    step,
                    stimulus_millionths: Some(0),
                })
                .expect("step");
            assert_eq!(out.output_millionths, expected);
        }
    }

    #[test]
    fn mimic_reveals_honest_salts() {
        let mut mimic = MimicChallenger::new("mimic-b", 5, MimicParams::default());
        let out = mimic
            .step(StepInput {
                step: 0,
                stimulus_millionths: Some(0),
            })
            .expect("step");
        let salt = mimic.reveal(0).expect("salt");
        assert!(crate::digest::verify_salt(
            &out.salt_commitment,
            &salt,
            &out.state_digest,
            0
        ));
    }

    #[test]
    fn fixture_determinism_same_seed_same_run() {
        let run = |seed: u64| {
            let mut engine = RecursiveEngine::new("engine-a", seed, EngineParams::default());
            let mut digests = Vec::new();
            for step in 0..30 {
                let out = engine
                    .step(StepInput {
                        step,
                        stimulus_millionths: Some((step as i64) * 7_000),
                    })
                    .expect("step");
                digests.push(out.state_digest);
                engine.propose_morphism(step);
            }
            digests
        };
        assert_eq!(run(11), run(11));
        assert_ne!(run(11), run(12));
    }
}
