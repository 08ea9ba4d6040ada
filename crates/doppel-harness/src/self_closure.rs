//! Self-closure verification: counterfactual replay of claimed operators.
//!
//! An engine that claims to synthesize a new rule must later behave as if
//! that rule were in effect. The verifier takes no claim on faith: it
//! replays the claimed [`TransitionRule`] from the committed digest at the
//! morphism's origin step, folds it over the recorded stimuli, and compares
//! the result against the digest actually committed at a later step.
//!
//! Engines with continuous internal state may verify approximately: the
//! same fold is run over the committed projection-digest stream (the second
//! hash of the discretized state projection) and either channel matching
//! marks the morphism applied.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::commitment_ledger::CommitmentLedger;
use crate::digest::{derive_content_id, StateDigest};

pub const SELF_CLOSURE_SCHEMA_VERSION: &str = "doppel-harness.self-closure.v1";

/// Fixed-point scale: 1_000_000 ≡ 1.0.
const MILLION: i64 = 1_000_000;

// ---------------------------------------------------------------------------
// TransitionRule
// ---------------------------------------------------------------------------

/// The machine-checkable content of a claimed operator.
///
/// A rule is opaque bytes with a fixed replay semantics: while active, the
/// party's committed digest must evolve as
/// `d_{t} = SHA-256(d_{t-1} ‖ rule_bytes ‖ stimulus_t)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRule {
    pub rule_bytes: Vec<u8>,
}

impl TransitionRule {
    pub fn new(rule_bytes: Vec<u8>) -> Self {
        Self { rule_bytes }
    }

    /// One replay step: fold the rule over a predecessor digest and the
    /// stimulus delivered at the step being replayed.
    pub fn apply(&self, from: &StateDigest, stimulus_millionths: i64) -> StateDigest {
        StateDigest::compute_parts(&[
            b"doppel.transition-rule.v1",
            from.as_bytes(),
            &self.rule_bytes,
            &stimulus_millionths.to_le_bytes(),
        ])
    }

    /// Content digest of the rule itself, cited by diagonal answers.
    pub fn digest(&self) -> StateDigest {
        StateDigest::compute_parts(&[b"doppel.transition-rule.v1", &self.rule_bytes])
    }
}

// ---------------------------------------------------------------------------
// MorphismRecord
// ---------------------------------------------------------------------------

/// A claimed new operator, registered by the engine at its origin step.
///
/// `applied` flips to true only after counterfactual replay confirms a
/// later step's behavior is causally consistent with the rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MorphismRecord {
    /// Content-addressed id (`mrf-<hex16>`), derived from rule + origin.
    pub morphism_id: String,
    /// Engine-declared kind label, e.g. `gain-retune`.
    pub kind: String,
    pub produced_at_step: u64,
    pub rule: TransitionRule,
    pub rule_digest: StateDigest,
    pub applied: bool,
}

impl MorphismRecord {
    pub fn derive(kind: impl Into<String>, produced_at_step: u64, rule: TransitionRule) -> Self {
        let rule_digest = rule.digest();
        let step_bytes = produced_at_step.to_le_bytes();
        let morphism_id = derive_content_id(
            "mrf",
            &[rule_digest.as_bytes().as_slice(), step_bytes.as_slice()].concat(),
        );
        Self {
            morphism_id,
            kind: kind.into(),
            produced_at_step,
            rule,
            rule_digest,
            applied: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from closure verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClosureError {
    DuplicateMorphism { morphism_id: String },
    UnknownMorphism { morphism_id: String },
    /// The ledger has no commitment at a step the replay needs.
    MissingCommitment { step: u64 },
    /// Target step does not lie after the origin step.
    OriginAfterTarget { origin: u64, target: u64 },
    /// Stimulus history does not cover the replay range.
    MissingStimulus { step: u64 },
}

impl fmt::Display for ClosureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateMorphism { morphism_id } => {
                write!(f, "duplicate morphism: {morphism_id}")
            }
            Self::UnknownMorphism { morphism_id } => {
                write!(f, "unknown morphism: {morphism_id}")
            }
            Self::MissingCommitment { step } => {
                write!(f, "no commitment at step {step} for replay")
            }
            Self::OriginAfterTarget { origin, target } => {
                write!(f, "replay target {target} not after origin {origin}")
            }
            Self::MissingStimulus { step } => {
                write!(f, "no recorded stimulus at step {step}")
            }
        }
    }
}

impl std::error::Error for ClosureError {}

// ---------------------------------------------------------------------------
// ReplayCheck — evidence for one counterfactual replay
// ---------------------------------------------------------------------------

/// Evidence record for one counterfactual replay of one morphism.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayCheck {
    pub morphism_id: String,
    pub origin_step: u64,
    pub target_step: u64,
    pub expected: StateDigest,
    pub observed: StateDigest,
    pub exact_match: bool,
    /// Approximate-equality channel over projection digests.
    pub projection_match: bool,
    pub applied: bool,
}

// ---------------------------------------------------------------------------
// SelfClosureVerifier
// ---------------------------------------------------------------------------

/// Registry of claimed morphisms plus the replay checks run against them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelfClosureVerifier {
    morphisms: BTreeMap<String, MorphismRecord>,
    registration_order: Vec<String>,
    checks: Vec<ReplayCheck>,
}

impl SelfClosureVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registered_count(&self) -> usize {
        self.morphisms.len()
    }

    pub fn checks(&self) -> &[ReplayCheck] {
        &self.checks
    }

    pub fn morphism(&self, morphism_id: &str) -> Option<&MorphismRecord> {
        self.morphisms.get(morphism_id)
    }

    /// Morphisms in registration order.
    pub fn morphisms(&self) -> Vec<&MorphismRecord> {
        self.registration_order
            .iter()
            .filter_map(|id| self.morphisms.get(id))
            .collect()
    }

    /// Record a claimed operator. Duplicate ids are rejected.
    pub fn register(&mut self, morphism: MorphismRecord) -> Result<String, ClosureError> {
        let id = morphism.morphism_id.clone();
        if self.morphisms.contains_key(&id) {
            return Err(ClosureError::DuplicateMorphism { morphism_id: id });
        }
        self.registration_order.push(id.clone());
        self.morphisms.insert(id.clone(), morphism);
        Ok(id)
    }

    /// Whether a morphism was verified applied and originates at or before
    /// `step` — the resolution rule for diagonal citations.
    pub fn is_applied_at(&self, morphism_id: &str, step: u64) -> bool {
        self.morphisms
            .get(morphism_id)
            .map(|m| m.applied && m.produced_at_step <= step)
            .unwrap_or(false)
    }

    /// Counterfactual replay for one morphism against one later step.
    ///
    /// Folds the claimed rule from the committed digest at the origin step
    /// over the delivered stimuli, and compares against the committed
    /// digest at `later_step`. The projection-digest stream provides the
    /// approximate-equality channel.
    pub fn check_applied(
        &mut self,
        morphism_id: &str,
        later_step: u64,
        ledger: &CommitmentLedger,
        delivered_stimuli: &[i64],
        projection_digests: &BTreeMap<u64, StateDigest>,
    ) -> Result<bool, ClosureError> {
        let morphism = self
            .morphisms
            .get(morphism_id)
            .cloned()
            .ok_or_else(|| ClosureError::UnknownMorphism {
                morphism_id: morphism_id.to_string(),
            })?;
        let origin = morphism.produced_at_step;
        if later_step <= origin {
            return Err(ClosureError::OriginAfterTarget {
                origin,
                target: later_step,
            });
        }

        let origin_record = ledger
            .record_at(origin)
            .ok_or(ClosureError::MissingCommitment { step: origin })?;
        let target_record = ledger
            .record_at(later_step)
            .ok_or(ClosureError::MissingCommitment { step: later_step })?;

        let mut expected = origin_record.state_digest;
        for step in (origin + 1)..=later_step {
            let stimulus = *delivered_stimuli
                .get(step as usize)
                .ok_or(ClosureError::MissingStimulus { step })?;
            expected = morphism.rule.apply(&expected, stimulus);
        }
        let observed = target_record.state_digest;
        let exact_match = expected.constant_time_eq(&observed);

        // Approximate channel: the same fold over projection digests.
        let projection_match = match (
            projection_digests.get(&origin),
            projection_digests.get(&later_step),
        ) {
            (Some(origin_projection), Some(target_projection)) => {
                let mut expected_projection = *origin_projection;
                for step in (origin + 1)..=later_step {
                    let stimulus = *delivered_stimuli
                        .get(step as usize)
                        .ok_or(ClosureError::MissingStimulus { step })?;
                    expected_projection = morphism.rule.apply(&expected_projection, stimulus);
                }
                expected_projection.constant_time_eq(target_projection)
            }
            _ => false,
        };

        let applied = exact_match || projection_match;
        self.checks.push(ReplayCheck {
            morphism_id: morphism_id.to_string(),
            origin_step: origin,
            target_step: later_step,
            expected,
            observed,
            exact_match,
            projection_match,
            applied,
        });
        if applied {
            if let Some(m) = self.morphisms.get_mut(morphism_id) {
                m.applied = true;
            }
        }
        Ok(applied)
    }

    /// Replay every registered morphism against its natural target step:
    /// `min(origin + horizon, next_origin - 1, last_step)`. Morphisms with
    /// no room after their origin, or whose replay range lacks commitments
    /// or stimuli (timed-out steps leave ledger gaps), are skipped, not
    /// scored.
    pub fn run_all_checks(
        &mut self,
        ledger: &CommitmentLedger,
        delivered_stimuli: &[i64],
        projection_digests: &BTreeMap<u64, StateDigest>,
        check_horizon: u64,
        last_step: u64,
    ) -> Result<(), ClosureError> {
        let mut origins: Vec<(u64, String)> = self
            .morphisms
            .values()
            .map(|m| (m.produced_at_step, m.morphism_id.clone()))
            .collect();
        origins.sort();

        for (index, (origin, morphism_id)) in origins.iter().enumerate() {
            let next_origin_bound = origins
                .get(index + 1)
                .map(|(next_origin, _)| next_origin.saturating_sub(1))
                .unwrap_or(last_step);
            let target = (origin + check_horizon).min(next_origin_bound).min(last_step);
            if target <= *origin {
                continue;
            }
            match self.check_applied(
                morphism_id,
                target,
                ledger,
                delivered_stimuli,
                projection_digests,
            ) {
                Ok(_) => {}
                Err(ClosureError::MissingCommitment { .. })
                | Err(ClosureError::MissingStimulus { .. }) => continue,
                Err(other) => return Err(other),
            }
        }
        Ok(())
    }

    /// Applied fraction over the checks actually run, in millionths.
    /// `None` when nothing was checkable.
    pub fn closure_score_millionths(&self) -> Option<i64> {
        if self.checks.is_empty() {
            return None;
        }
        let applied = self.checks.iter().filter(|c| c.applied).count() as i64;
        Some(applied * MILLION / self.checks.len() as i64)
    }

    /// Checks whose replay window overlaps `[window_start, window_end]`.
    pub fn checks_in_window(&self, window_start: u64, window_end: u64) -> Vec<&ReplayCheck> {
        self.checks
            .iter()
            .filter(|c| c.origin_step <= window_end && c.target_step >= window_start)
            .collect()
    }
}

// ---------------------------------------------------------------------------
// ClosureWindow — rolling score across sessions
// ---------------------------------------------------------------------------

/// Rolling window of per-session closure scores. A mean under the
/// configured threshold across the window reports `closure_fail`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClosureWindow {
    pub window: usize,
    scores: Vec<i64>,
}

impl ClosureWindow {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            scores: Vec::new(),
        }
    }

    pub fn push(&mut self, score_millionths: i64) {
        self.scores.push(score_millionths);
        if self.scores.len() > self.window {
            self.scores.remove(0);
        }
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    pub fn mean_millionths(&self) -> Option<i64> {
        if self.scores.is_empty() {
            return None;
        }
        Some(self.scores.iter().sum::<i64>() / self.scores.len() as i64)
    }

    pub fn below_threshold(&self, threshold_millionths: i64) -> bool {
        self.mean_millionths()
            .map(|mean| mean < threshold_millionths)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::{salt_commitment, Salt};

    /// Build a ledger whose digests genuinely follow `rule` from step
    /// `origin` onward, and plain hashing before it.
    fn ledger_following_rule(
        rule: &TransitionRule,
        origin: u64,
        last_step: u64,
        stimuli: &[i64],
    ) -> CommitmentLedger {
        let mut ledger = CommitmentLedger::new("engine-a", StateDigest::compute(b"cfg"), 0, 0);
        let salt = Salt([1u8; 32]);
        let mut digest = StateDigest::compute(b"genesis-state");
        for step in 0..=last_step {
            if step > origin {
                digest = rule.apply(&digest, stimuli[step as usize]);
            } else if step > 0 {
                digest = StateDigest::compute_parts(&[b"pre-rule", digest.as_bytes()]);
            }
            let binding = salt_commitment(&salt, &digest, step);
            ledger.commit(step, digest, binding, step).expect("commit");
        }
        ledger
    }

    fn stimuli(n: usize) -> Vec<i64> {
        (0..n).map(|i| (i as i64) * 10_000 - 40_000).collect()
    }

    #[test]
    fn rule_apply_deterministic() {
        let rule = TransitionRule::new(b"gain=0.5".to_vec());
        let from = StateDigest::compute(b"s");
        assert_eq!(rule.apply(&from, 7), rule.apply(&from, 7));
        assert_ne!(rule.apply(&from, 7), rule.apply(&from, 8));
    }

    #[test]
    fn morphism_id_is_content_addressed() {
        let rule = TransitionRule::new(b"r1".to_vec());
        let a = MorphismRecord::derive("gain-retune", 5, rule.clone());
        let b = MorphismRecord::derive("gain-retune", 5, rule.clone());
        let c = MorphismRecord::derive("gain-retune", 6, rule);
        assert_eq!(a.morphism_id, b.morphism_id);
        assert_ne!(a.morphism_id, c.morphism_id);
        assert!(a.morphism_id.starts_with("mrf-"));
        assert!(!a.applied);
    }

    #[test]
    fn register_rejects_duplicates() {
        let mut verifier = SelfClosureVerifier::new();
        let m = MorphismRecord::derive("k", 0, TransitionRule::new(b"r".to_vec()));
        verifier.register(m.clone()).expect("first registration");
        let err = verifier.register(m).expect_err("duplicate");
        assert!(matches!(err, ClosureError::DuplicateMorphism { .. }));
    }

    #[test]
    fn replay_confirms_genuinely_applied_rule() {
        let rule = TransitionRule::new(b"gain-up".to_vec());
        let stimuli = stimuli(20);
        let ledger = ledger_following_rule(&rule, 5, 19, &stimuli);

        let mut verifier = SelfClosureVerifier::new();
        let id = verifier
            .register(MorphismRecord::derive("gain-retune", 5, rule))
            .expect("register");
        let applied = verifier
            .check_applied(&id, 12, &ledger, &stimuli, &BTreeMap::new())
            .expect("check");
        assert!(applied);
        assert!(verifier.morphism(&id).expect("morphism").applied);
        let check = &verifier.checks()[0];
        assert!(check.exact_match);
        assert!(!check.projection_match);
    }

    #[test]
    fn replay_rejects_never_applied_rule() {
        let actual_rule = TransitionRule::new(b"actual".to_vec());
        let claimed_rule = TransitionRule::new(b"claimed-but-unused".to_vec());
        let stimuli = stimuli(20);
        let ledger = ledger_following_rule(&actual_rule, 5, 19, &stimuli);

        let mut verifier = SelfClosureVerifier::new();
        let id = verifier
            .register(MorphismRecord::derive("fake", 5, claimed_rule))
            .expect("register");
        let applied = verifier
            .check_applied(&id, 12, &ledger, &stimuli, &BTreeMap::new())
            .expect("check");
        assert!(!applied);
        assert!(!verifier.morphism(&id).expect("morphism").applied);
    }

    #[test]
    fn approximate_channel_verifies_via_projection_digests() {
        // State digests do NOT follow the rule (continuous-state engine),
        // but the committed projection digests do.
        let rule = TransitionRule::new(b"continuous".to_vec());
        let noise_rule = TransitionRule::new(b"noise".to_vec());
        let stimuli = stimuli(20);
        let ledger = ledger_following_rule(&noise_rule, 5, 19, &stimuli);

        let mut projection_digests = BTreeMap::new();
        let mut projection = StateDigest::compute(b"projection-genesis");
        projection_digests.insert(5u64, projection);
        for step in 6..=12u64 {
            projection = rule.apply(&projection, stimuli[step as usize]);
            projection_digests.insert(step, projection);
        }

        let mut verifier = SelfClosureVerifier::new();
        let id = verifier
            .register(MorphismRecord::derive("continuous", 5, rule))
            .expect("register");
        let applied = verifier
            .check_applied(&id, 12, &ledger, &stimuli, &projection_digests)
            .expect("check");
        assert!(applied);
        let check = &verifier.checks()[0];
        assert!(!check.exact_match);
        assert!(check.projection_match);
    }

    #[test]
    fn check_rejects_target_at_or_before_origin() {
        let rule = TransitionRule::new(b"r".to_vec());
        let stimuli = stimuli(20);
        let ledger = ledger_following_rule(&rule, 5, 19, &stimuli);
        let mut verifier = SelfClosureVerifier::new();
        let id = verifier
            .register(MorphismRecord::derive("k", 5, rule))
            .expect("register");
        let err = verifier
            .check_applied(&id, 5, &ledger, &stimuli, &BTreeMap::new())
            .expect_err("no room");
        assert!(matches!(
            err,
            ClosureError::OriginAfterTarget { origin: 5, target: 5 }
        ));
    }

    #[test]
    fn run_all_checks_scores_mixed_population() {
        // Ledger follows rule_a from step 0; a second claimed rule never
        // governs anything.
        let rule_a = TransitionRule::new(b"rule-a".to_vec());
        let rule_b = TransitionRule::new(b"rule-b-unapplied".to_vec());
        let stimuli = stimuli(30);
        let ledger = ledger_following_rule(&rule_a, 0, 29, &stimuli);

        let mut verifier = SelfClosureVerifier::new();
        verifier
            .register(MorphismRecord::derive("real", 0, rule_a))
            .expect("register real");
        verifier
            .register(MorphismRecord::derive("claimed", 10, rule_b))
            .expect("register claimed");
        verifier
            .run_all_checks(&ledger, &stimuli, &BTreeMap::new(), 9, 29)
            .expect("checks run");

        assert_eq!(verifier.checks().len(), 2);
        assert_eq!(verifier.closure_score_millionths(), Some(MILLION / 2));
    }

    #[test]
    fn closure_score_none_without_checks() {
        let verifier = SelfClosureVerifier::new();
        assert_eq!(verifier.closure_score_millionths(), None);
    }

    #[test]
    fn is_applied_at_respects_origin_and_verification() {
        let rule = TransitionRule::new(b"r".to_vec());
        let stimuli = stimuli(20);
        let ledger = ledger_following_rule(&rule, 5, 19, &stimuli);
        let mut verifier = SelfClosureVerifier::new();
        let id = verifier
            .register(MorphismRecord::derive("k", 5, rule))
            .expect("register");
        assert!(!verifier.is_applied_at(&id, 10));
        verifier
            .check_applied(&id, 12, &ledger, &stimuli, &BTreeMap::new())
            .expect("check");
        assert!(verifier.is_applied_at(&id, 10));
        assert!(verifier.is_applied_at(&id, 5));
        assert!(!verifier.is_applied_at(&id, 4));
        assert!(!verifier.is_applied_at("mrf-0000000000000000", 10));
    }

    #[test]
    fn closure_window_rolls_and_thresholds() {
        let mut window = ClosureWindow::new(3);
        assert!(window.is_empty());
        assert!(!window.below_threshold(600_000));
        window.push(MILLION);
        window.push(MILLION);
        window.push(MILLION);
        assert_eq!(window.mean_millionths(), Some(MILLION));
        assert!(!window.below_threshold(600_000));
        // Rolling: three zero scores push the ones out.
        window.push(0);
        window.push(0);
        window.push(0);
        assert_eq!(window.len(), 3);
        assert_eq!(window.mean_millionths(), Some(0));
        assert!(window.below_threshold(600_000));
    }

    #[test]
    fn replay_is_deterministic_across_runs() {
        let rule = TransitionRule::new(b"replay-twice".to_vec());
        let stimuli = stimuli(20);
        let ledger = ledger_following_rule(&rule, 3, 19, &stimuli);

        let run = || {
            let mut verifier = SelfClosureVerifier::new();
            let id = verifier
                .register(MorphismRecord::derive("k", 3, rule.clone()))
                .expect("register");
            verifier
                .check_applied(&id, 15, &ledger, &stimuli, &BTreeMap::new())
                .expect("check");
            serde_json::to_string(verifier.checks()).expect("serialize")
        };
        assert_eq!(run(), run());
    }
}
