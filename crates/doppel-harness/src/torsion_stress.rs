//! Torsion-stress harness: randomized perturbation with measured rebound.
//!
//! A stress window perturbs the stimulus stream (masking, parameter
//! randomization) or ablates a named internal mechanism. Over the window
//! and a short recovery tail the harness records two scalar traces:
//!
//! - **error**: deviation of the party's output from the task objective,
//! - **coherence**: bounded similarity between successive committed-state
//!   projections.
//!
//! The tested invariant: after stress ends, the error trend must be
//! non-increasing and the coherence trend non-decreasing within K steps,
//! with genuine recovery from the in-window peak. A window that never
//! elevated error is indeterminate, not a pass.
//!
//! All trace arithmetic is integer millionths; a fixed seed reproduces a
//! bit-identical trace.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::rng::Xorshift64;

pub const TORSION_STRESS_SCHEMA_VERSION: &str = "doppel-harness.torsion-stress.v1";

/// Fixed-point scale: 1_000_000 ≡ 1.0.
const MILLION: i64 = 1_000_000;

/// Error cap: traces saturate at 2.0 to keep sums bounded.
const ERROR_CAP_MILLIONTHS: i64 = 2 * MILLION;

/// Minimum in-window error elevation over baseline for the window to have
/// "bitten". Below this the rebound question is indeterminate.
pub const PEAK_EPSILON_MILLIONTHS: i64 = 25_000;

// ---------------------------------------------------------------------------
// Schedule
// ---------------------------------------------------------------------------

/// What a stress window does while active.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PerturbationKind {
    /// Withhold a randomized subset of inputs (delivered as masked).
    MaskInputs { mask_pct: u32 },
    /// Inject seeded noise into the stimulus within a band.
    RandomizeParameters { band_millionths: i64 },
    /// Disable a named internal mechanism for the window.
    AblateCapability { capability: String },
}

impl PerturbationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MaskInputs { .. } => "mask_inputs",
            Self::RandomizeParameters { .. } => "randomize_parameters",
            Self::AblateCapability { .. } => "ablate_capability",
        }
    }
}

impl fmt::Display for PerturbationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One scheduled perturbation window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StressWindow {
    pub kind: PerturbationKind,
    pub onset_step: u64,
    pub duration: u64,
    pub seed: u64,
}

impl StressWindow {
    /// First step after the window (exclusive end).
    pub fn end_step(&self) -> u64 {
        self.onset_step + self.duration
    }

    pub fn contains(&self, step: u64) -> bool {
        step >= self.onset_step && step < self.end_step()
    }
}

/// Schedule of perturbation windows for a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StressSchedule {
    pub windows: Vec<StressWindow>,
}

/// Schedule validation failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScheduleError {
    EmptyWindow { index: usize },
    OverlappingWindows { first: usize, second: usize },
    UnsortedWindows { index: usize },
    MaskPctOutOfRange { index: usize, mask_pct: u32 },
    NegativeBand { index: usize, band_millionths: i64 },
}

impl fmt::Display for ScheduleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyWindow { index } => write!(f, "window {index} has zero duration"),
            Self::OverlappingWindows { first, second } => {
                write!(f, "windows {first} and {second} overlap")
            }
            Self::UnsortedWindows { index } => {
                write!(f, "window {index} starts before its predecessor")
            }
            Self::MaskPctOutOfRange { index, mask_pct } => {
                write!(f, "window {index}: mask_pct {mask_pct} > 100")
            }
            Self::NegativeBand {
                index,
                band_millionths,
            } => write!(f, "window {index}: negative band {band_millionths}"),
        }
    }
}

impl std::error::Error for ScheduleError {}

impl StressSchedule {
    pub fn new(windows: Vec<StressWindow>) -> Self {
        Self { windows }
    }

    pub fn validate(&self) -> Result<(), ScheduleError> {
        for (index, window) in self.windows.iter().enumerate() {
            if window.duration == 0 {
                return Err(ScheduleError::EmptyWindow { index });
            }
            match &window.kind {
                PerturbationKind::MaskInputs { mask_pct } if *mask_pct > 100 => {
                    return Err(ScheduleError::MaskPctOutOfRange {
                        index,
                        mask_pct: *mask_pct,
                    });
                }
                PerturbationKind::RandomizeParameters { band_millionths }
                    if *band_millionths < 0 =>
                {
                    return Err(ScheduleError::NegativeBand {
                        index,
                        band_millionths: *band_millionths,
                    });
                }
                _ => {}
            }
            if index > 0 {
                let prev = &self.windows[index - 1];
                if window.onset_step < prev.onset_step {
                    return Err(ScheduleError::UnsortedWindows { index });
                }
                if window.onset_step < prev.end_step() {
                    return Err(ScheduleError::OverlappingWindows {
                        first: index - 1,
                        second: index,
                    });
                }
            }
        }
        Ok(())
    }

    /// The window active at `step`, if any. Windows never overlap.
    pub fn window_at(&self, step: u64) -> Option<&StressWindow> {
        self.windows.iter().find(|w| w.contains(step))
    }

    /// The capability ablated at `step`, if an ablation window is active.
    pub fn active_ablation(&self, step: u64) -> Option<&str> {
        match self.window_at(step).map(|w| &w.kind) {
            Some(PerturbationKind::AblateCapability { capability }) => Some(capability.as_str()),
            _ => None,
        }
    }

    /// Perturb the raw stimulus for delivery at `step`.
    ///
    /// Returns `None` when the input is masked. Per-step draws are keyed
    /// on `(window.seed, step)` so delivery is independent of call order.
    pub fn deliver(&self, step: u64, raw_millionths: i64) -> Option<i64> {
        let window = match self.window_at(step) {
            Some(w) => w,
            None => return Some(raw_millionths),
        };
        let mut rng = Xorshift64::new(window.seed ^ step.wrapping_mul(0x9e37_79b9_7f4a_7c15));
        match &window.kind {
            PerturbationKind::MaskInputs { mask_pct } => {
                if rng.next_bool(u64::from(*mask_pct)) {
                    None
                } else {
                    Some(raw_millionths)
                }
            }
            PerturbationKind::RandomizeParameters { band_millionths } => {
                let noise = rng.next_i64_range(-band_millionths, *band_millionths);
                Some((raw_millionths + noise).clamp(-ERROR_CAP_MILLIONTHS, ERROR_CAP_MILLIONTHS))
            }
            PerturbationKind::AblateCapability { .. } => Some(raw_millionths),
        }
    }
}

// ---------------------------------------------------------------------------
// Trace scalars
// ---------------------------------------------------------------------------

/// Objective deviation in millionths, saturated at the cap.
pub fn error_millionths(output_millionths: i64, target_millionths: i64) -> i64 {
    (output_millionths - target_millionths)
        .abs()
        .min(ERROR_CAP_MILLIONTHS)
}

/// Bounded similarity between successive projections in millionths.
///
/// `coherence = 1e6 · 1e6 / (1e6 + mean_abs_diff)` — 1.0 for identical
/// projections, decaying toward 0 as they diverge.
pub fn coherence_millionths(prev_projection: &[i64], projection: &[i64]) -> i64 {
    if prev_projection.is_empty() && projection.is_empty() {
        return MILLION;
    }
    let dims = prev_projection.len().max(projection.len());
    let mut total_abs_diff: i64 = 0;
    for i in 0..dims {
        let a = prev_projection.get(i).copied().unwrap_or(0);
        let b = projection.get(i).copied().unwrap_or(0);
        total_abs_diff = total_abs_diff.saturating_add((a - b).abs().min(ERROR_CAP_MILLIONTHS));
    }
    let mean_abs_diff = total_abs_diff / dims as i64;
    MILLION * MILLION / (MILLION + mean_abs_diff)
}

/// One point on the stress trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TracePoint {
    pub step: u64,
    pub error_millionths: i64,
    pub coherence_millionths: i64,
    pub stressed: bool,
}

// ---------------------------------------------------------------------------
// Rebound assessment
// ---------------------------------------------------------------------------

/// Verdict for one window's rebound question.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowOutcome {
    /// Error recovered from the in-window peak within K steps.
    Rebounded,
    /// No measurable self-stabilization in the recovery tail.
    NoRebound,
    /// The window never elevated error, or the tail was truncated.
    Indeterminate,
}

/// Evidence for one window's rebound assessment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReboundAssessment {
    pub onset_step: u64,
    pub end_step: u64,
    pub kind: String,
    /// Capability name when the window was an ablation.
    pub ablated_capability: Option<String>,
    pub baseline_error_millionths: i64,
    pub peak_error_millionths: i64,
    pub tail_end_error_millionths: i64,
    /// Mean coherence while the window was active.
    pub window_coherence_millionths: i64,
    pub error_trend_non_increasing: bool,
    pub coherence_trend_non_decreasing: bool,
    pub recovered_from_peak: bool,
    pub outcome: WindowOutcome,
}

/// Full stress trace for one party in one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StressTrace {
    pub schema_version: String,
    pub party_id: String,
    pub recovery_window_steps: u64,
    pub points: Vec<TracePoint>,
    pub assessments: Vec<ReboundAssessment>,
}

impl StressTrace {
    /// Session-level outcome: any `NoRebound` window fails; all-assessed
    /// rebound passes; otherwise indeterminate.
    pub fn session_outcome(&self) -> WindowOutcome {
        if self
            .assessments
            .iter()
            .any(|a| a.outcome == WindowOutcome::NoRebound)
        {
            return WindowOutcome::NoRebound;
        }
        if self
            .assessments
            .iter()
            .any(|a| a.outcome == WindowOutcome::Rebounded)
        {
            return WindowOutcome::Rebounded;
        }
        WindowOutcome::Indeterminate
    }
}

/// Collects trace points during a run, then assesses each window.
#[derive(Debug, Clone)]
pub struct StressTraceBuilder {
    party_id: String,
    recovery_window_steps: u64,
    points: Vec<TracePoint>,
}

impl StressTraceBuilder {
    pub fn new(party_id: impl Into<String>, recovery_window_steps: u64) -> Self {
        Self {
            party_id: party_id.into(),
            recovery_window_steps,
            points: Vec::new(),
        }
    }

    pub fn record(&mut self, step: u64, error: i64, coherence: i64, stressed: bool) {
        self.points.push(TracePoint {
            step,
            error_millionths: error,
            coherence_millionths: coherence,
            stressed,
        });
    }

    pub fn finalize(self, schedule: &StressSchedule) -> StressTrace {
        let assessments = schedule
            .windows
            .iter()
            .map(|window| assess_window(&self.points, window, self.recovery_window_steps))
            .collect();
        StressTrace {
            schema_version: TORSION_STRESS_SCHEMA_VERSION.to_string(),
            party_id: self.party_id,
            recovery_window_steps: self.recovery_window_steps,
            points: self.points,
            assessments,
        }
    }
}

/// Mean of an i64 slice; zero for empty input.
fn mean(values: &[i64]) -> i64 {
    if values.is_empty() {
        return 0;
    }
    values.iter().sum::<i64>() / values.len() as i64
}

/// Split-halves trend test: non-increasing means the second half's mean
/// does not exceed the first half's.
fn trend_non_increasing(values: &[i64]) -> bool {
    if values.len() < 2 {
        return true;
    }
    let mid = values.len() / 2;
    mean(&values[mid..]) <= mean(&values[..mid])
}

fn trend_non_decreasing(values: &[i64]) -> bool {
    if values.len() < 2 {
        return true;
    }
    let mid = values.len() / 2;
    mean(&values[mid..]) >= mean(&values[..mid])
}

fn assess_window(
    points: &[TracePoint],
    window: &StressWindow,
    recovery_window_steps: u64,
) -> ReboundAssessment {
    let ablated_capability = match &window.kind {
        PerturbationKind::AblateCapability { capability } => Some(capability.clone()),
        _ => None,
    };

    let point_at = |step: u64| points.iter().find(|p| p.step == step);

    // Baseline: the window-length run-up before onset.
    let baseline_start = window.onset_step.saturating_sub(window.duration);
    let baseline: Vec<i64> = (baseline_start..window.onset_step)
        .filter_map(|s| point_at(s).map(|p| p.error_millionths))
        .collect();
    let baseline_error = mean(&baseline);

    // Peak: worst error inside the window; mean coherence while stressed.
    let in_window: Vec<&TracePoint> = (window.onset_step..window.end_step())
        .filter_map(point_at)
        .collect();
    let peak_error = in_window
        .iter()
        .map(|p| p.error_millionths)
        .max()
        .unwrap_or(0);
    let window_coherence: Vec<i64> = in_window.iter().map(|p| p.coherence_millionths).collect();
    let window_coherence_mean = mean(&window_coherence);

    // Recovery tail: K steps after the window.
    let tail_points: Vec<&TracePoint> = (window.end_step()
        ..window.end_step() + recovery_window_steps)
        .filter_map(point_at)
        .collect();
    let tail_errors: Vec<i64> = tail_points.iter().map(|p| p.error_millionths).collect();
    let tail_coherence: Vec<i64> = tail_points.iter().map(|p| p.coherence_millionths).collect();
    let tail_end_error = tail_errors.last().copied().unwrap_or(peak_error);

    let error_trend_non_increasing = trend_non_increasing(&tail_errors);
    // Coherence recovers either within the tail or relative to the
    // stressed window itself.
    let coherence_trend_non_decreasing = trend_non_decreasing(&tail_coherence)
        || mean(&tail_coherence) >= window_coherence_mean;
    let recovered_from_peak = tail_end_error <= peak_error / 2;

    let tail_truncated = (tail_points.len() as u64) < recovery_window_steps;
    let stress_bit = peak_error >= baseline_error + PEAK_EPSILON_MILLIONTHS;

    let outcome = if tail_truncated || !stress_bit {
        WindowOutcome::Indeterminate
    } else if error_trend_non_increasing && coherence_trend_non_decreasing && recovered_from_peak {
        WindowOutcome::Rebounded
    } else {
        WindowOutcome::NoRebound
    };

    ReboundAssessment {
        onset_step: window.onset_step,
        end_step: window.end_step(),
        kind: window.kind.as_str().to_string(),
        ablated_capability,
        baseline_error_millionths: baseline_error,
        peak_error_millionths: peak_error,
        tail_end_error_millionths: tail_end_error,
        window_coherence_millionths: window_coherence_mean,
        error_trend_non_increasing,
        coherence_trend_non_decreasing,
        recovered_from_peak,
        outcome,
    }
}

// ---------------------------------------------------------------------------
// Seed-population summary
// ---------------------------------------------------------------------------

/// Rebound statistics across the seed population of a campaign.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReboundSummary {
    pub seeds_total: usize,
    /// Seeds with a determinate outcome (the quorum denominator).
    pub seeds_assessed: usize,
    pub seeds_rebounded: usize,
    pub quorum_millionths: i64,
    pub fraction_millionths: i64,
    pub pass: bool,
}

impl ReboundSummary {
    pub fn from_outcomes(outcomes: &[WindowOutcome], quorum_millionths: i64) -> Self {
        let seeds_total = outcomes.len();
        let assessed: Vec<&WindowOutcome> = outcomes
            .iter()
            .filter(|o| **o != WindowOutcome::Indeterminate)
            .collect();
        let seeds_assessed = assessed.len();
        let seeds_rebounded = assessed
            .iter()
            .filter(|o| ***o == WindowOutcome::Rebounded)
            .count();
        let fraction_millionths = if seeds_assessed == 0 {
            0
        } else {
            seeds_rebounded as i64 * MILLION / seeds_assessed as i64
        };
        let pass = seeds_assessed > 0 && fraction_millionths >= quorum_millionths;
        Self {
            seeds_total,
            seeds_assessed,
            seeds_rebounded,
            quorum_millionths,
            fraction_millionths,
            pass,
        }
    }
}
