//! MDL margin estimation.
//!
//! `margin = MDL(transcript | public_interface) − MDL(description + ledger)`,
//! with an off-the-shelf general-purpose compressor (DEFLATE via flate2)
//! standing in for the uncomputable true MDL. The first operand is the
//! description length an external tracker actually needs: when a
//! behavior-matching challenger exists, its own description is that
//! tracker; otherwise the raw transcript is the best external
//! reproduction available.
//!
//! A sustained positive margin across a rolling window supports the claim
//! that tracking the engine requires carrying comparable internal
//! structure; a challenger that matches behavior with a strictly smaller
//! description disproves the separation claim for the session.
//!
//! Margins are directional evidence, not proof — every assessment carries
//! [`MDL_PROXY_NOTE`] verbatim so the caveat survives into reports.

use std::io::Write;

use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};

pub const MDL_SCHEMA_VERSION: &str = "doppel-harness.mdl-margin.v1";

/// Caveat attached to every assessment.
pub const MDL_PROXY_NOTE: &str =
    "general-purpose compression proxy for MDL; directional evidence, not proof";

/// Fixed-point scale: 1_000_000 ≡ 1.0.
const MILLION: i64 = 1_000_000;

/// Outputs within this distance count as behaviorally matching a step.
pub const OUTPUT_MATCH_TOLERANCE_MILLIONTHS: i64 = 1_000;

// ---------------------------------------------------------------------------
// Transcript
// ---------------------------------------------------------------------------

/// One step of the externally visible behavior transcript.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub step: u64,
    /// Delivered stimulus; `None` when masked.
    pub stimulus_millionths: Option<i64>,
    pub output_millionths: i64,
}

/// Canonical bytes of a transcript for compression.
pub fn canonical_transcript_bytes(entries: &[TranscriptEntry]) -> Vec<u8> {
    serde_json::to_vec(entries).expect("transcript serialization is infallible")
}

// ---------------------------------------------------------------------------
// Compression proxy
// ---------------------------------------------------------------------------

/// DEFLATE length of the input at best compression. Falls back to the raw
/// length if the encoder fails (it cannot for in-memory sinks).
pub fn compressed_len(bytes: &[u8]) -> usize {
    let mut encoder = ZlibEncoder::new(
        Vec::with_capacity(bytes.len() / 2 + 64),
        Compression::best(),
    );
    if encoder.write_all(bytes).is_err() {
        return bytes.len();
    }
    match encoder.finish() {
        Ok(out) => out.len(),
        Err(_) => bytes.len(),
    }
}

/// Raw and compressed length of one description-length operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MdlEstimate {
    pub raw_len: usize,
    pub compressed_len: usize,
}

impl MdlEstimate {
    pub fn of(bytes: &[u8]) -> Self {
        Self {
            raw_len: bytes.len(),
            compressed_len: compressed_len(bytes),
        }
    }
}

// ---------------------------------------------------------------------------
// Behavior match
// ---------------------------------------------------------------------------

/// Fraction of steps where the challenger's output tracks the engine's,
/// in millionths. Compared over the common prefix.
pub fn behavior_match_millionths(
    engine: &[TranscriptEntry],
    challenger: &[TranscriptEntry],
) -> i64 {
    let steps = engine.len().min(challenger.len());
    if steps == 0 {
        return 0;
    }
    let matched = engine
        .iter()
        .zip(challenger.iter())
        .filter(|(e, c)| {
            (e.output_millionths - c.output_millionths).abs() <= OUTPUT_MATCH_TOLERANCE_MILLIONTHS
        })
        .count();
    matched as i64 * MILLION / steps as i64
}

// ---------------------------------------------------------------------------
// Assessment
// ---------------------------------------------------------------------------

/// Full MDL evidence for one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MdlAssessment {
    pub schema_version: String,
    /// Compressed behavior transcript given only the public interface.
    pub engine_transcript: MdlEstimate,
    /// Compressed engine description plus its full ledger.
    pub engine_description: MdlEstimate,
    pub challenger_transcript: Option<MdlEstimate>,
    pub challenger_description: Option<MdlEstimate>,
    /// External tracking cost minus `C(engine description + ledger)`, in
    /// bytes. The external operand is the matching challenger's
    /// description when one exists, else the compressed transcript.
    pub margin_bytes: i64,
    /// Challenger/engine behavior agreement, when a challenger ran.
    pub behavior_match_millionths: Option<i64>,
    /// True when a behavior-matching challenger has a strictly smaller
    /// description than the engine's description plus ledger.
    pub separation_disproved: bool,
    pub proxy_note: String,
}

/// Estimate the session's MDL evidence.
///
/// `engine_description_bytes` must already include the serialized ledger —
/// the engine's side of the equation is description *plus* audit trail.
pub fn assess(
    engine_transcript: &[TranscriptEntry],
    engine_description_bytes: &[u8],
    challenger: Option<(&[TranscriptEntry], &[u8])>,
    behavior_match_threshold_millionths: i64,
) -> MdlAssessment {
    let transcript_estimate = MdlEstimate::of(&canonical_transcript_bytes(engine_transcript));
    let description_estimate = MdlEstimate::of(engine_description_bytes);
    let mut margin_bytes =
        transcript_estimate.compressed_len as i64 - description_estimate.compressed_len as i64;

    let mut challenger_transcript = None;
    let mut challenger_description = None;
    let mut behavior_match = None;
    let mut separation_disproved = false;

    if let Some((challenger_entries, challenger_description_bytes)) = challenger {
        let ct = MdlEstimate::of(&canonical_transcript_bytes(challenger_entries));
        let cd = MdlEstimate::of(challenger_description_bytes);
        let matched = behavior_match_millionths(engine_transcript, challenger_entries);
        if matched >= behavior_match_threshold_millionths {
            // A matching challenger IS an external tracker: its
            // description length replaces the transcript operand.
            margin_bytes =
                cd.compressed_len as i64 - description_estimate.compressed_len as i64;
            separation_disproved = margin_bytes < 0;
        }
        challenger_transcript = Some(ct);
        challenger_description = Some(cd);
        behavior_match = Some(matched);
    }

    MdlAssessment {
        schema_version: MDL_SCHEMA_VERSION.to_string(),
        engine_transcript: transcript_estimate,
        engine_description: description_estimate,
        challenger_transcript,
        challenger_description,
        margin_bytes,
        behavior_match_millionths: behavior_match,
        separation_disproved,
        proxy_note: MDL_PROXY_NOTE.to_string(),
    }
}

// ---------------------------------------------------------------------------
// MdlWindow — rolling margin sign
// ---------------------------------------------------------------------------

/// Rolling window of per-session margins. "Sustained positive" means
/// every margin in a full window is positive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MdlWindow {
    pub window: usize,
    margins: Vec<i64>,
}

impl MdlWindow {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            margins: Vec::new(),
        }
    }

    pub fn push(&mut self, margin_bytes: i64) {
        self.margins.push(margin_bytes);
        if self.margins.len() > self.window {
            self.margins.remove(0);
        }
    }

    pub fn len(&self) -> usize {
        self.margins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.margins.is_empty()
    }

    pub fn mean_bytes(&self) -> Option<i64> {
        if self.margins.is_empty() {
            return None;
        }
        Some(self.margins.iter().sum::<i64>() / self.margins.len() as i64)
    }

    pub fn sustained_positive(&self) -> bool {
        !self.margins.is_empty() && self.margins.iter().all(|m| *m > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transcript(n: u64, output_of: impl Fn(u64) -> i64) -> Vec<TranscriptEntry> {
        (0..n)
            .map(|step| TranscriptEntry {
                step,
                stimulus_millionths: Some(step as i64 * 10_000),
                output_millionths: output_of(step),
            })
            .collect()
    }

    #[test]
    fn compression_shrinks_redundant_input() {
        let redundant = vec![b'a'; 10_000];
        assert!(compressed_len(&redundant) < 200);
    }

    #[test]
    fn compression_cannot_shrink_high_entropy_much() {
        // Xorshift output is effectively incompressible for DEFLATE.
        let mut rng = crate::rng::Xorshift64::new(7);
        let mut noise = Vec::with_capacity(8_192);
        for _ in 0..1_024 {
            noise.extend_from_slice(&rng.next_u64().to_le_bytes());
        }
        assert!(compressed_len(&noise) > noise.len() * 9 / 10);
    }

    #[test]
    fn behavior_match_exact_and_tolerance() {
        let engine = transcript(10, |s| s as i64 * 1_000);
        let same = transcript(10, |s| s as i64 * 1_000);
        assert_eq!(behavior_match_millionths(&engine, &same), MILLION);

        let near = transcript(10, |s| s as i64 * 1_000 + OUTPUT_MATCH_TOLERANCE_MILLIONTHS);
        assert_eq!(behavior_match_millionths(&engine, &near), MILLION);

        let off = transcript(10, |s| s as i64 * 1_000 + 50_000);
        assert_eq!(behavior_match_millionths(&engine, &off), 0);
    }

    #[test]
    fn behavior_match_empty_is_zero() {
        assert_eq!(behavior_match_millionths(&[], &[]), 0);
    }

    #[test]
    fn matching_smaller_challenger_disproves_separation() {
        let engine = transcript(100, |s| (s as i64 % 7) * 100_000);
        // Padded, incompressible engine description.
        let mut rng = crate::rng::Xorshift64::new(3);
        let mut engine_description = Vec::new();
        for _ in 0..4_096 {
            engine_description.extend_from_slice(&rng.next_u64().to_le_bytes());
        }
        // Tiny challenger that reproduces the behavior exactly.
        let challenger = engine.clone();
        let challenger_description = b"output = (step % 7) * 0.1".to_vec();

        let assessment = assess(
            &engine,
            &engine_description,
            Some((&challenger, &challenger_description)),
            900_000,
        );
        assert!(assessment.separation_disproved);
        assert_eq!(assessment.behavior_match_millionths, Some(MILLION));
        assert_eq!(assessment.proxy_note, MDL_PROXY_NOTE);
    }

    #[test]
    fn non_matching_challenger_never_disproves() {
        let engine = transcript(100, |s| (s as i64 % 7) * 100_000);
        let challenger = transcript(100, |_| 0);
        let assessment = assess(
            &engine,
            &vec![0xAB; 4_096],
            Some((&challenger, b"tiny".as_slice())),
            900_000,
        );
        assert!(!assessment.separation_disproved);
    }

    #[test]
    fn padded_challenger_never_disproves() {
        let engine = transcript(100, |s| (s as i64 % 7) * 100_000);
        let challenger = engine.clone();
        // Challenger description padded with incompressible noise beyond
        // any plausible engine description.
        let mut rng = crate::rng::Xorshift64::new(5);
        let mut padded = Vec::new();
        for _ in 0..16_384 {
            padded.extend_from_slice(&rng.next_u64().to_le_bytes());
        }
        let assessment = assess(
            &engine,
            b"lean engine description".as_slice(),
            Some((&challenger, &padded)),
            900_000,
        );
        assert!(!assessment.separation_disproved);
        // A matching but fatter tracker yields a positive margin.
        assert!(assessment.margin_bytes > 0);
    }

    #[test]
    fn margin_sign_tracks_description_size() {
        let engine = transcript(200, |s| {
            // Structured but non-trivial output stream.
            ((s as i64).pow(2) % 997) * 1_000
        });
        let lean = assess(&engine, b"tiny description".as_slice(), None, 900_000);
        assert!(lean.margin_bytes > 0);

        let mut rng = crate::rng::Xorshift64::new(11);
        let mut huge = Vec::new();
        for _ in 0..65_536 {
            huge.extend_from_slice(&rng.next_u64().to_le_bytes());
        }
        let padded = assess(&engine, &huge, None, 900_000);
        assert!(padded.margin_bytes < 0);
    }

    #[test]
    fn mdl_window_sustained_positive() {
        let mut window = MdlWindow::new(3);
        assert!(!window.sustained_positive());
        window.push(100);
        window.push(250);
        window.push(90);
        assert!(window.sustained_positive());
        assert_eq!(window.mean_bytes(), Some((100 + 250 + 90) / 3));
        window.push(-5);
        assert!(!window.sustained_positive());
        // Rolls: three positives push the negative out.
        window.push(10);
        window.push(10);
        window.push(10);
        assert!(window.sustained_positive());
        assert_eq!(window.len(), 3);
    }

    #[test]
    fn assessment_serialization_round_trip() {
        let engine = transcript(10, |s| s as i64);
        let assessment = assess(&engine, b"desc".as_slice(), None, 900_000);
        let json = serde_json::to_string(&assessment).expect("serialize");
        let restored: MdlAssessment = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(assessment, restored);
    }
}
