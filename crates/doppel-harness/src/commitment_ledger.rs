//! Append-only, hash-chained commitment ledger.
//!
//! One ledger per party per session. Each record binds a salted commitment
//! to a state digest at a step boundary; the chain additionally commits to
//! the previous record's hash, so altering any past record invalidates
//! every subsequent link. The genesis link is the protocol-config digest:
//! the published configuration is committed before the first step and
//! cannot be adjusted post hoc without breaking the chain.
//!
//! Reveal is strictly ordered after commit with a configured minimum tick
//! delay. A reveal that fails salt verification taints the session
//! permanently; a deferred reveal is budgeted, not fatal.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::digest::{verify_salt, Salt, StateDigest};

pub const COMMITMENT_LEDGER_SCHEMA_VERSION: &str = "doppel-harness.commitment-ledger.v1";

// ---------------------------------------------------------------------------
// CommitmentRecord / RevealRecord
// ---------------------------------------------------------------------------

/// A single commitment in the chain. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitmentRecord {
    pub step: u64,
    pub party_id: String,
    /// Digest of the party's opaque state snapshot at this step.
    pub state_digest: StateDigest,
    /// Hide-then-reveal binding of the party's secret salt.
    pub salt_commitment: StateDigest,
    /// Chain hash of the previous record (genesis: protocol-config digest).
    pub prev_chain_hash: StateDigest,
    /// Hash over this record's fields, linking the chain forward.
    pub chain_hash: StateDigest,
    /// Virtual timestamp of the append.
    pub timestamp_ticks: u64,
}

impl CommitmentRecord {
    /// Recompute this record's chain hash from its own fields.
    fn compute_chain_hash(&self) -> StateDigest {
        StateDigest::compute_parts(&[
            b"doppel.commitment-record.v1",
            &self.step.to_le_bytes(),
            self.party_id.as_bytes(),
            self.state_digest.as_bytes(),
            self.salt_commitment.as_bytes(),
            self.prev_chain_hash.as_bytes(),
            &self.timestamp_ticks.to_le_bytes(),
        ])
    }
}

/// How a party's reveal obligations ended for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevealStatus {
    /// Every commitment revealed without deferral.
    Complete,
    /// Deferred within budget; soft finding only.
    Incomplete,
    /// Defer budget exhausted; scored as failure.
    Failed,
}

impl RevealStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Complete => "complete",
            Self::Incomplete => "incomplete",
            Self::Failed => "failed",
        }
    }
}

/// Outcome of one reveal attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RevealOutcome {
    /// Salt disclosed and verified against the commitment.
    Verified,
    /// Party declined disclosure this round. Budgeted.
    Deferred {
        defer_count: u32,
        budget_exhausted: bool,
    },
    /// Salt disclosed but did not verify. Session is now tainted.
    Mismatch,
}

/// The reveal for a prior commitment, recorded whether or not it verified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevealRecord {
    pub step: u64,
    pub salt: Option<Salt>,
    pub verified: bool,
    pub timestamp_ticks: u64,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from ledger append/reveal operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerError {
    /// Commits must arrive in strictly increasing step order.
    NonMonotonicStep { step: u64, last_step: u64 },
    /// No commitment exists at the requested step.
    UnknownStep { step: u64 },
    /// Reveal attempted before the configured minimum delay elapsed.
    RevealBeforeDelay {
        step: u64,
        earliest_tick: u64,
        now_tick: u64,
    },
    /// Reveal already recorded for this step.
    AlreadyRevealed { step: u64 },
    /// The session was tainted by a prior integrity violation.
    SessionTainted,
}

impl fmt::Display for LedgerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NonMonotonicStep { step, last_step } => {
                write!(f, "non-monotonic commit: step {step} after {last_step}")
            }
            Self::UnknownStep { step } => write!(f, "no commitment at step {step}"),
            Self::RevealBeforeDelay {
                step,
                earliest_tick,
                now_tick,
            } => write!(
                f,
                "reveal for step {step} at tick {now_tick} before earliest tick {earliest_tick}"
            ),
            Self::AlreadyRevealed { step } => write!(f, "step {step} already revealed"),
            Self::SessionTainted => write!(f, "ledger tainted by integrity violation"),
        }
    }
}

impl std::error::Error for LedgerError {}

/// Chain verification failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChainIntegrityError {
    /// A record's stored chain hash does not match its recomputed hash.
    RecordHashMismatch {
        step: u64,
        expected: StateDigest,
        computed: StateDigest,
    },
    /// A record's prev link does not match the preceding record's hash.
    ChainLinkBroken {
        step: u64,
        expected_prev: StateDigest,
        actual_prev: StateDigest,
    },
    /// Steps are not strictly increasing.
    NonMonotonicStep { step: u64, prev_step: u64 },
    /// A verified reveal no longer verifies against its commitment.
    RevealInvalidated { step: u64 },
}

impl fmt::Display for ChainIntegrityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RecordHashMismatch { step, .. } => {
                write!(f, "record at step {step}: chain hash mismatch")
            }
            Self::ChainLinkBroken { step, .. } => {
                write!(f, "record at step {step}: chain link broken")
            }
            Self::NonMonotonicStep { step, prev_step } => {
                write!(f, "non-monotonic: step {step} after {prev_step}")
            }
            Self::RevealInvalidated { step } => {
                write!(f, "reveal at step {step} no longer verifies")
            }
        }
    }
}

impl std::error::Error for ChainIntegrityError {}

// ---------------------------------------------------------------------------
// CommitmentLedger
// ---------------------------------------------------------------------------

/// Append-only commitment ledger for one party in one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitmentLedger {
    pub schema_version: String,
    pub party_id: String,
    /// Genesis chain link: digest of the committed protocol config.
    pub genesis_link: StateDigest,
    pub reveal_delay_ticks: u64,
    pub max_defer_count: u32,
    records: Vec<CommitmentRecord>,
    reveals: BTreeMap<u64, RevealRecord>,
    defer_count: u32,
    tainted: bool,
}

impl CommitmentLedger {
    pub fn new(
        party_id: impl Into<String>,
        genesis_link: StateDigest,
        reveal_delay_ticks: u64,
        max_defer_count: u32,
    ) -> Self {
        Self {
            schema_version: COMMITMENT_LEDGER_SCHEMA_VERSION.to_string(),
            party_id: party_id.into(),
            genesis_link,
            reveal_delay_ticks,
            max_defer_count,
            records: Vec::new(),
            reveals: BTreeMap::new(),
            defer_count: 0,
            tainted: false,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn is_tainted(&self) -> bool {
        self.tainted
    }

    pub fn defer_count(&self) -> u32 {
        self.defer_count
    }

    pub fn records(&self) -> &[CommitmentRecord] {
        &self.records
    }

    /// The most recent `n` records, oldest first.
    pub fn tail(&self, n: usize) -> &[CommitmentRecord] {
        let start = self.records.len().saturating_sub(n);
        &self.records[start..]
    }

    pub fn record_at(&self, step: u64) -> Option<&CommitmentRecord> {
        self.records.iter().find(|r| r.step == step)
    }

    pub fn reveal_at(&self, step: u64) -> Option<&RevealRecord> {
        self.reveals.get(&step)
    }

    /// The state digest at `step`, only if its reveal verified.
    pub fn revealed_digest(&self, step: u64) -> Option<StateDigest> {
        let reveal = self.reveals.get(&step)?;
        if !reveal.verified {
            return None;
        }
        self.record_at(step).map(|r| r.state_digest)
    }

    /// Append a commitment. Serialized by step index: steps must be
    /// strictly increasing within this ledger.
    pub fn commit(
        &mut self,
        step: u64,
        state_digest: StateDigest,
        salt_commitment: StateDigest,
        now_ticks: u64,
    ) -> Result<&CommitmentRecord, LedgerError> {
        if self.tainted {
            return Err(LedgerError::SessionTainted);
        }
        if let Some(last) = self.records.last() {
            if step <= last.step {
                return Err(LedgerError::NonMonotonicStep {
                    step,
                    last_step: last.step,
                });
            }
        }
        let prev_chain_hash = self
            .records
            .last()
            .map(|r| r.chain_hash)
            .unwrap_or(self.genesis_link);

        let mut record = CommitmentRecord {
            step,
            party_id: self.party_id.clone(),
            state_digest,
            salt_commitment,
            prev_chain_hash,
            chain_hash: StateDigest::ZERO,
            timestamp_ticks: now_ticks,
        };
        record.chain_hash = record.compute_chain_hash();
        self.records.push(record);
        Ok(self.records.last().expect("record just pushed"))
    }

    /// Record a reveal attempt for a committed step.
    ///
    /// `salt = None` is a deferral: budgeted against `max_defer_count`.
    /// A disclosed salt that fails verification taints the ledger — the
    /// caller must escalate to a fatal integrity violation.
    pub fn reveal(
        &mut self,
        step: u64,
        salt: Option<Salt>,
        now_ticks: u64,
    ) -> Result<RevealOutcome, LedgerError> {
        if self.tainted {
            return Err(LedgerError::SessionTainted);
        }
        let record = self
            .records
            .iter()
            .find(|r| r.step == step)
            .cloned()
            .ok_or(LedgerError::UnknownStep { step })?;

        let earliest_tick = record.timestamp_ticks + self.reveal_delay_ticks;
        if now_ticks < earliest_tick {
            return Err(LedgerError::RevealBeforeDelay {
                step,
                earliest_tick,
                now_tick: now_ticks,
            });
        }
        if self.reveals.contains_key(&step) {
            return Err(LedgerError::AlreadyRevealed { step });
        }

        match salt {
            None => {
                self.defer_count += 1;
                Ok(RevealOutcome::Deferred {
                    defer_count: self.defer_count,
                    budget_exhausted: self.defer_count > self.max_defer_count,
                })
            }
            Some(salt) => {
                let verified =
                    verify_salt(&record.salt_commitment, &salt, &record.state_digest, step);
                self.reveals.insert(
                    step,
                    RevealRecord {
                        step,
                        salt: Some(salt),
                        verified,
                        timestamp_ticks: now_ticks,
                    },
                );
                if verified {
                    Ok(RevealOutcome::Verified)
                } else {
                    self.tainted = true;
                    Ok(RevealOutcome::Mismatch)
                }
            }
        }
    }

    /// Steps committed but never successfully revealed.
    pub fn unrevealed_steps(&self) -> Vec<u64> {
        self.records
            .iter()
            .map(|r| r.step)
            .filter(|step| !self.reveals.get(step).map(|r| r.verified).unwrap_or(false))
            .collect()
    }

    /// Recompute every link in the chain, and re-verify every disclosed
    /// salt. Mutating any appended record invalidates all later links.
    pub fn verify_chain(&self) -> Result<(), ChainIntegrityError> {
        let mut prev_hash = self.genesis_link;
        let mut prev_step: Option<u64> = None;
        for record in &self.records {
            if let Some(prev) = prev_step {
                if record.step <= prev {
                    return Err(ChainIntegrityError::NonMonotonicStep {
                        step: record.step,
                        prev_step: prev,
                    });
                }
            }
            if record.prev_chain_hash != prev_hash {
                return Err(ChainIntegrityError::ChainLinkBroken {
                    step: record.step,
                    expected_prev: prev_hash,
                    actual_prev: record.prev_chain_hash,
                });
            }
            let computed = record.compute_chain_hash();
            if computed != record.chain_hash {
                return Err(ChainIntegrityError::RecordHashMismatch {
                    step: record.step,
                    expected: record.chain_hash,
                    computed,
                });
            }
            prev_hash = record.chain_hash;
            prev_step = Some(record.step);
        }
        for (step, reveal) in &self.reveals {
            if !reveal.verified {
                continue;
            }
            let record = self
                .record_at(*step)
                .ok_or(ChainIntegrityError::RevealInvalidated { step: *step })?;
            let salt = reveal
                .salt
                .ok_or(ChainIntegrityError::RevealInvalidated { step: *step })?;
            if !verify_salt(&record.salt_commitment, &salt, &record.state_digest, *step) {
                return Err(ChainIntegrityError::RevealInvalidated { step: *step });
            }
        }
        Ok(())
    }

    /// Test-only access for the tamper-evidence property tests.
    #[doc(hidden)]
    pub fn records_mut_for_tamper_tests(&mut self) -> &mut Vec<CommitmentRecord> {
        &mut self.records
    }
}
