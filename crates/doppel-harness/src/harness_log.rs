//! Structured log events for the harness.
//!
//! Every anomaly and phase transition emits a [`HarnessEvent`] with the
//! full correlation key set (session, seed, step, party, component), so a
//! session's event stream reads as an audit trail on its own. Events are
//! collected in the session and exported with it; nothing secret (salts
//! before reveal) is ever placed in an event.

use serde::{Deserialize, Serialize};

pub const LOG_EVENT_SCHEMA_VERSION: &str = "doppel-harness.log-event.v1";

/// Required correlation fields of every event.
pub const REQUIRED_CORRELATION_FIELDS: [&str; 4] =
    ["session_id", "seed", "component", "event"];

/// One structured log event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarnessEvent {
    pub schema_version: String,
    pub session_id: String,
    pub seed: u64,
    pub step: Option<u64>,
    pub party_id: Option<String>,
    pub component: String,
    pub event: String,
    pub outcome: String,
    pub error_code: Option<String>,
}

impl HarnessEvent {
    pub fn new(
        session_id: impl Into<String>,
        seed: u64,
        component: impl Into<String>,
        event: impl Into<String>,
        outcome: impl Into<String>,
    ) -> Self {
        Self {
            schema_version: LOG_EVENT_SCHEMA_VERSION.to_string(),
            session_id: session_id.into(),
            seed,
            step: None,
            party_id: None,
            component: component.into(),
            event: event.into(),
            outcome: outcome.into(),
            error_code: None,
        }
    }

    pub fn at_step(mut self, step: u64) -> Self {
        self.step = Some(step);
        self
    }

    pub fn for_party(mut self, party_id: impl Into<String>) -> Self {
        self.party_id = Some(party_id.into());
        self
    }

    pub fn with_error_code(mut self, error_code: impl Into<String>) -> Self {
        self.error_code = Some(error_code.into());
        self
    }

    /// One JSONL line for export.
    pub fn to_json_line(&self) -> String {
        serde_json::to_string(self).expect("event serialization is infallible")
    }

    /// Validate the correlation contract: no required field empty.
    pub fn validate(&self) -> Result<(), String> {
        if self.schema_version != LOG_EVENT_SCHEMA_VERSION {
            return Err(format!(
                "schema_version `{}` != expected `{LOG_EVENT_SCHEMA_VERSION}`",
                self.schema_version
            ));
        }
        for (name, value) in [
            ("session_id", &self.session_id),
            ("component", &self.component),
            ("event", &self.event),
            ("outcome", &self.outcome),
        ] {
            if value.trim().is_empty() {
                return Err(format!("{name} must not be empty"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> HarnessEvent {
        HarnessEvent::new("ses-0011223344556677", 42, "commitment_ledger", "reveal", "deferred")
            .at_step(17)
            .for_party("engine-a")
            .with_error_code("incomplete")
    }

    #[test]
    fn builder_populates_fields() {
        let event = sample();
        assert_eq!(event.step, Some(17));
        assert_eq!(event.party_id.as_deref(), Some("engine-a"));
        assert_eq!(event.error_code.as_deref(), Some("incomplete"));
        event.validate().expect("valid event");
    }

    #[test]
    fn validation_rejects_empty_required_fields() {
        let mut event = sample();
        event.component = "  ".to_string();
        assert!(event.validate().is_err());
    }

    #[test]
    fn validation_rejects_wrong_schema() {
        let mut event = sample();
        event.schema_version = "other.v1".to_string();
        assert!(event.validate().is_err());
    }

    #[test]
    fn json_line_round_trip() {
        let event = sample();
        let line = event.to_json_line();
        assert!(!line.contains('\n'));
        let restored: HarnessEvent = serde_json::from_str(&line).expect("deserialize");
        assert_eq!(event, restored);
    }
}
