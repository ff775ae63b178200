use crate::types::{ReportId, ReportStatus};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AuditGraphError {
    /// The generation collaborator kept failing (or returned empty text) after all retries.
    #[error("generation failed for agent '{agent}' after {attempts} attempts: {message}")]
    GenerationFailure {
        agent: String,
        attempts: u32,
        message: String,
        degraded_sections: Vec<String>,
    },

    /// A malformed rule or an unparsable section. Never a compliance violation.
    #[error("validation failure in rule '{rule_id}': {message}")]
    ValidationFailure { rule_id: String, message: String },

    #[error("unresolved citation '{citation}': {message}")]
    CitationResolution { citation: String, message: String },

    #[error(
        "cannot {transition} report in state '{current}': requires state {}",
        join_states(.required)
    )]
    StateTransition {
        transition: &'static str,
        current: ReportStatus,
        required: Vec<ReportStatus>,
    },

    #[error("graph integrity violation: {0}")]
    GraphIntegrity(String),

    #[error("quorum not reached: {succeeded} of {attempted} samples succeeded, {required} required")]
    QuorumNotReached {
        required: usize,
        succeeded: usize,
        attempted: usize,
    },

    #[error("deadline exceeded during {0}")]
    DeadlineExceeded(String),

    #[error("approval blocked: {0}")]
    ApprovalBlocked(String),

    #[error("concurrent modification of report {report_id}: expected version {expected}, found {found}")]
    ConcurrentModification {
        report_id: ReportId,
        expected: u64,
        found: u64,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AuditGraphError {
    /// Structural and logical errors are surfaced immediately; only collaborator
    /// failures are worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, AuditGraphError::GenerationFailure { .. })
    }
}

fn join_states(states: &[ReportStatus]) -> String {
    states
        .iter()
        .map(|s| format!("'{}'", s))
        .collect::<Vec<_>>()
        .join(" or ")
}

pub type Result<T> = std::result::Result<T, AuditGraphError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_transition_message_names_required_state() {
        let err = AuditGraphError::StateTransition {
            transition: "issue",
            current: ReportStatus::Draft,
            required: vec![ReportStatus::Approved],
        };
        assert_eq!(
            err.to_string(),
            "cannot issue report in state 'draft': requires state 'approved'"
        );
    }

    #[test]
    fn multiple_required_states_are_joined() {
        let err = AuditGraphError::StateTransition {
            transition: "validate",
            current: ReportStatus::Issued,
            required: vec![ReportStatus::Draft, ReportStatus::NeedsRevision],
        };
        assert!(err.to_string().ends_with("'draft' or 'needs_revision'"));
    }
}
