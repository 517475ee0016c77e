//! Typed error hierarchy for the Shipwright pipeline.
//!
//! Four families cover the error taxonomy:
//! - `StateError`: precondition failures raised by the phase state machine
//! - `PolicyViolation`: sandbox denials, never retried
//! - `CommandError`: external command spawn failures and timeouts
//! - `PhaseFailure`: a phase-boundary failure reported by the runner
//!
//! Unexpected external failures travel as `anyhow::Error`; callers that need to
//! branch on a domain failure use `downcast_ref` rather than string matching.

use crate::phase::PipelinePhase;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Precondition failures from the phase state machine.
///
/// These are raised synchronously and never leave the state mutated.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("Invalid phase transition from {from} to {to}")]
    InvalidTransition {
        from: PipelinePhase,
        to: PipelinePhase,
    },

    #[error("A developer profile is required to transition from {from} to {to}; none is loaded")]
    ProfileRequired {
        from: PipelinePhase,
        to: PipelinePhase,
    },

    #[error("Project scaffolding is already complete; SCAFFOLDING cannot be re-entered")]
    ScaffoldingAlreadyComplete,

    #[error("Pipeline is already COMPLETE; there is no next phase")]
    AlreadyComplete,

    #[error("Failed to persist pipeline state to {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },
}

/// A command rejected by the sandbox policy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Sandbox policy violation for `{command}`: {reason}")]
pub struct PolicyViolation {
    pub command: String,
    pub reason: String,
}

impl PolicyViolation {
    pub fn new(command: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            reason: reason.into(),
        }
    }
}

/// Failures while running an external command.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("`{command}` timed out after {}s", timeout.as_secs())]
    Timeout { command: String, timeout: Duration },

    #[error("Failed to spawn `{command}`: {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

/// A failure caught at a phase boundary.
///
/// The state machine is parked at `phase`, so the next `shipwright run`
/// resumes there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseFailure {
    pub phase: PipelinePhase,
    pub epic: Option<u32>,
    pub message: String,
}

impl PhaseFailure {
    pub fn new(phase: PipelinePhase, epic: Option<u32>, message: impl Into<String>) -> Self {
        Self {
            phase,
            epic,
            message: message.into(),
        }
    }

    /// Instruction printed with every halt.
    pub fn resume_hint(&self) -> String {
        format!(
            "The run is resumable: run `shipwright run` again to continue from {}.",
            self.phase
        )
    }
}

impl fmt::Display for PhaseFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.epic {
            Some(epic) => write!(f, "[{}] epic {}: {}", self.phase, epic, self.message)?,
            None => write!(f, "[{}] {}", self.phase, self.message)?,
        }
        write!(f, "\n{}", self.resume_hint())
    }
}

impl std::error::Error for PhaseFailure {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_transition_cites_both_phases() {
        let err = StateError::InvalidTransition {
            from: PipelinePhase::Idle,
            to: PipelinePhase::Complete,
        };
        let msg = err.to_string();
        assert!(msg.contains("IDLE"));
        assert!(msg.contains("COMPLETE"));
    }

    #[test]
    fn profile_required_is_distinct_from_invalid_transition() {
        let err = StateError::ProfileRequired {
            from: PipelinePhase::Idle,
            to: PipelinePhase::Planning,
        };
        assert!(matches!(err, StateError::ProfileRequired { .. }));
        assert!(!matches!(err, StateError::InvalidTransition { .. }));
        assert!(err.to_string().contains("profile"));
    }

    #[test]
    fn policy_violation_survives_anyhow_roundtrip() {
        let violation = PolicyViolation::new("rm -rf /", "denied pattern");
        let err: anyhow::Error = violation.clone().into();
        let recovered = err.downcast_ref::<PolicyViolation>().unwrap();
        assert_eq!(recovered, &violation);
        assert_eq!(recovered.command, "rm -rf /");
    }

    #[test]
    fn command_timeout_reports_seconds() {
        let err = CommandError::Timeout {
            command: "cargo test".to_string(),
            timeout: Duration::from_secs(90),
        };
        assert!(err.to_string().contains("90s"));
    }

    #[test]
    fn phase_failure_display_includes_phase_epic_and_resume_hint() {
        let failure = PhaseFailure::new(PipelinePhase::Building, Some(2), "story 2.1 failed");
        let rendered = failure.to_string();
        assert!(rendered.contains("[BUILDING]"));
        assert!(rendered.contains("epic 2"));
        assert!(rendered.contains("story 2.1 failed"));
        assert!(rendered.contains("resumable"));
    }

    #[test]
    fn phase_failure_without_epic() {
        let failure = PhaseFailure::new(PipelinePhase::Retrospective, None, "boom");
        assert!(failure.to_string().starts_with("[RETROSPECTIVE] boom"));
    }
}
