//! Typed error hierarchy for the triage workflow.
//!
//! Three layers, leaves first:
//! - `StoreError`: checkpoint persistence failures
//! - `CollaboratorError`: failures reported by external services (extractor, model, directory, record store)
//! - `TriageError`: engine-level failures surfaced to the session supervisor
//!
//! The supervisor translates `TriageError` into a stable error code; see
//! `orchestrator::supervisor::ErrorCode`.

use serde::Serialize;
use thiserror::Error;

use crate::models::{InterruptKind, StepId};

/// Errors from the session state store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("No checkpoint exists for session {0}")]
    SessionNotFound(String),

    /// The appended checkpoint was not the direct successor of the latest one.
    #[error("Checkpoint {sequence} for session {session_id} does not follow the latest checkpoint")]
    SequenceConflict { session_id: String, sequence: u64 },

    #[error("Checkpoint store unavailable: {0}")]
    Unavailable(String),
}

impl From<anyhow::Error> for StoreError {
    fn from(err: anyhow::Error) -> Self {
        StoreError::Unavailable(format!("{:#}", err))
    }
}

/// Errors returned by external collaborators.
#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("Unreadable document: {0}")]
    UnreadableDocument(String),

    /// Network failures, timeouts, rate limits and 5xx responses.
    #[error("{service} request failed: {message}")]
    Transient {
        service: &'static str,
        message: String,
    },

    #[error("{service} rejected the request: {message}")]
    Rejected {
        service: &'static str,
        message: String,
    },

    #[error("{service} returned an unusable response: {message}")]
    Malformed {
        service: &'static str,
        message: String,
    },
}

impl CollaboratorError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, CollaboratorError::Transient { .. })
    }
}

/// Why a step refused to produce a new state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// A field the step consumes has not been produced yet.
    MissingInput,
    /// An external collaborator call failed.
    Collaborator,
    /// A state invariant does not hold on entry to the step.
    InvariantViolation,
    /// The routing function chose a step that is not a declared successor.
    InvalidTransition,
    /// The checkpoint names a step the registry does not know.
    UnknownStep,
    /// One traversal executed more steps than the configured ceiling.
    StepLimit,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::MissingInput => "missing_input",
            FailureKind::Collaborator => "collaborator",
            FailureKind::InvariantViolation => "invariant_violation",
            FailureKind::InvalidTransition => "invalid_transition",
            FailureKind::UnknownStep => "unknown_step",
            FailureKind::StepLimit => "step_limit",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors from the orchestrator engine.
#[derive(Debug, Error)]
pub enum TriageError {
    #[error("Session {0} not found")]
    SessionNotFound(String),

    #[error("Session {0} is busy with another traversal")]
    SessionBusy(String),

    #[error("Session {session_id} is waiting on a {kind} decision")]
    InterruptPending {
        session_id: String,
        kind: InterruptKind,
    },

    #[error("Session {0} has no pending interrupt")]
    NoPendingInterrupt(String),

    #[error("Session {session_id} is waiting on a {pending} decision, not {requested}")]
    InterruptMismatch {
        session_id: String,
        pending: InterruptKind,
        requested: InterruptKind,
    },

    #[error("{0}")]
    StoreUnavailable(String),

    #[error("Step {step} failed ({kind}): {detail}")]
    StepFailed {
        step: StepId,
        kind: FailureKind,
        detail: String,
    },

    #[error("Session {session_id} is at step {step}; records can only be submitted after the terminal step")]
    WorkflowIncomplete { session_id: String, step: StepId },

    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),
}

impl From<StoreError> for TriageError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::SessionNotFound(id) => TriageError::SessionNotFound(id),
            // Another writer appended first; the caller lost the race.
            StoreError::SequenceConflict { session_id, .. } => TriageError::SessionBusy(session_id),
            StoreError::Unavailable(_) => TriageError::StoreUnavailable(err.to_string()),
        }
    }
}
