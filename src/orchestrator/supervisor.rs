//! The externally-facing control surface for sessions.
//!
//! Every outer surface (HTTP handlers, CLI commands) goes through
//! [`Supervisor`]. It validates input once, delegates to the engine, and
//! turns every failure into a [`SupervisorError`] with a stable code.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use super::engine::Engine;
use crate::errors::{CollaboratorError, TriageError};
use crate::models::{Decision, InterruptKind, StepId, WorkflowState};
use crate::services::{
    PiiRedactor, RecordSubmitter, ResultsAssistant, TextExtractor, results_context,
};
use crate::store::Checkpoint;

/// Stable, machine-readable failure codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    SessionNotFound,
    SessionBusy,
    InterruptPending,
    NoPendingInterrupt,
    InterruptMismatch,
    StoreUnavailable,
    StepFailed,
    WorkflowIncomplete,
    InvalidRequest,
    UnreadableDocument,
    CollaboratorFailed,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::SessionNotFound => "session_not_found",
            ErrorCode::SessionBusy => "session_busy",
            ErrorCode::InterruptPending => "interrupt_pending",
            ErrorCode::NoPendingInterrupt => "no_pending_interrupt",
            ErrorCode::InterruptMismatch => "interrupt_mismatch",
            ErrorCode::StoreUnavailable => "store_unavailable",
            ErrorCode::StepFailed => "step_failed",
            ErrorCode::WorkflowIncomplete => "workflow_incomplete",
            ErrorCode::InvalidRequest => "invalid_request",
            ErrorCode::UnreadableDocument => "unreadable_document",
            ErrorCode::CollaboratorFailed => "collaborator_failed",
        }
    }

    /// Whether repeating the same call later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::SessionBusy | ErrorCode::StoreUnavailable | ErrorCode::StepFailed
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, Serialize)]
#[error("{code}: {detail}")]
pub struct SupervisorError {
    pub code: ErrorCode,
    pub detail: String,
}

impl SupervisorError {
    pub fn new(code: ErrorCode, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: detail.into(),
        }
    }
}

impl From<TriageError> for SupervisorError {
    fn from(err: TriageError) -> Self {
        let code = match &err {
            TriageError::SessionNotFound(_) => ErrorCode::SessionNotFound,
            TriageError::SessionBusy(_) => ErrorCode::SessionBusy,
            TriageError::InterruptPending { .. } => ErrorCode::InterruptPending,
            TriageError::NoPendingInterrupt(_) => ErrorCode::NoPendingInterrupt,
            TriageError::InterruptMismatch { .. } => ErrorCode::InterruptMismatch,
            TriageError::StoreUnavailable(_) => ErrorCode::StoreUnavailable,
            TriageError::StepFailed { .. } => ErrorCode::StepFailed,
            TriageError::WorkflowIncomplete { .. } => ErrorCode::WorkflowIncomplete,
            TriageError::Collaborator(CollaboratorError::UnreadableDocument(_)) => {
                ErrorCode::UnreadableDocument
            }
            TriageError::Collaborator(_) => ErrorCode::CollaboratorFailed,
        };
        SupervisorError::new(code, err.to_string())
    }
}

impl From<CollaboratorError> for SupervisorError {
    fn from(err: CollaboratorError) -> Self {
        TriageError::from(err).into()
    }
}

// ── Views ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    AwaitingApproval { interrupt: InterruptKind },
    Complete,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Running => f.write_str("running"),
            SessionStatus::AwaitingApproval { interrupt } => {
                write!(f, "awaiting approval ({})", interrupt)
            }
            SessionStatus::Complete => f.write_str("complete"),
        }
    }
}

/// What callers see of a session: its state plus where it stands.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionView {
    pub session_id: String,
    #[serde(flatten)]
    pub status: SessionStatus,
    pub current_step: StepId,
    pub state: WorkflowState,
}

/// One row of a session's audit trail.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryEntry {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub step: StepId,
    pub pending_interrupt: Option<InterruptKind>,
    pub biomarker_count: usize,
}

/// An answer to a question about a session's results.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatReply {
    pub session_id: String,
    pub message: String,
}

// ── Supervisor ────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct Supervisor {
    engine: Arc<Engine>,
    extractor: Arc<dyn TextExtractor>,
    redactor: Arc<dyn PiiRedactor>,
    submitter: Arc<dyn RecordSubmitter>,
    assistant: Arc<dyn ResultsAssistant>,
}

impl Supervisor {
    pub fn new(
        engine: Arc<Engine>,
        extractor: Arc<dyn TextExtractor>,
        redactor: Arc<dyn PiiRedactor>,
        submitter: Arc<dyn RecordSubmitter>,
        assistant: Arc<dyn ResultsAssistant>,
    ) -> Self {
        Self {
            engine,
            extractor,
            redactor,
            submitter,
            assistant,
        }
    }

    /// Start a session from already-extracted report text.
    pub async fn create(
        &self,
        initial_text: &str,
        location: Option<&str>,
    ) -> Result<SessionView, SupervisorError> {
        if initial_text.trim().is_empty() {
            return Err(SupervisorError::new(
                ErrorCode::InvalidRequest,
                "report text is empty",
            ));
        }
        let location = location
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string);

        let session_id = new_session_id();
        let state = WorkflowState::new(session_id, initial_text, location, Utc::now());
        let checkpoint = self.engine.start(state).await?;
        Ok(self.view(checkpoint))
    }

    /// Extract text from an uploaded document and start a session from it.
    pub async fn create_from_document(
        &self,
        document: &[u8],
        location: Option<&str>,
    ) -> Result<SessionView, SupervisorError> {
        let text = self.extractor.extract(document).await?;
        self.create(&text, location).await
    }

    pub async fn advance(&self, session_id: &str) -> Result<SessionView, SupervisorError> {
        let session_id = validate_id(session_id)?;
        let checkpoint = self.engine.advance(session_id).await?;
        Ok(self.view(checkpoint))
    }

    pub async fn resume(
        &self,
        session_id: &str,
        decision: Decision,
        expected: Option<InterruptKind>,
    ) -> Result<SessionView, SupervisorError> {
        let session_id = validate_id(session_id)?;
        let checkpoint = self.engine.resume(session_id, decision, expected).await?;
        Ok(self.view(checkpoint))
    }

    pub async fn get_state(&self, session_id: &str) -> Result<SessionView, SupervisorError> {
        let session_id = validate_id(session_id)?;
        let checkpoint = self.engine.latest(session_id).await?;
        Ok(self.view(checkpoint))
    }

    pub async fn history(&self, session_id: &str) -> Result<Vec<HistoryEntry>, SupervisorError> {
        let session_id = validate_id(session_id)?;
        let history = self.engine.history(session_id).await?;
        Ok(history
            .into_iter()
            .map(|cp| HistoryEntry {
                sequence: cp.sequence,
                timestamp: cp.timestamp,
                step: cp.current_step,
                pending_interrupt: cp.pending_interrupt,
                biomarker_count: cp.state.biomarkers.len(),
            })
            .collect())
    }

    /// Submit a completed session's biomarkers to the external record store.
    pub async fn submit_records(&self, session_id: &str) -> Result<SessionView, SupervisorError> {
        let session_id = validate_id(session_id)?;
        let checkpoint = self
            .engine
            .submit(session_id, self.submitter.as_ref())
            .await?;
        Ok(self.view(checkpoint))
    }

    /// Answer a question using the session's latest biomarkers as context.
    ///
    /// Read-only: no lock is taken and nothing is checkpointed. The question
    /// is redacted before it leaves the process.
    pub async fn chat(&self, session_id: &str, message: &str) -> Result<ChatReply, SupervisorError> {
        let session_id = validate_id(session_id)?;
        if message.trim().is_empty() {
            return Err(SupervisorError::new(
                ErrorCode::InvalidRequest,
                "message is required",
            ));
        }
        let checkpoint = self.engine.latest(session_id).await?;
        let context = results_context(&checkpoint.state.biomarkers);
        let question = self.redactor.redact(message.trim());

        let message = self.assistant.answer(&context, &question).await?;
        tracing::info!(
            session_id,
            biomarkers = checkpoint.state.biomarkers.len(),
            "question answered"
        );
        Ok(ChatReply {
            session_id: session_id.to_string(),
            message,
        })
    }

    fn view(&self, checkpoint: Checkpoint) -> SessionView {
        let terminal = self
            .engine
            .registry()
            .get(checkpoint.current_step)
            .is_some_and(|def| def.is_terminal());
        let status = match (checkpoint.pending_interrupt, terminal) {
            (Some(interrupt), _) => SessionStatus::AwaitingApproval { interrupt },
            (None, true) => SessionStatus::Complete,
            (None, false) => SessionStatus::Running,
        };
        SessionView {
            session_id: checkpoint.session_id,
            status,
            current_step: checkpoint.current_step,
            state: checkpoint.state,
        }
    }
}

fn new_session_id() -> String {
    format!("session_{}", Uuid::new_v4().simple())
}

fn validate_id(session_id: &str) -> Result<&str, SupervisorError> {
    let id = session_id.trim();
    if id.is_empty() {
        return Err(SupervisorError::new(
            ErrorCode::InvalidRequest,
            "session id is empty",
        ));
    }
    Ok(id)
}
