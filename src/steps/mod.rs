//! Task steps of the triage graph.
//!
//! | Step               | Reads                              | Writes                                   |
//! |--------------------|------------------------------------|------------------------------------------|
//! | `redact`           | `raw_text`                         | `redacted_text`                          |
//! | `interpret`        | `redacted_text`                    | `biomarkers`, `specialist_*`, summary    |
//! | `specialist_scout` | `specialist_type`, location        | `specialist_results`                     |
//! | `safety_audit`     | everything                         | `safety_approved`, `medical_disclaimer`  |
//!
//! Steps are pure with respect to persistence: they receive an owned state
//! and return a [`StepResult`]. The engine decides what gets written.

pub mod interpret;
pub mod redact;
pub mod safety;
pub mod specialist;

use async_trait::async_trait;

use crate::errors::{CollaboratorError, FailureKind};
use crate::models::{InterruptKind, StepId, WorkflowState};

pub use interpret::InterpretStep;
pub use redact::RedactStep;
pub use safety::SafetyAuditStep;
pub use specialist::SpecialistScoutStep;

/// Outcome of one step invocation.
#[derive(Debug)]
pub enum StepResult {
    Advance(WorkflowState),
    Pause(WorkflowState, InterruptKind),
    Fail { kind: FailureKind, detail: String },
}

impl StepResult {
    pub fn fail(kind: FailureKind, detail: impl Into<String>) -> Self {
        StepResult::Fail {
            kind,
            detail: detail.into(),
        }
    }

    pub fn collaborator(err: CollaboratorError) -> Self {
        StepResult::fail(FailureKind::Collaborator, err.to_string())
    }
}

#[async_trait]
pub trait Step: Send + Sync {
    fn id(&self) -> StepId;

    async fn run(&self, state: WorkflowState) -> StepResult;
}
