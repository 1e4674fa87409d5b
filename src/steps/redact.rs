use std::sync::Arc;

use async_trait::async_trait;

use super::{Step, StepResult};
use crate::errors::FailureKind;
use crate::models::{StepId, WorkflowState};
use crate::services::PiiRedactor;

/// Masks identifiers in the raw report before anything leaves the process.
pub struct RedactStep {
    redactor: Arc<dyn PiiRedactor>,
}

impl RedactStep {
    pub fn new(redactor: Arc<dyn PiiRedactor>) -> Self {
        Self { redactor }
    }
}

#[async_trait]
impl Step for RedactStep {
    fn id(&self) -> StepId {
        StepId::Redact
    }

    async fn run(&self, mut state: WorkflowState) -> StepResult {
        if state.raw_text.trim().is_empty() {
            return StepResult::fail(FailureKind::MissingInput, "raw_text is empty");
        }
        let redacted = self.redactor.redact(&state.raw_text);
        tracing::debug!(
            raw_chars = state.raw_text.len(),
            redacted_chars = redacted.len(),
            "report redacted"
        );
        state.redacted_text = Some(redacted);
        StepResult::Advance(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::PatternRedactor;
    use chrono::Utc;

    fn step() -> RedactStep {
        RedactStep::new(Arc::new(PatternRedactor))
    }

    #[tokio::test]
    async fn test_sets_redacted_text_and_keeps_raw() {
        let state = WorkflowState::new("s", "Patient: Jane Doe\nGlucose 130 mg/dL 70-99", None, Utc::now());
        let StepResult::Advance(out) = step().run(state).await else {
            panic!("expected advance");
        };
        let redacted = out.redacted_text.unwrap();
        assert!(!redacted.contains("Jane"));
        assert!(redacted.contains("Glucose 130 mg/dL 70-99"));
        assert!(out.raw_text.contains("Jane"));
    }

    #[tokio::test]
    async fn test_empty_text_is_missing_input() {
        let state = WorkflowState::new("s", "  ", None, Utc::now());
        assert!(matches!(
            step().run(state).await,
            StepResult::Fail {
                kind: FailureKind::MissingInput,
                ..
            }
        ));
    }
}
