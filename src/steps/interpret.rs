use std::sync::Arc;

use async_trait::async_trait;

use super::{Step, StepResult};
use crate::errors::FailureKind;
use crate::models::{StepId, WorkflowState};
use crate::services::InterpretationModel;
use crate::services::rules::referral_for;

/// Extracts biomarkers from the redacted report and decides whether a
/// specialist referral is warranted.
pub struct InterpretStep {
    model: Arc<dyn InterpretationModel>,
}

impl InterpretStep {
    pub fn new(model: Arc<dyn InterpretationModel>) -> Self {
        Self { model }
    }
}

#[async_trait]
impl Step for InterpretStep {
    fn id(&self) -> StepId {
        StepId::Interpret
    }

    async fn run(&self, mut state: WorkflowState) -> StepResult {
        let Some(text) = state.redacted_text.as_deref() else {
            return StepResult::fail(FailureKind::MissingInput, "redacted_text is absent");
        };

        let interpretation = match self.model.interpret(text).await {
            Ok(interpretation) => interpretation,
            Err(err) => return StepResult::collaborator(err),
        };

        // The referral decision follows the biomarker statuses, whatever the
        // model claimed.
        let referral = referral_for(&interpretation.biomarkers);
        state.specialist_needed = referral.is_some();
        if let Some(referral) = referral {
            state.specialist_type = interpretation
                .specialist_type
                .or_else(|| Some(referral.specialty.to_string()));
            state.specialist_condition = interpretation
                .specialist_condition
                .or_else(|| Some(referral.condition.to_string()));
        } else {
            state.specialist_type = None;
            state.specialist_condition = None;
        }

        tracing::info!(
            biomarkers = interpretation.biomarkers.len(),
            abnormal = interpretation
                .biomarkers
                .values()
                .filter(|b| b.status.is_abnormal())
                .count(),
            specialist_needed = state.specialist_needed,
            "report interpreted"
        );

        state.biomarkers = interpretation.biomarkers;
        state.interpretation_summary = interpretation.summary;
        state.lab_interpreted = true;
        StepResult::Advance(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::CollaboratorError;
    use crate::services::{Interpretation, RuleInterpreter};
    use async_trait::async_trait;
    use chrono::Utc;

    fn redacted(text: &str) -> WorkflowState {
        let mut state = WorkflowState::new("s", text, None, Utc::now());
        state.redacted_text = Some(text.to_string());
        state
    }

    async fn run(text: &str) -> WorkflowState {
        match InterpretStep::new(Arc::new(RuleInterpreter)).run(redacted(text)).await {
            StepResult::Advance(state) => state,
            other => panic!("expected advance, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_abnormal_value_requires_specialist() {
        let state = run("Glucose 130 mg/dL 70-99\nSodium 140 mmol/L 135-145").await;
        assert!(state.lab_interpreted);
        assert_eq!(state.biomarkers.len(), 2);
        assert!(state.specialist_needed);
        assert_eq!(state.specialist_type.as_deref(), Some("Endocrinologist"));
        assert!(state.interpretation_summary.is_some());
    }

    #[tokio::test]
    async fn test_normal_values_do_not() {
        let state = run("Sodium 140 mmol/L 135-145").await;
        assert!(state.lab_interpreted);
        assert!(!state.specialist_needed);
        assert!(state.specialist_type.is_none());
    }

    struct Overclaiming;

    #[async_trait]
    impl InterpretationModel for Overclaiming {
        async fn interpret(&self, _: &str) -> Result<Interpretation, CollaboratorError> {
            let mut interp = Interpretation::from_biomarkers(Default::default());
            interp.specialist_needed = true;
            interp.specialist_type = Some("Cardiologist".into());
            Ok(interp)
        }
    }

    #[tokio::test]
    async fn test_specialist_decision_follows_biomarkers() {
        let result = InterpretStep::new(Arc::new(Overclaiming))
            .run(redacted("nothing here"))
            .await;
        let StepResult::Advance(state) = result else {
            panic!("expected advance");
        };
        assert!(!state.specialist_needed);
        assert!(state.specialist_type.is_none());
    }

    #[tokio::test]
    async fn test_missing_redaction_is_missing_input() {
        let state = WorkflowState::new("s", "Glucose 130 mg/dL 70-99", None, Utc::now());
        let result = InterpretStep::new(Arc::new(RuleInterpreter)).run(state).await;
        assert!(matches!(
            result,
            StepResult::Fail {
                kind: FailureKind::MissingInput,
                ..
            }
        ));
    }
}
