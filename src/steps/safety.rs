use async_trait::async_trait;

use super::{Step, StepResult};
use crate::errors::FailureKind;
use crate::models::{StepId, WorkflowState};

pub const MEDICAL_DISCLAIMER: &str = "This analysis is for informational purposes only and is not \
a medical diagnosis. Lab values must be interpreted by a qualified healthcare provider in the \
context of your full medical history. Do not change medications or treatment based on this report.";

pub const URGENT_NOTICE: &str = "URGENT: one or more results are flagged as critical. Contact \
your healthcare provider or seek urgent care immediately.";

/// Final check before the session completes. Attaches the disclaimer.
pub struct SafetyAuditStep;

#[async_trait]
impl Step for SafetyAuditStep {
    fn id(&self) -> StepId {
        StepId::SafetyAudit
    }

    async fn run(&self, mut state: WorkflowState) -> StepResult {
        if !state.specialist_results.is_empty() && !state.specialist_search_approved {
            return StepResult::fail(
                FailureKind::InvariantViolation,
                "specialist results present without approval",
            );
        }

        let critical = state.has_critical();
        state.medical_disclaimer = Some(if critical {
            format!("{}\n\n{}", URGENT_NOTICE, MEDICAL_DISCLAIMER)
        } else {
            MEDICAL_DISCLAIMER.to_string()
        });
        state.safety_approved = true;
        if critical {
            tracing::warn!(session_id = %state.session_id, "critical biomarker values present");
        }
        StepResult::Advance(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Biomarker, BiomarkerStatus, SpecialistResult};
    use chrono::Utc;

    fn state() -> WorkflowState {
        WorkflowState::new("s", "text", None, Utc::now())
    }

    async fn approved(state: WorkflowState) -> WorkflowState {
        match SafetyAuditStep.run(state).await {
            StepResult::Advance(state) => state,
            other => panic!("expected advance, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_sets_disclaimer_and_approval() {
        let out = approved(state()).await;
        assert!(out.safety_approved);
        assert_eq!(out.medical_disclaimer.as_deref(), Some(MEDICAL_DISCLAIMER));
    }

    #[tokio::test]
    async fn test_critical_values_get_urgent_notice() {
        let mut s = state();
        s.biomarkers.insert(
            "potassium".into(),
            Biomarker {
                name: "Potassium".into(),
                value: 6.9,
                unit: "mmol/L".into(),
                normal_range_min: Some(3.5),
                normal_range_max: Some(5.1),
                status: BiomarkerStatus::Critical,
                interpretation: None,
            },
        );
        let out = approved(s).await;
        assert!(out.medical_disclaimer.unwrap().starts_with("URGENT"));
    }

    #[tokio::test]
    async fn test_unapproved_results_are_a_violation() {
        let mut s = state();
        s.specialist_results.push(SpecialistResult {
            name: "Dr. X".into(),
            specialty: "Cardiologist".into(),
            location: "Boston".into(),
            distance: None,
            rating: None,
            url: None,
        });
        assert!(matches!(
            SafetyAuditStep.run(s).await,
            StepResult::Fail {
                kind: FailureKind::InvariantViolation,
                ..
            }
        ));
    }
}
