use std::sync::Arc;

use async_trait::async_trait;

use super::{Step, StepResult};
use crate::errors::FailureKind;
use crate::models::{StepId, WorkflowState};
use crate::services::SpecialistLocator;

/// Looks up specialists for the referral once the patient approved the search.
pub struct SpecialistScoutStep {
    locator: Arc<dyn SpecialistLocator>,
    default_location: Option<String>,
}

impl SpecialistScoutStep {
    pub fn new(locator: Arc<dyn SpecialistLocator>, default_location: Option<String>) -> Self {
        Self {
            locator,
            default_location,
        }
    }
}

#[async_trait]
impl Step for SpecialistScoutStep {
    fn id(&self) -> StepId {
        StepId::SpecialistScout
    }

    async fn run(&self, mut state: WorkflowState) -> StepResult {
        if !state.specialist_search_approved {
            return StepResult::fail(
                FailureKind::InvariantViolation,
                "specialist search has not been approved",
            );
        }
        let Some(specialty) = state.specialist_type.clone() else {
            return StepResult::fail(FailureKind::MissingInput, "specialist_type is absent");
        };
        let location = state
            .patient_location
            .clone()
            .or_else(|| self.default_location.clone());

        let results = match self
            .locator
            .search(
                &specialty,
                state.specialist_condition.as_deref(),
                location.as_deref(),
            )
            .await
        {
            Ok(results) => results,
            Err(err) => return StepResult::collaborator(err),
        };

        tracing::info!(
            specialty = %specialty,
            location = location.as_deref().unwrap_or(""),
            found = results.len(),
            "specialist search finished"
        );
        state.specialist_results = results;
        StepResult::Advance(state)
    }
}
