//! Interrupt gate: a pause point represented as checkpoint data.
//!
//! ```text
//! NONE ──(reach gate)──> PENDING(kind) ──approve──> NONE, gated field set
//!                                      └──deny────> NONE, gated field unset
//! ```
//!
//! Nothing here holds a live continuation. A pending gate is just a
//! checkpoint whose `pending_interrupt` is set, so it survives restarts and
//! costs nothing while a human takes their time.

use serde::Serialize;

use super::registry::GateDef;
use crate::errors::TriageError;
use crate::models::{Decision, InterruptKind, StepId, WorkflowState};
use crate::store::Checkpoint;

/// Gate status derived from a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "kind", rename_all = "snake_case")]
pub enum GateStatus {
    None,
    Pending(InterruptKind),
}

impl GateStatus {
    pub fn of(checkpoint: &Checkpoint) -> Self {
        match checkpoint.pending_interrupt {
            Some(kind) => GateStatus::Pending(kind),
            None => GateStatus::None,
        }
    }
}

/// Refuse to run steps while a decision is outstanding.
pub fn ensure_clear(checkpoint: &Checkpoint) -> Result<(), TriageError> {
    match checkpoint.pending_interrupt {
        Some(kind) => Err(TriageError::InterruptPending {
            session_id: checkpoint.session_id.clone(),
            kind,
        }),
        None => Ok(()),
    }
}

/// The pending interrupt, checked against what the caller thinks it is.
pub fn ensure_pending(
    checkpoint: &Checkpoint,
    expected: Option<InterruptKind>,
) -> Result<InterruptKind, TriageError> {
    let pending = checkpoint
        .pending_interrupt
        .ok_or_else(|| TriageError::NoPendingInterrupt(checkpoint.session_id.clone()))?;
    match expected {
        Some(requested) if requested != pending => Err(TriageError::InterruptMismatch {
            session_id: checkpoint.session_id.clone(),
            pending,
            requested,
        }),
        _ => Ok(pending),
    }
}

/// Apply a decision: the new state and the step traversal continues from.
pub fn resolve(gate: &GateDef, mut state: WorkflowState, decision: Decision) -> (WorkflowState, StepId) {
    match decision {
        Decision::Approve => {
            (gate.on_approve)(&mut state);
            (state, gate.approve_to)
        }
        Decision::Deny => (state, gate.deny_to),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn paused() -> Checkpoint {
        let mut state = WorkflowState::new("session_g", "text", None, Utc::now());
        state.specialist_needed = true;
        Checkpoint {
            current_step: StepId::ApproveSpecialistSearch,
            pending_interrupt: Some(InterruptKind::SpecialistSearch),
            ..Checkpoint::initial(state, StepId::Redact)
        }
    }

    fn gate() -> GateDef {
        GateDef {
            kind: InterruptKind::SpecialistSearch,
            approve_to: StepId::SpecialistScout,
            deny_to: StepId::SafetyAudit,
            on_approve: |s| s.specialist_search_approved = true,
        }
    }

    #[test]
    fn test_status_of_checkpoint() {
        let mut cp = paused();
        assert_eq!(
            GateStatus::of(&cp),
            GateStatus::Pending(InterruptKind::SpecialistSearch)
        );
        cp.pending_interrupt = None;
        assert_eq!(GateStatus::of(&cp), GateStatus::None);
    }

    #[test]
    fn test_ensure_clear_blocks_pending() {
        let err = ensure_clear(&paused()).unwrap_err();
        assert!(matches!(err, TriageError::InterruptPending { .. }));
    }

    #[test]
    fn test_ensure_pending_requires_interrupt() {
        let mut cp = paused();
        assert_eq!(
            ensure_pending(&cp, Some(InterruptKind::SpecialistSearch)).unwrap(),
            InterruptKind::SpecialistSearch
        );
        cp.pending_interrupt = None;
        assert!(matches!(
            ensure_pending(&cp, None),
            Err(TriageError::NoPendingInterrupt(_))
        ));
    }

    #[test]
    fn test_approve_sets_field_and_routes_forward() {
        let (state, next) = resolve(&gate(), paused().state, Decision::Approve);
        assert!(state.specialist_search_approved);
        assert_eq!(next, StepId::SpecialistScout);
    }

    #[test]
    fn test_deny_leaves_field_unset() {
        let (state, next) = resolve(&gate(), paused().state, Decision::Deny);
        assert!(!state.specialist_search_approved);
        assert_eq!(next, StepId::SafetyAudit);
    }

    #[test]
    fn test_status_serializes_tagged() {
        let json = serde_json::to_value(GateStatus::Pending(InterruptKind::SpecialistSearch)).unwrap();
        assert_eq!(json["state"], "pending");
        assert_eq!(json["kind"], "specialist_search");
    }
}
