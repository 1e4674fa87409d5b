//! Step registry: the triage graph as a static table.
//!
//! Each row names a step, the steps allowed to transition into it, the
//! steps it may transition to, and what kind of node it is. The engine only
//! ever asks the registry "what is this step" and "where does it go next";
//! changing the graph means changing [`StepRegistry::triage`].

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use crate::errors::{FailureKind, TriageError};
use crate::models::{InterruptKind, StepId, WorkflowState};
use crate::steps::Step;

/// Chooses the successor of a task step from the state it produced.
pub type RouteFn = fn(&WorkflowState) -> StepId;

/// Applies the field an approved gate unlocks.
pub type ApproveFn = fn(&mut WorkflowState);

/// A human-in-the-loop pause point.
#[derive(Clone, Copy)]
pub struct GateDef {
    pub kind: InterruptKind,
    pub approve_to: StepId,
    pub deny_to: StepId,
    pub on_approve: ApproveFn,
}

#[derive(Clone)]
pub enum StepNode {
    Task { handler: Arc<dyn Step>, route: RouteFn },
    Gate(GateDef),
    Terminal,
}

#[derive(Clone)]
pub struct StepDef {
    pub id: StepId,
    pub predecessors: Vec<StepId>,
    pub successors: Vec<StepId>,
    pub node: StepNode,
}

impl StepDef {
    pub fn task(id: StepId, handler: Arc<dyn Step>, route: RouteFn) -> Self {
        Self {
            id,
            predecessors: Vec::new(),
            successors: Vec::new(),
            node: StepNode::Task { handler, route },
        }
    }

    pub fn gate(id: StepId, gate: GateDef) -> Self {
        Self {
            id,
            predecessors: Vec::new(),
            successors: vec![gate.approve_to, gate.deny_to],
            node: StepNode::Gate(gate),
        }
    }

    pub fn terminal(id: StepId) -> Self {
        Self {
            id,
            predecessors: Vec::new(),
            successors: Vec::new(),
            node: StepNode::Terminal,
        }
    }

    pub fn after(mut self, predecessors: &[StepId]) -> Self {
        self.predecessors = predecessors.to_vec();
        self
    }

    pub fn then(mut self, successors: &[StepId]) -> Self {
        self.successors = successors.to_vec();
        self
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.node, StepNode::Terminal)
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum RegistryError {
    #[error("Step {0} is declared twice")]
    DuplicateStep(StepId),

    #[error("Step {from} references undeclared step {to}")]
    UnknownStep { from: StepId, to: StepId },

    #[error("Edge {from} -> {to} is not declared on both ends")]
    AsymmetricEdge { from: StepId, to: StepId },

    #[error("Graph needs exactly one entry step, found {0}")]
    EntryCount(usize),

    #[error("Graph has no terminal step")]
    NoTerminal,

    #[error("Interrupt {0} is handled by more than one gate")]
    DuplicateGate(InterruptKind),
}

pub struct StepRegistry {
    steps: HashMap<StepId, StepDef>,
    gates: HashMap<InterruptKind, StepId>,
    entry: StepId,
}

impl StepRegistry {
    /// Build and validate a registry from its table.
    pub fn new(defs: Vec<StepDef>) -> Result<Self, RegistryError> {
        let mut steps = HashMap::new();
        let mut gates = HashMap::new();
        for def in defs {
            if let StepNode::Gate(gate) = &def.node
                && gates.insert(gate.kind, def.id).is_some()
            {
                return Err(RegistryError::DuplicateGate(gate.kind));
            }
            let id = def.id;
            if steps.insert(id, def).is_some() {
                return Err(RegistryError::DuplicateStep(id));
            }
        }

        for def in steps.values() {
            for to in &def.successors {
                let target = steps.get(to).ok_or(RegistryError::UnknownStep {
                    from: def.id,
                    to: *to,
                })?;
                if !target.predecessors.contains(&def.id) {
                    return Err(RegistryError::AsymmetricEdge {
                        from: def.id,
                        to: *to,
                    });
                }
            }
            for from in &def.predecessors {
                let source = steps.get(from).ok_or(RegistryError::UnknownStep {
                    from: def.id,
                    to: *from,
                })?;
                if !source.successors.contains(&def.id) {
                    return Err(RegistryError::AsymmetricEdge {
                        from: *from,
                        to: def.id,
                    });
                }
            }
        }

        let mut entries: Vec<StepId> = steps
            .values()
            .filter(|d| d.predecessors.is_empty())
            .map(|d| d.id)
            .collect();
        if entries.len() != 1 {
            return Err(RegistryError::EntryCount(entries.len()));
        }
        if !steps.values().any(StepDef::is_terminal) {
            return Err(RegistryError::NoTerminal);
        }

        Ok(Self {
            steps,
            gates,
            entry: entries.remove(0),
        })
    }

    /// The triage graph:
    ///
    /// ```text
    /// redact -> interpret -+-> approve_specialist_search -+-> specialist_scout -> safety_audit -> terminal
    ///                      |                              '------(deny)------------^
    ///                      +-> specialist_scout (already approved)
    ///                      '-> safety_audit (nothing abnormal)
    /// ```
    pub fn triage(
        redact: Arc<dyn Step>,
        interpret: Arc<dyn Step>,
        specialist_scout: Arc<dyn Step>,
        safety_audit: Arc<dyn Step>,
    ) -> Result<Self, RegistryError> {
        use StepId::*;

        Self::new(vec![
            StepDef::task(Redact, redact, |_| Interpret).then(&[Interpret]),
            StepDef::task(Interpret, interpret, route_after_interpret)
                .after(&[Redact])
                .then(&[ApproveSpecialistSearch, SpecialistScout, SafetyAudit]),
            StepDef::gate(
                ApproveSpecialistSearch,
                GateDef {
                    kind: InterruptKind::SpecialistSearch,
                    approve_to: SpecialistScout,
                    deny_to: SafetyAudit,
                    on_approve: |state| state.specialist_search_approved = true,
                },
            )
            .after(&[Interpret]),
            StepDef::task(SpecialistScout, specialist_scout, |_| SafetyAudit)
                .after(&[Interpret, ApproveSpecialistSearch])
                .then(&[SafetyAudit]),
            StepDef::task(SafetyAudit, safety_audit, |_| Terminal)
                .after(&[Interpret, ApproveSpecialistSearch, SpecialistScout])
                .then(&[Terminal]),
            StepDef::terminal(Terminal).after(&[SafetyAudit]),
        ])
    }

    pub fn entry(&self) -> StepId {
        self.entry
    }

    pub fn get(&self, id: StepId) -> Option<&StepDef> {
        self.steps.get(&id)
    }

    /// The gate that resolves interrupts of `kind`.
    pub fn gate(&self, kind: InterruptKind) -> Option<&GateDef> {
        let id = self.gates.get(&kind)?;
        match &self.steps.get(id)?.node {
            StepNode::Gate(gate) => Some(gate),
            _ => None,
        }
    }

    /// The interrupt a checkpoint at `id` must carry, if `id` is a gate.
    pub fn pending_at(&self, id: StepId) -> Option<InterruptKind> {
        match &self.get(id)?.node {
            StepNode::Gate(gate) => Some(gate.kind),
            _ => None,
        }
    }

    /// Check that `to` is a declared successor of `from`.
    pub fn check_transition(&self, from: StepId, to: StepId) -> Result<(), TriageError> {
        let def = self.get(from).ok_or_else(|| TriageError::StepFailed {
            step: from,
            kind: FailureKind::UnknownStep,
            detail: format!("step {} is not registered", from),
        })?;
        if def.successors.contains(&to) {
            Ok(())
        } else {
            Err(TriageError::StepFailed {
                step: from,
                kind: FailureKind::InvalidTransition,
                detail: format!("{} is not a declared successor of {}", to, from),
            })
        }
    }
}

/// Routing after interpretation: abnormal results need an approved search.
pub fn route_after_interpret(state: &WorkflowState) -> StepId {
    match (state.specialist_needed, state.specialist_search_approved) {
        (true, false) => StepId::ApproveSpecialistSearch,
        (true, true) => StepId::SpecialistScout,
        (false, _) => StepId::SafetyAudit,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::StepResult;
    use async_trait::async_trait;
    use chrono::Utc;

    struct Noop(StepId);

    #[async_trait]
    impl Step for Noop {
        fn id(&self) -> StepId {
            self.0
        }

        async fn run(&self, state: WorkflowState) -> StepResult {
            StepResult::Advance(state)
        }
    }

    fn noop(id: StepId) -> Arc<dyn Step> {
        Arc::new(Noop(id))
    }

    fn triage() -> StepRegistry {
        StepRegistry::triage(
            noop(StepId::Redact),
            noop(StepId::Interpret),
            noop(StepId::SpecialistScout),
            noop(StepId::SafetyAudit),
        )
        .unwrap()
    }

    fn state(needed: bool, approved: bool) -> WorkflowState {
        let mut s = WorkflowState::new("s", "text", None, Utc::now());
        s.specialist_needed = needed;
        s.specialist_search_approved = approved;
        s
    }

    #[test]
    fn test_triage_graph_validates() {
        let registry = triage();
        assert_eq!(registry.entry(), StepId::Redact);
        for id in StepId::ALL {
            assert!(registry.get(id).is_some(), "missing {}", id);
        }
        assert!(registry.get(StepId::Terminal).unwrap().is_terminal());
    }

    #[test]
    fn test_route_after_interpret() {
        assert_eq!(
            route_after_interpret(&state(true, false)),
            StepId::ApproveSpecialistSearch
        );
        assert_eq!(
            route_after_interpret(&state(true, true)),
            StepId::SpecialistScout
        );
        assert_eq!(route_after_interpret(&state(false, false)), StepId::SafetyAudit);
        assert_eq!(route_after_interpret(&state(false, true)), StepId::SafetyAudit);
    }

    #[test]
    fn test_gate_lookup_and_pending_at() {
        let registry = triage();
        let gate = registry.gate(InterruptKind::SpecialistSearch).unwrap();
        assert_eq!(gate.approve_to, StepId::SpecialistScout);
        assert_eq!(gate.deny_to, StepId::SafetyAudit);

        let mut s = state(true, false);
        (gate.on_approve)(&mut s);
        assert!(s.specialist_search_approved);

        assert_eq!(
            registry.pending_at(StepId::ApproveSpecialistSearch),
            Some(InterruptKind::SpecialistSearch)
        );
        assert_eq!(registry.pending_at(StepId::Interpret), None);
    }

    #[test]
    fn test_check_transition() {
        let registry = triage();
        assert!(registry.check_transition(StepId::Interpret, StepId::SafetyAudit).is_ok());
        let err = registry
            .check_transition(StepId::Redact, StepId::SafetyAudit)
            .unwrap_err();
        assert!(matches!(
            err,
            TriageError::StepFailed {
                kind: FailureKind::InvalidTransition,
                ..
            }
        ));
    }

    #[test]
    fn test_unknown_successor_is_rejected() {
        let err = StepRegistry::new(vec![
            StepDef::task(StepId::Redact, noop(StepId::Redact), |_| StepId::Interpret)
                .then(&[StepId::Interpret]),
            StepDef::terminal(StepId::Terminal),
        ])
        .err()
        .unwrap();
        assert_eq!(
            err,
            RegistryError::UnknownStep {
                from: StepId::Redact,
                to: StepId::Interpret
            }
        );
    }

    #[test]
    fn test_one_sided_edge_is_rejected() {
        let err = StepRegistry::new(vec![
            StepDef::task(StepId::Redact, noop(StepId::Redact), |_| StepId::Terminal)
                .then(&[StepId::Terminal]),
            StepDef::terminal(StepId::Terminal),
        ])
        .err()
        .unwrap();
        assert!(matches!(err, RegistryError::AsymmetricEdge { .. }));
    }

    #[test]
    fn test_missing_terminal_and_duplicate_steps() {
        let no_terminal = StepRegistry::new(vec![StepDef::task(
            StepId::Redact,
            noop(StepId::Redact),
            |_| StepId::Redact,
        )])
        .err()
        .unwrap();
        assert_eq!(no_terminal, RegistryError::NoTerminal);

        let dup = StepRegistry::new(vec![
            StepDef::terminal(StepId::Terminal),
            StepDef::terminal(StepId::Terminal),
        ])
        .err()
        .unwrap();
        assert_eq!(dup, RegistryError::DuplicateStep(StepId::Terminal));
    }

    #[test]
    fn test_two_entries_are_rejected() {
        let err = StepRegistry::new(vec![
            StepDef::task(StepId::Redact, noop(StepId::Redact), |_| StepId::Terminal)
                .then(&[StepId::Terminal]),
            StepDef::task(StepId::Interpret, noop(StepId::Interpret), |_| StepId::Terminal)
                .then(&[StepId::Terminal]),
            StepDef::terminal(StepId::Terminal).after(&[StepId::Redact, StepId::Interpret]),
        ])
        .err()
        .unwrap();
        assert_eq!(err, RegistryError::EntryCount(2));
    }
}
