use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::Instrument;

use super::gate;
use super::locks::SessionLocks;
use super::registry::{StepNode, StepRegistry};
use crate::errors::{FailureKind, TriageError};
use crate::models::{Decision, InterruptKind, StepId, WorkflowState};
use crate::services::RecordSubmitter;
use crate::steps::StepResult;
use crate::store::{Checkpoint, CheckpointStore};

/// Progress notifications for live observers (the WebSocket feed).
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    CheckpointWritten {
        session_id: String,
        sequence: u64,
        step: StepId,
        pending_interrupt: Option<InterruptKind>,
    },
    Paused {
        session_id: String,
        kind: InterruptKind,
    },
    Completed {
        session_id: String,
    },
    StepFailed {
        session_id: String,
        step: StepId,
        kind: FailureKind,
        detail: String,
    },
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub session_lock_timeout: Duration,
    pub max_steps_per_call: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            session_lock_timeout: Duration::ZERO,
            max_steps_per_call: 32,
        }
    }
}

/// Drives one session at a time through the step registry.
///
/// Every call follows the same shape: take the session lock, read the
/// latest checkpoint, run steps back to back, and append one checkpoint per
/// completed step. A failing step writes nothing, so the session stays at
/// its last good checkpoint and a repeated call picks up from there.
pub struct Engine {
    store: Arc<dyn CheckpointStore>,
    registry: Arc<StepRegistry>,
    locks: SessionLocks,
    max_steps: usize,
    events: Option<broadcast::Sender<SessionEvent>>,
}

impl Engine {
    pub fn new(
        store: Arc<dyn CheckpointStore>,
        registry: Arc<StepRegistry>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            registry,
            locks: SessionLocks::new(config.session_lock_timeout),
            max_steps: config.max_steps_per_call,
            events: None,
        }
    }

    /// Publish progress events on `tx`.
    pub fn with_event_channel(mut self, tx: broadcast::Sender<SessionEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    /// Persist the first checkpoint of a new session at the entry step.
    pub async fn start(&self, state: WorkflowState) -> Result<Checkpoint, TriageError> {
        let _guard = self.locks.acquire(&state.session_id).await?;
        let checkpoint = Checkpoint::initial(state, self.registry.entry());
        self.store.append(checkpoint.clone()).await?;
        tracing::info!(
            session_id = %checkpoint.session_id,
            step = %checkpoint.current_step,
            "session created"
        );
        self.emit_written(&checkpoint);
        Ok(checkpoint)
    }

    /// Run steps from the latest checkpoint until a gate or the terminal step.
    pub async fn advance(&self, session_id: &str) -> Result<Checkpoint, TriageError> {
        let _guard = self.locks.acquire(session_id).await?;
        let checkpoint = self.store.latest(session_id).await?;
        gate::ensure_clear(&checkpoint)?;
        self.run(checkpoint).await
    }

    /// Resolve the pending interrupt and continue the traversal.
    pub async fn resume(
        &self,
        session_id: &str,
        decision: Decision,
        expected: Option<InterruptKind>,
    ) -> Result<Checkpoint, TriageError> {
        let _guard = self.locks.acquire(session_id).await?;
        let checkpoint = self.store.latest(session_id).await?;
        let kind = gate::ensure_pending(&checkpoint, expected)?;
        let gate_def = self
            .registry
            .gate(kind)
            .ok_or_else(|| TriageError::StepFailed {
                step: checkpoint.current_step,
                kind: FailureKind::UnknownStep,
                detail: format!("no gate handles {} interrupts", kind),
            })?;

        let (state, next) = gate::resolve(gate_def, checkpoint.state.clone(), decision);
        tracing::info!(
            session_id,
            interrupt = %kind,
            decision = %decision,
            next = %next,
            "interrupt resolved"
        );
        let resumed = self
            .write(&checkpoint, state, next, self.registry.pending_at(next))
            .await?;
        self.run(resumed).await
    }

    /// Hand a completed session's biomarkers to the record store and record
    /// the returned ids in a new checkpoint.
    pub async fn submit(
        &self,
        session_id: &str,
        submitter: &dyn RecordSubmitter,
    ) -> Result<Checkpoint, TriageError> {
        let _guard = self.locks.acquire(session_id).await?;
        let checkpoint = self.store.latest(session_id).await?;
        let at_terminal = self
            .registry
            .get(checkpoint.current_step)
            .is_some_and(|def| def.is_terminal());
        if !at_terminal {
            return Err(TriageError::WorkflowIncomplete {
                session_id: session_id.to_string(),
                step: checkpoint.current_step,
            });
        }

        let ids = submitter
            .submit(session_id, &checkpoint.state.biomarkers)
            .await?;
        tracing::info!(session_id, records = ids.len(), "records submitted");

        let mut state = checkpoint.state.clone();
        state.external_record_ids = ids;
        self.write(&checkpoint, state, checkpoint.current_step, None)
            .await
    }

    pub async fn latest(&self, session_id: &str) -> Result<Checkpoint, TriageError> {
        Ok(self.store.latest(session_id).await?)
    }

    pub async fn history(&self, session_id: &str) -> Result<Vec<Checkpoint>, TriageError> {
        Ok(self.store.history(session_id).await?)
    }

    pub fn registry(&self) -> &StepRegistry {
        &self.registry
    }

    async fn run(&self, mut checkpoint: Checkpoint) -> Result<Checkpoint, TriageError> {
        let mut executed = 0usize;

        loop {
            let step = checkpoint.current_step;
            let def = self
                .registry
                .get(step)
                .ok_or_else(|| TriageError::StepFailed {
                    step,
                    kind: FailureKind::UnknownStep,
                    detail: format!("checkpoint names unregistered step {}", step),
                })?;

            let (handler, route) = match &def.node {
                StepNode::Terminal => {
                    self.emit(SessionEvent::Completed {
                        session_id: checkpoint.session_id.clone(),
                    });
                    return Ok(checkpoint);
                }
                StepNode::Gate(gate_def) => {
                    if checkpoint.pending_interrupt.is_none() {
                        checkpoint = self
                            .write(&checkpoint, checkpoint.state.clone(), step, Some(gate_def.kind))
                            .await?;
                    }
                    self.emit_paused(&checkpoint, gate_def.kind);
                    return Ok(checkpoint);
                }
                StepNode::Task { handler, route } => (handler.clone(), *route),
            };

            if executed >= self.max_steps {
                return Err(TriageError::StepFailed {
                    step,
                    kind: FailureKind::StepLimit,
                    detail: format!("stopped after {} steps in one call", executed),
                });
            }
            executed += 1;

            let span = tracing::info_span!(
                "step",
                session_id = %checkpoint.session_id,
                step = %step,
                sequence = checkpoint.sequence
            );
            let started = std::time::Instant::now();
            let result = handler
                .run(checkpoint.state.clone())
                .instrument(span)
                .await;
            let elapsed_ms = started.elapsed().as_millis() as u64;

            match result {
                StepResult::Advance(state) => {
                    let next = route(&state);
                    self.registry.check_transition(step, next)?;
                    tracing::info!(
                        session_id = %checkpoint.session_id,
                        step = %step,
                        next = %next,
                        elapsed_ms,
                        "step completed"
                    );
                    let pending = self.registry.pending_at(next);
                    checkpoint = self.write(&checkpoint, state, next, pending).await?;
                    if let Some(kind) = pending {
                        self.emit_paused(&checkpoint, kind);
                        return Ok(checkpoint);
                    }
                }
                StepResult::Pause(state, kind) => {
                    checkpoint = self.write(&checkpoint, state, step, Some(kind)).await?;
                    self.emit_paused(&checkpoint, kind);
                    return Ok(checkpoint);
                }
                StepResult::Fail { kind, detail } => {
                    tracing::warn!(
                        session_id = %checkpoint.session_id,
                        step = %step,
                        failure = %kind,
                        elapsed_ms,
                        "step failed: {}",
                        detail
                    );
                    self.emit(SessionEvent::StepFailed {
                        session_id: checkpoint.session_id.clone(),
                        step,
                        kind,
                        detail: detail.clone(),
                    });
                    return Err(TriageError::StepFailed { step, kind, detail });
                }
            }
        }
    }

    /// Append the successor of `prev`. Timestamps never go backwards.
    async fn write(
        &self,
        prev: &Checkpoint,
        mut state: WorkflowState,
        step: StepId,
        pending: Option<InterruptKind>,
    ) -> Result<Checkpoint, TriageError> {
        let timestamp = Utc::now().max(prev.timestamp);
        state.updated_at = timestamp;

        let next = Checkpoint {
            session_id: prev.session_id.clone(),
            sequence: prev.sequence + 1,
            timestamp,
            current_step: step,
            pending_interrupt: pending,
            state,
        };
        if let Err(err) = self.store.append(next.clone()).await {
            tracing::error!(
                session_id = %prev.session_id,
                sequence = next.sequence,
                "checkpoint append failed: {}",
                err
            );
            return Err(err.into());
        }
        tracing::debug!(
            session_id = %next.session_id,
            sequence = next.sequence,
            step = %step,
            "checkpoint written"
        );
        self.emit_written(&next);
        Ok(next)
    }

    fn emit_written(&self, checkpoint: &Checkpoint) {
        self.emit(SessionEvent::CheckpointWritten {
            session_id: checkpoint.session_id.clone(),
            sequence: checkpoint.sequence,
            step: checkpoint.current_step,
            pending_interrupt: checkpoint.pending_interrupt,
        });
    }

    fn emit_paused(&self, checkpoint: &Checkpoint, kind: InterruptKind) {
        tracing::info!(
            session_id = %checkpoint.session_id,
            interrupt = %kind,
            "awaiting approval"
        );
        self.emit(SessionEvent::Paused {
            session_id: checkpoint.session_id.clone(),
            kind,
        });
    }

    fn emit(&self, event: SessionEvent) {
        if let Some(tx) = &self.events {
            // No subscribers is fine.
            let _ = tx.send(event);
        }
    }
}
