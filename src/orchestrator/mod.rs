//! Orchestration core.
//!
//! | Module       | Role                                                        |
//! |--------------|-------------------------------------------------------------|
//! | `registry`   | the graph as a table of steps, edges and gates              |
//! | `gate`       | pause/resume of human-approval interrupts                   |
//! | `locks`      | one traversal per session at a time                         |
//! | `engine`     | runs steps and appends checkpoints                          |
//! | `supervisor` | validated, error-coded boundary used by HTTP and CLI        |

pub mod engine;
pub mod gate;
pub mod locks;
pub mod registry;
pub mod supervisor;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::broadcast;

pub use engine::{Engine, EngineConfig, SessionEvent};
pub use registry::StepRegistry;
pub use supervisor::{
    ChatReply, ErrorCode, HistoryEntry, SessionStatus, SessionView, Supervisor, SupervisorError,
};

use crate::config::TriageConfig;
use crate::services::Services;
use crate::steps::{InterpretStep, RedactStep, SafetyAuditStep, SpecialistScoutStep};
use crate::store;

/// Wire the triage graph over the given collaborators.
pub fn triage_registry(services: &Services, default_location: Option<String>) -> Result<StepRegistry> {
    StepRegistry::triage(
        Arc::new(RedactStep::new(services.redactor.clone())),
        Arc::new(InterpretStep::new(services.interpreter.clone())),
        Arc::new(SpecialistScoutStep::new(
            services.locator.clone(),
            default_location,
        )),
        Arc::new(SafetyAuditStep),
    )
    .context("Invalid step registry")
}

/// Build a supervisor from configuration: store, collaborators, graph, engine.
pub fn build_supervisor(
    config: &TriageConfig,
    events: Option<broadcast::Sender<SessionEvent>>,
) -> Result<Supervisor> {
    let store = store::open_store(config.toml.store.backend, &config.store_path())
        .context("Failed to open checkpoint store")?;
    let services = Services::from_config(config)?;
    let registry = triage_registry(&services, config.toml.specialists.default_location.clone())?;

    let engine_config = EngineConfig {
        session_lock_timeout: Duration::from_millis(config.toml.engine.session_lock_timeout_ms),
        max_steps_per_call: config.toml.engine.max_steps_per_call,
    };
    let mut engine = Engine::new(store, Arc::new(registry), engine_config);
    if let Some(tx) = events {
        engine = engine.with_event_channel(tx);
    }

    Ok(Supervisor::new(
        Arc::new(engine),
        services.extractor,
        services.redactor,
        services.submitter,
        services.assistant,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{InterpreterProvider, StoreBackend, TriageToml};
    use crate::models::{Decision, StepId};

    fn offline_config(dir: &std::path::Path, backend: StoreBackend) -> TriageConfig {
        let mut toml = TriageToml::default();
        toml.store.backend = backend;
        toml.interpreter.provider = InterpreterProvider::Rules;
        toml.specialists.directory.push(crate::config::DirectoryEntry {
            name: "Dr. Endo".into(),
            specialty: "Endocrinologist".into(),
            location: "San Francisco 94110".into(),
            distance: None,
            rating: Some(4.8),
            url: None,
        });
        TriageConfig {
            project_dir: dir.to_path_buf(),
            data_dir: dir.join(".labtriage"),
            toml,
            verbose: false,
        }
    }

    #[tokio::test]
    async fn test_built_supervisor_runs_offline_for_both_backends() {
        for backend in [StoreBackend::Sqlite, StoreBackend::Jsonl] {
            let dir = tempfile::tempdir().unwrap();
            let sup = build_supervisor(&offline_config(dir.path(), backend), None).unwrap();

            let id = sup
                .create("Glucose 130 mg/dL 70-99\nSodium 140 mmol/L 135-145", Some("94110"))
                .await
                .unwrap()
                .session_id;
            let paused = sup.advance(&id).await.unwrap();
            assert_eq!(paused.current_step, StepId::ApproveSpecialistSearch);

            let done = sup.resume(&id, Decision::Approve, None).await.unwrap();
            assert_eq!(done.status, SessionStatus::Complete);
            assert_eq!(done.state.specialist_results.len(), 1);
            assert_eq!(done.state.specialist_results[0].name, "Dr. Endo");
        }
    }

    #[tokio::test]
    async fn test_state_survives_rebuilding_the_supervisor() {
        let dir = tempfile::tempdir().unwrap();
        let config = offline_config(dir.path(), StoreBackend::Sqlite);

        let id = {
            let sup = build_supervisor(&config, None).unwrap();
            let id = sup
                .create("Glucose 130 mg/dL 70-99", None)
                .await
                .unwrap()
                .session_id;
            sup.advance(&id).await.unwrap();
            id
        };

        let sup = build_supervisor(&config, None).unwrap();
        let view = sup.get_state(&id).await.unwrap();
        assert_eq!(view.current_step, StepId::ApproveSpecialistSearch);
        let done = sup.resume(&id, Decision::Deny, None).await.unwrap();
        assert_eq!(done.status, SessionStatus::Complete);
    }
}
