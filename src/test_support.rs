//! Fakes and fixtures shared by unit tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{Notify, broadcast};

use crate::errors::{CollaboratorError, StoreError};
use crate::models::{Biomarker, BiomarkerStatus, SpecialistResult};
use crate::orchestrator::registry::StepRegistry;
use crate::orchestrator::{Engine, EngineConfig, SessionEvent, Supervisor};
use crate::services::{
    Interpretation, InterpretationModel, PatternRedactor, PiiRedactor, PlainTextExtractor,
    RecordSubmitter, ResultsAssistant, SpecialistLocator, TextExtractor,
};
use crate::steps::{InterpretStep, RedactStep, SafetyAuditStep, SpecialistScoutStep};
use crate::store::{Checkpoint, CheckpointStore, SqliteStore};

pub const GLUCOSE_REPORT: &str = "Patient: Jane Doe\nMRN: 55501234\nGlucose 130 mg/dL 70-99\n";

fn biomarker(name: &str, value: f64, min: f64, max: f64, status: BiomarkerStatus) -> Biomarker {
    Biomarker {
        name: name.into(),
        value,
        unit: "mg/dL".into(),
        normal_range_min: Some(min),
        normal_range_max: Some(max),
        status,
        interpretation: None,
    }
}

/// A model that reports fasting glucose above range.
pub fn glucose_high() -> FakeModel {
    let mut map = BTreeMap::new();
    map.insert(
        "glucose".to_string(),
        biomarker("Glucose", 130.0, 70.0, 99.0, BiomarkerStatus::High),
    );
    FakeModel::new(Interpretation::from_biomarkers(map))
}

/// A model that reports every value within range.
pub fn all_normal() -> FakeModel {
    let mut map = BTreeMap::new();
    map.insert(
        "sodium".to_string(),
        biomarker("Sodium", 140.0, 135.0, 145.0, BiomarkerStatus::Normal),
    );
    FakeModel::new(Interpretation::from_biomarkers(map))
}

// ── Interpretation model ──────────────────────────────────────────────

/// Lets a test observe a model call in flight and decide when it returns.
#[derive(Default)]
pub struct Hold {
    pub entered: Notify,
    pub release: Notify,
}

pub struct FakeModel {
    reply: Interpretation,
    calls: AtomicUsize,
    failures: AtomicUsize,
    hold: Mutex<Option<Arc<Hold>>>,
}

impl FakeModel {
    pub fn new(reply: Interpretation) -> Self {
        Self {
            reply,
            calls: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
            hold: Mutex::new(None),
        }
    }

    /// Fail the next `n` calls with a transient error.
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Block the next call until `release` is notified.
    pub fn hold(&self) -> Arc<Hold> {
        let hold = Arc::new(Hold::default());
        *self.hold.lock().unwrap() = Some(hold.clone());
        hold
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InterpretationModel for FakeModel {
    async fn interpret(&self, _redacted_text: &str) -> Result<Interpretation, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let hold = self.hold.lock().unwrap().take();
        if let Some(hold) = hold {
            hold.entered.notify_one();
            hold.release.notified().await;
        }
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(CollaboratorError::Transient {
                service: "fake model",
                message: "HTTP 503".into(),
            });
        }
        Ok(self.reply.clone())
    }
}

// ── Other collaborators ───────────────────────────────────────────────

#[derive(Default)]
pub struct FakeRedactor {
    calls: AtomicUsize,
}

impl FakeRedactor {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl PiiRedactor for FakeRedactor {
    fn redact(&self, text: &str) -> String {
        self.calls.fetch_add(1, Ordering::SeqCst);
        PatternRedactor.redact(text)
    }
}

#[derive(Default)]
pub struct FakeLocator {
    calls: AtomicUsize,
    last: Mutex<Option<(String, Option<String>)>>,
}

impl FakeLocator {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_specialty(&self) -> Option<String> {
        self.last.lock().unwrap().as_ref().map(|(s, _)| s.clone())
    }

    pub fn last_location(&self) -> Option<String> {
        self.last.lock().unwrap().as_ref().and_then(|(_, l)| l.clone())
    }
}

#[async_trait]
impl SpecialistLocator for FakeLocator {
    async fn search(
        &self,
        specialty: &str,
        _condition: Option<&str>,
        location: Option<&str>,
    ) -> Result<Vec<SpecialistResult>, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last.lock().unwrap() = Some((specialty.to_string(), location.map(String::from)));
        Ok(vec![SpecialistResult {
            name: format!("Dr. {}", specialty),
            specialty: specialty.to_string(),
            location: location.unwrap_or("Anywhere").to_string(),
            distance: Some("1.2 mi".into()),
            rating: Some(4.8),
            url: None,
        }])
    }
}

#[derive(Default)]
pub struct FakeSubmitter {
    calls: AtomicUsize,
}

impl FakeSubmitter {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecordSubmitter for FakeSubmitter {
    async fn submit(
        &self,
        _session_id: &str,
        biomarkers: &BTreeMap<String, Biomarker>,
    ) -> Result<Vec<String>, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(biomarkers.keys().map(|k| format!("obs-{}", k)).collect())
    }
}

/// Records what it was asked and echoes a canned answer.
#[derive(Default)]
pub struct FakeAssistant {
    calls: AtomicUsize,
    fail: AtomicBool,
    last: Mutex<Option<(String, String)>>,
}

impl FakeAssistant {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Fail the next call with a transient error.
    pub fn fail_next(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    pub fn last_context(&self) -> Option<String> {
        self.last.lock().unwrap().as_ref().map(|(c, _)| c.clone())
    }

    pub fn last_question(&self) -> Option<String> {
        self.last.lock().unwrap().as_ref().map(|(_, q)| q.clone())
    }
}

#[async_trait]
impl ResultsAssistant for FakeAssistant {
    async fn answer(&self, results: &str, question: &str) -> Result<String, CollaboratorError> {
        if self.fail.swap(false, Ordering::SeqCst) {
            return Err(CollaboratorError::Transient {
                service: "fake assistant",
                message: "HTTP 503".into(),
            });
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last.lock().unwrap() = Some((results.to_string(), question.to_string()));
        Ok(format!("You asked: {}", question))
    }
}

// ── Store ─────────────────────────────────────────────────────────────

/// Wraps a real store and fails appends on demand.
pub struct FlakyStore {
    inner: Arc<dyn CheckpointStore>,
    fail: AtomicBool,
    /// Appends allowed before failing; `usize::MAX` means unlimited.
    remaining: AtomicUsize,
}

impl FlakyStore {
    pub fn new(inner: Arc<dyn CheckpointStore>) -> Self {
        Self {
            inner,
            fail: AtomicBool::new(false),
            remaining: AtomicUsize::new(usize::MAX),
        }
    }

    pub fn fail_appends(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Let `n` more appends through, then fail every later one.
    pub fn fail_after(&self, n: usize) {
        self.remaining.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl CheckpointStore for FlakyStore {
    async fn append(&self, checkpoint: Checkpoint) -> Result<(), StoreError> {
        let exhausted = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| match n {
                usize::MAX => Some(n),
                _ => n.checked_sub(1),
            })
            .is_err();
        if exhausted || self.fail.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("disk I/O error".into()));
        }
        self.inner.append(checkpoint).await
    }

    async fn latest(&self, session_id: &str) -> Result<Checkpoint, StoreError> {
        self.inner.latest(session_id).await
    }

    async fn history(&self, session_id: &str) -> Result<Vec<Checkpoint>, StoreError> {
        self.inner.history(session_id).await
    }
}

// ── Harness ───────────────────────────────────────────────────────────

/// An engine over fakes, with handles to every fake for assertions.
pub struct Harness {
    pub engine: Arc<Engine>,
    pub model: Arc<FakeModel>,
    pub redactor: Arc<FakeRedactor>,
    pub locator: Arc<FakeLocator>,
    pub submitter: Arc<FakeSubmitter>,
    pub assistant: Arc<FakeAssistant>,
    pub extractor: Arc<dyn TextExtractor>,
    pub store: Arc<FlakyStore>,
    config: EngineConfig,
}

impl Harness {
    pub fn new(model: FakeModel) -> Self {
        Self::with_config(model, EngineConfig::default())
    }

    pub fn with_config(model: FakeModel, config: EngineConfig) -> Self {
        let store = Arc::new(FlakyStore::new(Arc::new(
            SqliteStore::in_memory().expect("in-memory store"),
        )));
        Self::build(model, store, config)
    }

    pub fn with_store(model: FakeModel, store: Arc<FlakyStore>) -> Self {
        Self::build(model, store, EngineConfig::default())
    }

    fn build(model: FakeModel, store: Arc<FlakyStore>, config: EngineConfig) -> Self {
        let model = Arc::new(model);
        let redactor = Arc::new(FakeRedactor::default());
        let locator = Arc::new(FakeLocator::default());
        let engine = engine_over(&store, &model, &redactor, &locator, &config, None);
        Self {
            engine,
            model,
            redactor,
            locator,
            submitter: Arc::new(FakeSubmitter::default()),
            assistant: Arc::new(FakeAssistant::default()),
            extractor: Arc::new(PlainTextExtractor),
            store,
            config,
        }
    }

    /// A supervisor over this harness's engine and fakes.
    pub fn supervisor(&self) -> Supervisor {
        Supervisor::new(
            self.engine.clone(),
            self.extractor.clone(),
            self.redactor.clone(),
            self.submitter.clone(),
            self.assistant.clone(),
        )
    }

    /// Rebuild the engine so it publishes events on `tx`.
    pub fn with_events(mut self, tx: broadcast::Sender<SessionEvent>) -> Self {
        self.engine = engine_over(
            &self.store,
            &self.model,
            &self.redactor,
            &self.locator,
            &self.config,
            Some(tx),
        );
        self
    }
}

fn engine_over(
    store: &Arc<FlakyStore>,
    model: &Arc<FakeModel>,
    redactor: &Arc<FakeRedactor>,
    locator: &Arc<FakeLocator>,
    config: &EngineConfig,
    events: Option<broadcast::Sender<SessionEvent>>,
) -> Arc<Engine> {
    let registry = StepRegistry::triage(
        Arc::new(RedactStep::new(redactor.clone())),
        Arc::new(InterpretStep::new(model.clone())),
        Arc::new(SpecialistScoutStep::new(locator.clone(), None)),
        Arc::new(SafetyAuditStep),
    )
    .expect("triage registry");
    let mut engine = Engine::new(store.clone(), Arc::new(registry), config.clone());
    if let Some(tx) = events {
        engine = engine.with_event_channel(tx);
    }
    Arc::new(engine)
}

/// Serve `app` on an ephemeral local port and return its base URL.
pub async fn serve_router(app: axum::Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}
