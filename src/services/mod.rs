//! External collaborators consumed by the triage steps.
//!
//! | Collaborator       | Trait                 | Default implementation      |
//! |--------------------|-----------------------|-----------------------------|
//! | Text Extractor     | [`TextExtractor`]     | `PlainTextExtractor`        |
//! | PII Redactor       | [`PiiRedactor`]       | `PatternRedactor`           |
//! | Interpretation     | [`InterpretationModel`] | `ChatModelInterpreter`, `RuleInterpreter` |
//! | Specialist Locator | [`SpecialistLocator`] | `DirectoryLocator`          |
//! | Record Submitter   | [`RecordSubmitter`]   | `FhirSubmitter`             |
//! | Results Assistant  | [`ResultsAssistant`]  | `ChatModelInterpreter`, `RuleInterpreter` |
//!
//! Retries belong here, never in the engine: HTTP collaborators wrap their
//! calls in a [`RetryPolicy`].

pub mod directory;
pub mod extractor;
pub mod fhir;
pub mod llm;
pub mod parse;
pub mod redactor;
pub mod rules;

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::config::{InterpreterProvider, TriageConfig};
use crate::errors::CollaboratorError;
use crate::models::{Biomarker, SpecialistResult};

pub use directory::DirectoryLocator;
pub use extractor::PlainTextExtractor;
pub use fhir::FhirSubmitter;
pub use llm::ChatModelInterpreter;
pub use redactor::PatternRedactor;
pub use rules::RuleInterpreter;

#[async_trait]
pub trait TextExtractor: Send + Sync {
    /// Fails only with `UnreadableDocument`.
    async fn extract(&self, document: &[u8]) -> Result<String, CollaboratorError>;
}

/// Deterministic and in-process: identical input gives identical output.
pub trait PiiRedactor: Send + Sync {
    fn redact(&self, text: &str) -> String;
}

/// What the interpretation model extracted from a report.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Interpretation {
    pub biomarkers: BTreeMap<String, Biomarker>,
    pub specialist_needed: bool,
    pub specialist_type: Option<String>,
    pub specialist_condition: Option<String>,
    pub summary: Option<String>,
}

impl Interpretation {
    /// Derive referral and summary from the extracted biomarkers.
    pub fn from_biomarkers(biomarkers: BTreeMap<String, Biomarker>) -> Self {
        let referral = rules::referral_for(&biomarkers);
        let abnormal = biomarkers.values().filter(|b| b.status.is_abnormal()).count();
        let summary = if biomarkers.is_empty() {
            "No biomarkers could be identified in the report.".to_string()
        } else {
            format!(
                "Analyzed {} biomarker(s); {} outside the reference range.",
                biomarkers.len(),
                abnormal
            )
        };
        Self {
            specialist_needed: referral.is_some(),
            specialist_type: referral.map(|r| r.specialty.to_string()),
            specialist_condition: referral.map(|r| r.condition.to_string()),
            summary: Some(summary),
            biomarkers,
        }
    }
}

#[async_trait]
pub trait InterpretationModel: Send + Sync {
    async fn interpret(&self, redacted_text: &str) -> Result<Interpretation, CollaboratorError>;
}

#[async_trait]
pub trait SpecialistLocator: Send + Sync {
    /// May return an empty list.
    async fn search(
        &self,
        specialty: &str,
        condition: Option<&str>,
        location: Option<&str>,
    ) -> Result<Vec<SpecialistResult>, CollaboratorError>;
}

#[async_trait]
pub trait RecordSubmitter: Send + Sync {
    /// Returns the external record ids. Idempotency is the submitter's concern.
    async fn submit(
        &self,
        session_id: &str,
        biomarkers: &BTreeMap<String, Biomarker>,
    ) -> Result<Vec<String>, CollaboratorError>;
}

/// Answers a patient's free-form question about their results.
#[async_trait]
pub trait ResultsAssistant: Send + Sync {
    /// `results` is the biomarker context, one line per biomarker; empty
    /// when the session has not been interpreted yet.
    async fn answer(&self, results: &str, question: &str) -> Result<String, CollaboratorError>;
}

/// One context line per biomarker, in key order.
pub fn results_context(biomarkers: &BTreeMap<String, Biomarker>) -> String {
    biomarkers
        .values()
        .map(|b| {
            let range = b.range_label();
            format!(
                "- {}: {} {} (Normal: {} {}, Status: {})",
                b.name,
                b.value,
                b.unit,
                if range.is_empty() { "N/A" } else { range.as_str() },
                b.unit,
                b.status.as_str()
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// The collaborator set the triage graph is wired against.
#[derive(Clone)]
pub struct Services {
    pub extractor: Arc<dyn TextExtractor>,
    pub redactor: Arc<dyn PiiRedactor>,
    pub interpreter: Arc<dyn InterpretationModel>,
    pub locator: Arc<dyn SpecialistLocator>,
    pub submitter: Arc<dyn RecordSubmitter>,
    pub assistant: Arc<dyn ResultsAssistant>,
}

impl Services {
    pub fn from_config(config: &TriageConfig) -> Result<Self> {
        let toml = &config.toml;

        let (interpreter, assistant): (Arc<dyn InterpretationModel>, Arc<dyn ResultsAssistant>) =
            match toml.interpreter.provider {
                InterpreterProvider::Chat => {
                    if config.api_key().is_none() {
                        tracing::warn!(
                            env = %toml.interpreter.api_key_env,
                            "no API key configured; interpretation calls will fail"
                        );
                    }
                    let model = Arc::new(
                        ChatModelInterpreter::new(&toml.interpreter, config.api_key())
                            .context("Failed to build interpretation client")?,
                    );
                    (model.clone(), model)
                }
                InterpreterProvider::Rules => (Arc::new(RuleInterpreter), Arc::new(RuleInterpreter)),
            };

        Ok(Self {
            extractor: Arc::new(PlainTextExtractor),
            redactor: Arc::new(PatternRedactor),
            interpreter,
            locator: Arc::new(DirectoryLocator::new(toml.specialists.directory.clone())),
            submitter: Arc::new(
                FhirSubmitter::new(&toml.records).context("Failed to build FHIR client")?,
            ),
            assistant,
        })
    }
}

/// Retry transient failures with exponential backoff.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::from_millis(250),
        }
    }

    pub async fn run<T, F, Fut>(&self, service: &'static str, mut op: F) -> Result<T, CollaboratorError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CollaboratorError>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < self.max_retries => {
                    let delay = self.base_delay * 2u32.saturating_pow(attempt);
                    attempt += 1;
                    tracing::warn!(
                        service,
                        attempt,
                        max_retries = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        "retrying after error: {}",
                        err
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Classify a reqwest transport error.
pub(crate) fn transport_error(service: &'static str, err: reqwest::Error) -> CollaboratorError {
    CollaboratorError::Transient {
        service,
        message: err.to_string(),
    }
}

/// Classify a non-success HTTP status.
pub(crate) fn status_error(
    service: &'static str,
    status: reqwest::StatusCode,
    body: &str,
) -> CollaboratorError {
    let snippet: String = body.chars().take(200).collect();
    let message = format!("HTTP {}: {}", status.as_u16(), snippet);
    if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        CollaboratorError::Transient { service, message }
    } else {
        CollaboratorError::Rejected { service, message }
    }
}
