//! Interpretation and results Q&A through an OpenAI-compatible chat
//! completions endpoint.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::parse::{extract_json, parse_biomarker_json};
use super::{
    Interpretation, InterpretationModel, ResultsAssistant, RetryPolicy, status_error,
    transport_error,
};
use crate::config::InterpreterSection;
use crate::errors::CollaboratorError;

const SERVICE: &str = "interpretation model";

/// Reports longer than this are reduced to result-looking lines first.
const PREPROCESS_THRESHOLD: usize = 2000;

const LAB_KEYWORDS: &[&str] = &[
    "mg/dl", "mmol", "g/dl", "u/l", "iu/l", "ng/ml", "pg/ml", "%", "range", "ref", "high", "low",
    "normal", "flag", "result",
];

const SYSTEM_PROMPT: &str = "You are a clinical laboratory assistant. Extract every biomarker \
from the lab report and reply with JSON only, no prose:\n\
{\"biomarkers\": [{\"name\": str, \"value\": number, \"unit\": str, \"normal_range\": \"min-max\", \
\"status\": \"normal|high|low|critical\", \"interpretation\": str}], \
\"summary\": str, \"specialist_type\": str|null, \"specialist_condition\": str|null}\n\
Use \"critical\" only for values the report flags as critical or panic. \
Identifiers have been replaced with placeholders such as [PATIENT_NAME]; ignore them.";

/// Answers run warmer than extraction; they are prose, not JSON.
const ASSISTANT_TEMPERATURE: f64 = 0.7;

const ASSISTANT_PROMPT: &str = "You are a knowledgeable and empathetic medical assistant helping \
a patient understand their lab results.\n\n\
Patient's lab results:\n{results}\n\n\
Answer the question directly first, then explain using the specific values above in plain \
language and why they matter. End with brief next steps when relevant, such as discussing \
a value with their doctor. Be reassuring about normal values and calm about abnormal ones. \
Do not put disclaimers or follow-up questions in the middle of the answer.";

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f64,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

/// Optional top-level fields a model may add next to the biomarker list.
#[derive(Deserialize, Default)]
struct ModelExtras {
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    specialist_type: Option<String>,
    #[serde(default)]
    specialist_condition: Option<String>,
}

pub struct ChatModelInterpreter {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    temperature: f64,
    max_tokens: u32,
    max_input_chars: usize,
    retry: RetryPolicy,
}

impl ChatModelInterpreter {
    pub fn new(section: &InterpreterSection, api_key: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(section.timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", section.base_url.trim_end_matches('/')),
            model: section.model.clone(),
            api_key,
            temperature: section.temperature,
            max_tokens: section.max_tokens,
            max_input_chars: section.max_input_chars,
            retry: RetryPolicy::new(section.max_retries),
        })
    }

    #[cfg(test)]
    fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn api_key(&self) -> Result<&str, CollaboratorError> {
        self.api_key
            .as_deref()
            .ok_or_else(|| CollaboratorError::Rejected {
                service: SERVICE,
                message: "no API key configured".into(),
            })
    }

    async fn complete(
        &self,
        api_key: &str,
        system: &str,
        user: &str,
        temperature: f64,
    ) -> Result<String, CollaboratorError> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: user,
                },
            ],
            temperature,
            max_tokens: self.max_tokens,
        };

        let resp = self
            .client
            .post(&self.endpoint)
            .bearer_auth(api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| transport_error(SERVICE, e))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(status_error(SERVICE, status, &body));
        }

        let parsed: ChatResponse = resp.json().await.map_err(|e| CollaboratorError::Malformed {
            service: SERVICE,
            message: format!("unexpected response body: {}", e),
        })?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| CollaboratorError::Malformed {
                service: SERVICE,
                message: "response contained no message content".into(),
            })
    }
}

#[async_trait]
impl InterpretationModel for ChatModelInterpreter {
    async fn interpret(&self, redacted_text: &str) -> Result<Interpretation, CollaboratorError> {
        let api_key = self.api_key()?;

        let report = preprocess(redacted_text, self.max_input_chars);
        tracing::debug!(
            model = %self.model,
            input_chars = redacted_text.len(),
            sent_chars = report.len(),
            "requesting interpretation"
        );

        let content = self
            .retry
            .run(SERVICE, || {
                self.complete(api_key, SYSTEM_PROMPT, &report, self.temperature)
            })
            .await?;

        let biomarkers = parse_biomarker_json(&content).map_err(|message| {
            CollaboratorError::Malformed {
                service: SERVICE,
                message,
            }
        })?;

        let mut interpretation = Interpretation::from_biomarkers(biomarkers);
        let extras = extract_json(&content)
            .and_then(|json| serde_json::from_str::<ModelExtras>(&json).ok())
            .unwrap_or_default();
        if let Some(summary) = extras.summary.filter(|s| !s.trim().is_empty()) {
            interpretation.summary = Some(summary);
        }
        if interpretation.specialist_needed {
            if let Some(specialty) = extras.specialist_type.filter(|s| !s.trim().is_empty()) {
                interpretation.specialist_type = Some(specialty);
            }
            if let Some(condition) = extras.specialist_condition.filter(|s| !s.trim().is_empty()) {
                interpretation.specialist_condition = Some(condition);
            }
        }
        Ok(interpretation)
    }
}

#[async_trait]
impl ResultsAssistant for ChatModelInterpreter {
    async fn answer(&self, results: &str, question: &str) -> Result<String, CollaboratorError> {
        let api_key = self.api_key()?;
        let results = if results.trim().is_empty() {
            "No biomarkers available yet."
        } else {
            results
        };
        let system = ASSISTANT_PROMPT.replace("{results}", results);
        tracing::debug!(model = %self.model, question_chars = question.len(), "answering question");

        self.retry
            .run(SERVICE, || {
                self.complete(api_key, &system, question, ASSISTANT_TEMPERATURE)
            })
            .await
    }
}

/// Keep long reports under the model's input budget: drop lines that
/// cannot hold results, then truncate on a char boundary.
pub fn preprocess(text: &str, max_chars: usize) -> String {
    let text = if text.chars().count() > PREPROCESS_THRESHOLD {
        text.lines()
            .map(str::trim)
            .filter(|line| {
                let lowered = line.to_ascii_lowercase();
                line.chars().any(|c| c.is_ascii_digit())
                    || LAB_KEYWORDS.iter().any(|k| lowered.contains(k))
            })
            .collect::<Vec<_>>()
            .join("\n")
    } else {
        text.to_string()
    };
    text.chars().take(max_chars).collect()
}
