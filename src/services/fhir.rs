//! Submission of interpreted biomarkers as FHIR R4 Observations.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};

use super::{RecordSubmitter, RetryPolicy, status_error, transport_error};
use crate::config::RecordsSection;
use crate::errors::CollaboratorError;
use crate::models::{Biomarker, BiomarkerStatus};

const SERVICE: &str = "record store";
const FHIR_JSON: &str = "application/fhir+json";
const IDENTIFIER_SYSTEM: &str = "urn:labtriage:observation";

/// LOINC code and display for known biomarker keys.
fn loinc(key: &str) -> (&'static str, &'static str) {
    match key {
        "glucose" => ("2339-0", "Glucose [Mass/volume] in Blood"),
        "cholesterol" | "total_cholesterol" => ("2093-3", "Cholesterol [Mass/volume] in Serum or Plasma"),
        "hdl" | "hdl_cholesterol" => ("2085-9", "HDL Cholesterol"),
        "ldl" | "ldl_cholesterol" => ("2089-1", "LDL Cholesterol"),
        "triglycerides" => ("2571-8", "Triglyceride [Mass/volume] in Serum or Plasma"),
        "creatinine" => ("2160-0", "Creatinine [Mass/volume] in Serum or Plasma"),
        "hemoglobin" => ("718-7", "Hemoglobin [Mass/volume] in Blood"),
        "tsh" => ("3016-3", "Thyrotropin [Units/volume] in Serum or Plasma"),
        _ => ("33747-0", "General laboratory studies"),
    }
}

fn interpretation_code(status: BiomarkerStatus) -> (&'static str, &'static str) {
    match status {
        BiomarkerStatus::Normal => ("N", "Normal"),
        BiomarkerStatus::High => ("H", "High"),
        BiomarkerStatus::Low => ("L", "Low"),
        BiomarkerStatus::Critical => ("HH", "Critical high"),
    }
}

/// Build the Observation resource for one biomarker.
pub fn observation(session_id: &str, key: &str, biomarker: &Biomarker) -> Value {
    let (code, display) = loinc(key);
    let (interp_code, interp_display) = interpretation_code(biomarker.status);

    let mut resource = json!({
        "resourceType": "Observation",
        "status": "final",
        "identifier": [{
            "system": IDENTIFIER_SYSTEM,
            "value": format!("{}-{}", session_id, key),
        }],
        "category": [{
            "coding": [{
                "system": "http://terminology.hl7.org/CodeSystem/observation-category",
                "code": "laboratory",
                "display": "Laboratory",
            }]
        }],
        "code": {
            "coding": [{"system": "http://loinc.org", "code": code, "display": display}],
            "text": biomarker.name,
        },
        "valueQuantity": {
            "value": biomarker.value,
            "unit": biomarker.unit,
        },
        "interpretation": [{
            "coding": [{
                "system": "http://terminology.hl7.org/CodeSystem/v3-ObservationInterpretation",
                "code": interp_code,
                "display": interp_display,
            }]
        }],
    });

    if biomarker.normal_range_min.is_some() || biomarker.normal_range_max.is_some() {
        let mut range = serde_json::Map::new();
        if let Some(low) = biomarker.normal_range_min {
            range.insert("low".into(), json!({"value": low, "unit": biomarker.unit}));
        }
        if let Some(high) = biomarker.normal_range_max {
            range.insert("high".into(), json!({"value": high, "unit": biomarker.unit}));
        }
        resource["referenceRange"] = json!([Value::Object(range)]);
    }
    if let Some(note) = &biomarker.interpretation {
        resource["note"] = json!([{"text": note}]);
    }
    resource
}

#[derive(Deserialize)]
struct Created {
    id: Option<String>,
}

pub struct FhirSubmitter {
    client: reqwest::Client,
    endpoint: String,
    retry: RetryPolicy,
}

impl FhirSubmitter {
    pub fn new(section: &RecordsSection) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(section.timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            endpoint: format!("{}/Observation", section.fhir_base_url.trim_end_matches('/')),
            retry: RetryPolicy::new(section.max_retries),
        })
    }

    async fn create(&self, identifier: &str, resource: &Value) -> Result<String, CollaboratorError> {
        // Conditional create: resubmitting a session returns the existing resource.
        let resp = self
            .client
            .post(&self.endpoint)
            .header(reqwest::header::CONTENT_TYPE, FHIR_JSON)
            .header(reqwest::header::ACCEPT, FHIR_JSON)
            .header("If-None-Exist", format!("identifier={}|{}", IDENTIFIER_SYSTEM, identifier))
            .body(resource.to_string())
            .send()
            .await
            .map_err(|e| transport_error(SERVICE, e))?;

        let status = resp.status();
        let body = resp.text().await.map_err(|e| transport_error(SERVICE, e))?;
        if !status.is_success() {
            return Err(status_error(SERVICE, status, &body));
        }

        serde_json::from_str::<Created>(&body)
            .ok()
            .and_then(|c| c.id)
            .ok_or_else(|| CollaboratorError::Malformed {
                service: SERVICE,
                message: "created resource has no id".into(),
            })
    }
}

#[async_trait]
impl RecordSubmitter for FhirSubmitter {
    async fn submit(
        &self,
        session_id: &str,
        biomarkers: &BTreeMap<String, Biomarker>,
    ) -> Result<Vec<String>, CollaboratorError> {
        let mut ids = Vec::with_capacity(biomarkers.len());
        for (key, biomarker) in biomarkers {
            let resource = observation(session_id, key, biomarker);
            let identifier = format!("{}-{}", session_id, key);
            let id = self
                .retry
                .run(SERVICE, || self.create(&identifier, &resource))
                .await?;
            tracing::debug!(session_id, biomarker = %key, record_id = %id, "submitted observation");
            ids.push(id);
        }
        Ok(ids)
    }
}
