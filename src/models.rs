use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Step identifiers ──────────────────────────────────────────────────

/// Named node in the triage graph. Persisted in every checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepId {
    Redact,
    Interpret,
    ApproveSpecialistSearch,
    SpecialistScout,
    SafetyAudit,
    Terminal,
}

impl StepId {
    pub const ALL: [StepId; 6] = [
        StepId::Redact,
        StepId::Interpret,
        StepId::ApproveSpecialistSearch,
        StepId::SpecialistScout,
        StepId::SafetyAudit,
        StepId::Terminal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StepId::Redact => "redact",
            StepId::Interpret => "interpret",
            StepId::ApproveSpecialistSearch => "approve_specialist_search",
            StepId::SpecialistScout => "specialist_scout",
            StepId::SafetyAudit => "safety_audit",
            StepId::Terminal => "terminal",
        }
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StepId::ALL
            .into_iter()
            .find(|id| id.as_str() == s)
            .ok_or_else(|| format!("unknown step: {}", s))
    }
}

// ── Interrupts ────────────────────────────────────────────────────────

/// The external decision a paused session is waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptKind {
    SpecialistSearch,
}

impl InterruptKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InterruptKind::SpecialistSearch => "specialist_search",
        }
    }
}

impl fmt::Display for InterruptKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InterruptKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "specialist_search" => Ok(InterruptKind::SpecialistSearch),
            _ => Err(format!("unknown interrupt kind: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approve,
    Deny,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Approve => "approve",
            Decision::Deny => "deny",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Decision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "approve" | "approved" | "yes" => Ok(Decision::Approve),
            "deny" | "denied" | "no" => Ok(Decision::Deny),
            _ => Err(format!("unknown decision: {}", s)),
        }
    }
}

// ── Biomarkers ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BiomarkerStatus {
    #[default]
    Normal,
    High,
    Low,
    Critical,
}

impl BiomarkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BiomarkerStatus::Normal => "normal",
            BiomarkerStatus::High => "high",
            BiomarkerStatus::Low => "low",
            BiomarkerStatus::Critical => "critical",
        }
    }

    pub fn is_abnormal(&self) -> bool {
        !matches!(self, BiomarkerStatus::Normal)
    }

    /// Classify a value against an optional reference range.
    /// `critical` is never inferred here; only an explicit flag produces it.
    pub fn from_range(value: f64, min: Option<f64>, max: Option<f64>) -> Self {
        if max.is_some_and(|max| value > max) {
            BiomarkerStatus::High
        } else if min.is_some_and(|min| value < min) {
            BiomarkerStatus::Low
        } else {
            BiomarkerStatus::Normal
        }
    }
}

impl fmt::Display for BiomarkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BiomarkerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        match lowered.as_str() {
            "normal" | "n" | "within range" | "in range" => Ok(BiomarkerStatus::Normal),
            "high" | "h" | "elevated" | "above range" => Ok(BiomarkerStatus::High),
            "low" | "l" | "decreased" | "below range" => Ok(BiomarkerStatus::Low),
            "critical" | "hh" | "ll" | "critically high" | "critically low" | "panic" => {
                Ok(BiomarkerStatus::Critical)
            }
            _ => Err(format!("unknown biomarker status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Biomarker {
    pub name: String,
    pub value: f64,
    #[serde(default)]
    pub unit: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub normal_range_min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub normal_range_max: Option<f64>,
    #[serde(default)]
    pub status: BiomarkerStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interpretation: Option<String>,
}

impl Biomarker {
    /// Render the reference range the way lab reports print it.
    pub fn range_label(&self) -> String {
        match (self.normal_range_min, self.normal_range_max) {
            (Some(min), Some(max)) => format!("{}-{}", min, max),
            (None, Some(max)) => format!("<{}", max),
            (Some(min), None) => format!(">{}", min),
            (None, None) => String::new(),
        }
    }
}

/// Map a printed biomarker name to its map key: lowercase, `_`-separated.
pub fn biomarker_key(name: &str) -> String {
    let mut key = String::with_capacity(name.len());
    for c in name.trim().chars() {
        if c.is_alphanumeric() {
            key.extend(c.to_lowercase());
        } else if !key.ends_with('_') {
            key.push('_');
        }
    }
    key.trim_matches('_').to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpecialistResult {
    pub name: String,
    pub specialty: String,
    pub location: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

// ── Workflow state ────────────────────────────────────────────────────

/// Full payload carried between steps. Only the engine writes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub session_id: String,
    pub raw_text: String,
    /// Absent until the redaction step has run.
    #[serde(default)]
    pub redacted_text: Option<String>,

    #[serde(default)]
    pub lab_interpreted: bool,
    #[serde(default)]
    pub biomarkers: BTreeMap<String, Biomarker>,
    #[serde(default)]
    pub interpretation_summary: Option<String>,

    #[serde(default)]
    pub specialist_needed: bool,
    #[serde(default)]
    pub specialist_condition: Option<String>,
    #[serde(default)]
    pub specialist_type: Option<String>,
    #[serde(default)]
    pub patient_location: Option<String>,
    #[serde(default)]
    pub specialist_search_approved: bool,
    #[serde(default)]
    pub specialist_results: Vec<SpecialistResult>,

    #[serde(default)]
    pub safety_approved: bool,
    #[serde(default)]
    pub medical_disclaimer: Option<String>,

    /// Identifiers returned by the record store after submission.
    #[serde(default)]
    pub external_record_ids: Vec<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowState {
    pub fn new(
        session_id: impl Into<String>,
        raw_text: impl Into<String>,
        patient_location: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            raw_text: raw_text.into(),
            redacted_text: None,
            lab_interpreted: false,
            biomarkers: BTreeMap::new(),
            interpretation_summary: None,
            specialist_needed: false,
            specialist_condition: None,
            specialist_type: None,
            patient_location,
            specialist_search_approved: false,
            specialist_results: Vec::new(),
            safety_approved: false,
            medical_disclaimer: None,
            external_record_ids: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn abnormal_biomarkers(&self) -> impl Iterator<Item = (&String, &Biomarker)> {
        self.biomarkers.iter().filter(|(_, b)| b.status.is_abnormal())
    }

    pub fn has_critical(&self) -> bool {
        self.biomarkers
            .values()
            .any(|b| b.status == BiomarkerStatus::Critical)
    }
}
