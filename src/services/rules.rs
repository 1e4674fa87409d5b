//! Offline interpretation: line-oriented lab report parsing and a fixed
//! referral table.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;

use super::parse::parse_range;
use super::{Interpretation, InterpretationModel, ResultsAssistant};
use crate::errors::CollaboratorError;
use crate::models::{Biomarker, BiomarkerStatus, biomarker_key};

/// `Name  value  [flag] [unit]  [flag]  range  [flag]`. The value must be
/// separated from the name by whitespace or a colon so names such as
/// `Vitamin B12` keep their digits.
static RESULT_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?P<name>[A-Za-z][A-Za-z0-9 ()/,.'\-]*?)\s*(?::\s*|\s+)(?P<value>-?\d+(?:\.\d+)?)(?P<rest>(?:\s.*)?)$")
        .unwrap()
});

static RANGE_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"-?\d+(?:\.\d+)?\s*(?:-|–|to)\s*-?\d+(?:\.\d+)?|[<>]=?\s*\d+(?:\.\d+)?").unwrap()
});

/// Referral for the first abnormal biomarker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Referral {
    pub specialty: &'static str,
    pub condition: &'static str,
}

const REFERRALS: &[(&[&str], Referral)] = &[
    (
        &["glucose", "hba1c", "a1c", "insulin"],
        Referral {
            specialty: "Endocrinologist",
            condition: "Diabetes/Glucose Management",
        },
    ),
    (
        &["cholesterol", "ldl", "hdl", "triglycerides"],
        Referral {
            specialty: "Cardiologist",
            condition: "High Cholesterol",
        },
    ),
    (
        &["creatinine", "bun", "egfr", "urea"],
        Referral {
            specialty: "Nephrologist",
            condition: "Kidney Function",
        },
    ),
    (
        &["hemoglobin", "hematocrit", "platelets", "wbc", "rbc"],
        Referral {
            specialty: "Hematologist",
            condition: "Blood Disorders",
        },
    ),
    (
        &["tsh", "t4", "t3", "thyroxine"],
        Referral {
            specialty: "Endocrinologist",
            condition: "Thyroid Function",
        },
    ),
    (
        &["alt", "ast", "bilirubin", "alkaline_phosphatase"],
        Referral {
            specialty: "Hepatologist",
            condition: "Liver Function",
        },
    ),
];

const GENERAL_REFERRAL: Referral = Referral {
    specialty: "Primary Care Physician",
    condition: "Abnormal Lab Values",
};

/// Keys up to this length only match a whole `_`-separated part of the
/// biomarker key, so `ast` does not fire on `gastrin`. Longer keys match
/// anywhere in it (`glucose` in `glucosefasting`).
const SHORT_KEY_LEN: usize = 3;

fn key_matches(biomarker_key: &str, name: &str) -> bool {
    if name.len() <= SHORT_KEY_LEN {
        biomarker_key.split('_').any(|part| part == name)
    } else {
        biomarker_key.contains(name)
    }
}

fn table_referral(biomarker_key: &str) -> Option<Referral> {
    REFERRALS
        .iter()
        .find(|(names, _)| names.iter().any(|name| key_matches(biomarker_key, name)))
        .map(|(_, referral)| *referral)
}

/// Pick a referral from the first abnormal biomarker the table knows,
/// falling back to primary care when none of them match. `None` when every
/// value is within range.
pub fn referral_for(biomarkers: &BTreeMap<String, Biomarker>) -> Option<Referral> {
    let mut abnormal = biomarkers
        .iter()
        .filter(|(_, b)| b.status.is_abnormal())
        .map(|(key, _)| key.as_str())
        .peekable();
    abnormal.peek()?;
    Some(abnormal.find_map(table_referral).unwrap_or(GENERAL_REFERRAL))
}

/// Parse a single result line. Lines without a reference range are not
/// treated as results.
pub fn parse_result_line(line: &str) -> Option<Biomarker> {
    let caps = RESULT_LINE.captures(line)?;
    let name = caps["name"].trim().trim_end_matches(':').trim().to_string();
    let value: f64 = caps["value"].parse().ok()?;
    let rest = caps.name("rest").map(|m| m.as_str()).unwrap_or_default();

    let range = RANGE_TOKEN.find(rest)?;
    let (min, max) = parse_range(range.as_str());
    if min.is_none() && max.is_none() {
        return None;
    }

    let outside_range = format!("{} {}", &rest[..range.start()], &rest[range.end()..]);
    let mut flag = None;
    let mut unit = None;
    for token in outside_range.split_whitespace() {
        let token = token.trim_matches(|c| c == '(' || c == ')' || c == '[' || c == ']');
        if token.is_empty() {
            continue;
        }
        match token.parse::<BiomarkerStatus>() {
            Ok(status) if token.len() <= 2 || token.chars().all(|c| c.is_alphabetic()) => {
                flag.get_or_insert(status);
            }
            _ if unit.is_none() && !is_label(token) => unit = Some(token.to_string()),
            _ => {}
        }
    }

    let status = flag.unwrap_or_else(|| BiomarkerStatus::from_range(value, min, max));
    Some(Biomarker {
        name,
        value,
        unit: unit.unwrap_or_default(),
        normal_range_min: min,
        normal_range_max: max,
        status,
        interpretation: None,
    })
}

fn is_label(token: &str) -> bool {
    let lowered = token.trim_end_matches(':').to_ascii_lowercase();
    matches!(lowered.as_str(), "ref" | "reference" | "range" | "normal")
}

/// Parse every result line of a report.
pub fn parse_report(text: &str) -> BTreeMap<String, Biomarker> {
    let mut biomarkers = BTreeMap::new();
    for biomarker in text.lines().filter_map(parse_result_line) {
        biomarkers
            .entry(biomarker_key(&biomarker.name))
            .or_insert(biomarker);
    }
    biomarkers
}

/// Interprets reports without a model: result lines are parsed directly and
/// referrals come from [`referral_for`].
pub struct RuleInterpreter;

#[async_trait]
impl InterpretationModel for RuleInterpreter {
    async fn interpret(&self, redacted_text: &str) -> Result<Interpretation, CollaboratorError> {
        let biomarkers = parse_report(redacted_text);
        tracing::debug!(count = biomarkers.len(), "parsed report with rules");
        Ok(Interpretation::from_biomarkers(biomarkers))
    }
}

/// Offline answers: quote the context lines the question names, or the
/// out-of-range ones when it names none.
#[async_trait]
impl ResultsAssistant for RuleInterpreter {
    async fn answer(&self, results: &str, question: &str) -> Result<String, CollaboratorError> {
        let lines: Vec<&str> = results.lines().filter(|l| !l.trim().is_empty()).collect();
        if lines.is_empty() {
            return Ok("Your report has not been interpreted yet, so there are no results to \
                       discuss. Advance the session first."
                .to_string());
        }

        let question = question.to_lowercase();
        let named: Vec<&str> = lines
            .iter()
            .copied()
            .filter(|line| {
                line.trim_start_matches("- ")
                    .split(':')
                    .next()
                    .is_some_and(|name| question.contains(&name.trim().to_lowercase()))
            })
            .collect();

        let (intro, quoted) = if !named.is_empty() {
            ("Here is what your report shows:", named)
        } else {
            let abnormal: Vec<&str> = lines
                .iter()
                .copied()
                .filter(|line| !line.ends_with("Status: normal)"))
                .collect();
            if abnormal.is_empty() {
                ("All of your results are within their normal ranges:", lines)
            } else {
                ("These results are outside their normal ranges:", abnormal)
            }
        };
        Ok(format!(
            "{}\n{}\n\nDiscuss these values with your doctor.",
            intro,
            quoted.join("\n")
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_result_line_with_range() {
        let b = parse_result_line("Glucose 130 mg/dL 70-99").unwrap();
        assert_eq!(b.name, "Glucose");
        assert_eq!(b.value, 130.0);
        assert_eq!(b.unit, "mg/dL");
        assert_eq!(b.range_label(), "70-99");
        assert_eq!(b.status, BiomarkerStatus::High);
    }

    #[test]
    fn test_parse_result_line_variants() {
        let b = parse_result_line("Vitamin B12: 150 pg/mL (ref 200-900)").unwrap();
        assert_eq!(b.name, "Vitamin B12");
        assert_eq!(b.unit, "pg/mL");
        assert_eq!(b.status, BiomarkerStatus::Low);

        let b = parse_result_line("LDL Cholesterol 160 mg/dL <100").unwrap();
        assert_eq!(b.normal_range_max, Some(100.0));
        assert_eq!(b.status, BiomarkerStatus::High);

        let b = parse_result_line("TSH 2.1 mIU/L 0.4 to 4.0").unwrap();
        assert_eq!(b.status, BiomarkerStatus::Normal);
    }

    #[test]
    fn test_explicit_flags_win() {
        let b = parse_result_line("Potassium 6.9 HH mmol/L 3.5-5.1").unwrap();
        assert_eq!(b.status, BiomarkerStatus::Critical);
        assert_eq!(b.unit, "mmol/L");

        let b = parse_result_line("Hemoglobin 6.0 g/dL 12.0-15.5 critical").unwrap();
        assert_eq!(b.status, BiomarkerStatus::Critical);
    }

    #[test]
    fn test_non_result_lines_are_ignored() {
        for line in [
            "Test Result Unit Reference Range",
            "Page 1 of 2",
            "Collected [DATE]",
            "Patient: [PATIENT_NAME]",
            "",
        ] {
            assert!(parse_result_line(line).is_none(), "{:?} parsed", line);
        }
    }

    #[test]
    fn test_referral_table() {
        let report = parse_report("Sodium 140 mmol/L 135-145\nCreatinine 2.1 mg/dL 0.6-1.2");
        let referral = referral_for(&report).unwrap();
        assert_eq!(referral.specialty, "Nephrologist");
        assert_eq!(referral.condition, "Kidney Function");

        let report = parse_report("HDL Cholesterol 30 mg/dL >40");
        assert_eq!(referral_for(&report).unwrap().specialty, "Cardiologist");

        let report = parse_report("Ferritin 5 ng/mL 15-150");
        assert_eq!(referral_for(&report), Some(GENERAL_REFERRAL));

        let report = parse_report("Sodium 140 mmol/L 135-145");
        assert_eq!(referral_for(&report), None);
    }

    #[test]
    fn test_referral_skips_abnormal_values_the_table_does_not_know() {
        // ferritin sorts before glucose but has no specialty of its own.
        let report = parse_report("Ferritin 5 ng/mL 15-150\nGlucose 130 mg/dL 70-99");
        let referral = referral_for(&report).unwrap();
        assert_eq!(referral.specialty, "Endocrinologist");
        assert_eq!(referral.condition, "Diabetes/Glucose Management");
    }

    #[test]
    fn test_referral_key_matching() {
        assert!(key_matches("glucosefasting", "glucose"));
        assert!(key_matches("fasting_glucose", "glucose"));
        assert!(key_matches("ast_sgot", "ast"));
        assert!(!key_matches("gastrin", "ast"));
        assert!(!key_matches("basalt", "alt"));
    }

    const CONTEXT: &str = "- Glucose: 130 mg/dL (Normal: 70-99 mg/dL, Status: high)\n\
                           - Sodium: 140 mmol/L (Normal: 135-145 mmol/L, Status: normal)";

    #[tokio::test]
    async fn test_offline_answer_quotes_named_biomarker() {
        let reply = RuleInterpreter.answer(CONTEXT, "What about my sodium?").await.unwrap();
        assert!(reply.contains("- Sodium: 140"));
        assert!(!reply.contains("Glucose"));
    }

    #[tokio::test]
    async fn test_offline_answer_falls_back_to_abnormal_results() {
        let reply = RuleInterpreter.answer(CONTEXT, "Should I worry?").await.unwrap();
        assert!(reply.starts_with("These results are outside"));
        assert!(reply.contains("- Glucose: 130"));
        assert!(!reply.contains("Sodium"));
    }

    #[tokio::test]
    async fn test_offline_answer_before_interpretation() {
        let reply = RuleInterpreter.answer("", "Anything wrong?").await.unwrap();
        assert!(reply.contains("not been interpreted"));
    }

    #[tokio::test]
    async fn test_rule_interpreter_summarises() {
        let interp = RuleInterpreter
            .interpret("Glucose 130 mg/dL 70-99\nSodium 140 mmol/L 135-145")
            .await
            .unwrap();
        assert_eq!(interp.biomarkers.len(), 2);
        assert!(interp.specialist_needed);
        assert_eq!(interp.specialist_type.as_deref(), Some("Endocrinologist"));
    }
}
