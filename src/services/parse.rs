//! Lenient parsing of model output into biomarkers.
//!
//! Chat models wrap JSON in prose or code fences, leave trailing commas and
//! occasionally truncate the closing braces when they hit the token limit.
//! Everything here tolerates that; anything still unparseable becomes a
//! `Malformed` collaborator error at the call site.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

use crate::models::{Biomarker, BiomarkerStatus, biomarker_key};

static TRAILING_COMMA: LazyLock<Regex> = LazyLock::new(|| Regex::new(r",\s*([}\]])").unwrap());
static NUMBER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"-?\d+(?:\.\d+)?").unwrap());
static RANGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(-?\d+(?:\.\d+)?)\s*(?:-|–|to)\s*(-?\d+(?:\.\d+)?)").unwrap()
});

/// Pull the JSON payload out of a model response.
///
/// Prefers a fenced code block, then the outermost object. When the object
/// is never closed, missing brackets are appended.
pub fn extract_json(response: &str) -> Option<String> {
    let body = fenced_block(response).unwrap_or(response);
    let start = body.find(['{', '['])?;
    let candidate = &body[start..];

    let mut stack = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    let mut end = None;

    for (i, ch) in candidate.char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                stack.pop();
                if stack.is_empty() {
                    end = Some(i + ch.len_utf8());
                    break;
                }
            }
            _ => {}
        }
    }

    let mut json = match end {
        Some(end) => candidate[..end].to_string(),
        None => {
            let mut repaired = candidate.trim_end().to_string();
            if in_string {
                repaired.push('"');
            }
            repaired.extend(stack.iter().rev());
            repaired
        }
    };
    json = TRAILING_COMMA.replace_all(&json, "$1").into_owned();
    Some(json)
}

fn fenced_block(response: &str) -> Option<&str> {
    let start = response.find("```")?;
    let after = &response[start + 3..];
    // Skip the language tag on the opening fence.
    let after = after.strip_prefix("json").unwrap_or(after);
    let end = after.find("```").unwrap_or(after.len());
    Some(&after[..end])
}

/// Parse model output into a biomarker map keyed by [`biomarker_key`].
///
/// Accepts `{"biomarkers": [...]}`, `{"biomarkers": {"name": {...}}}`, a bare
/// array, or a bare object keyed by name. Entries without a usable numeric
/// value are skipped.
pub fn parse_biomarker_json(response: &str) -> Result<BTreeMap<String, Biomarker>, String> {
    let json = extract_json(response).ok_or_else(|| "no JSON found in response".to_string())?;
    let value: Value =
        serde_json::from_str(&json).map_err(|e| format!("invalid JSON in response: {}", e))?;

    let container = match &value {
        Value::Object(obj) => lookup(obj, &["biomarkers", "results", "lab_results"]).unwrap_or(&value),
        other => other,
    };

    let mut entries: Vec<(Option<&str>, &Map<String, Value>)> = Vec::new();
    match container {
        Value::Array(items) => {
            entries.extend(items.iter().filter_map(Value::as_object).map(|o| (None, o)));
        }
        Value::Object(obj) => {
            entries.extend(
                obj.iter()
                    .filter_map(|(k, v)| v.as_object().map(|o| (Some(k.as_str()), o))),
            );
        }
        _ => return Err("expected a list of biomarkers".to_string()),
    }

    let mut biomarkers = BTreeMap::new();
    for (fallback_name, obj) in entries {
        if let Some(biomarker) = biomarker_from_object(fallback_name, obj) {
            biomarkers.insert(biomarker_key(&biomarker.name), biomarker);
        }
    }
    Ok(biomarkers)
}

fn biomarker_from_object(fallback_name: Option<&str>, obj: &Map<String, Value>) -> Option<Biomarker> {
    let name = lookup(obj, &["name", "biomarker", "test", "test_name"])
        .and_then(Value::as_str)
        .or(fallback_name)?
        .trim()
        .to_string();
    if name.is_empty() {
        return None;
    }

    let value = lookup(obj, &["value", "result"]).and_then(number_of)?;
    let unit = lookup(obj, &["unit", "units"])
        .and_then(Value::as_str)
        .unwrap_or_default()
        .trim()
        .to_string();

    let (mut min, mut max) = lookup(obj, &["normal_range", "reference_range", "range"])
        .and_then(Value::as_str)
        .map(parse_range)
        .unwrap_or((None, None));
    if let Some(v) = lookup(obj, &["normal_range_min", "range_min", "min"]).and_then(number_of) {
        min = Some(v);
    }
    if let Some(v) = lookup(obj, &["normal_range_max", "range_max", "max"]).and_then(number_of) {
        max = Some(v);
    }

    let status = lookup(obj, &["status", "flag"])
        .and_then(Value::as_str)
        .and_then(|s| s.parse::<BiomarkerStatus>().ok())
        .unwrap_or_else(|| BiomarkerStatus::from_range(value, min, max));

    let interpretation = lookup(obj, &["interpretation", "note", "comment"])
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    Some(Biomarker {
        name,
        value,
        unit,
        normal_range_min: min,
        normal_range_max: max,
        status,
        interpretation,
    })
}

/// Case-insensitive field lookup over a list of aliases.
fn lookup<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|key| {
        obj.iter()
            .find(|(k, v)| k.eq_ignore_ascii_case(key) && !v.is_null())
            .map(|(_, v)| v)
    })
}

fn number_of(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => parse_number(s),
        _ => None,
    }
}

/// First number in a string such as `"141 mmol/L"` or `"< 41"`.
pub fn parse_number(text: &str) -> Option<f64> {
    NUMBER
        .find(&text.replace(',', ""))
        .and_then(|m| m.as_str().parse().ok())
}

/// Parse a printed reference range: `135-145`, `<100`, `>40`, `0.4 to 4.0`.
pub fn parse_range(text: &str) -> (Option<f64>, Option<f64>) {
    let text = text.trim();
    if let Some(caps) = RANGE.captures(text) {
        return (caps[1].parse().ok(), caps[2].parse().ok());
    }
    if let Some(rest) = text.strip_prefix('<') {
        return (None, parse_number(rest.trim_start_matches('=')));
    }
    if let Some(rest) = text.strip_prefix('>') {
        return (parse_number(rest.trim_start_matches('=')), None);
    }
    (None, None)
}
