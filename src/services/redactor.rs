use std::sync::LazyLock;

use regex::Regex;

use super::PiiRedactor;

// Applied in order: labelled fields first, then free-floating patterns.
// SSNs and card numbers run before phone numbers so their digits are
// already masked when the phone pattern looks at them.
static PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (
            r"(?m)\b((?i:patient(?:\s+name)?|name))\s*:[ \t]*[A-Z][A-Za-z'\-]+(?:,?[ \t]+[A-Z][A-Za-z'\-\.]*)*",
            "${1}: [PATIENT_NAME]",
        ),
        (
            r"\b((?i:mrn|medical\s+record\s+(?:number|no\.?)|patient\s+id))\s*[:#]?[ \t]*[A-Za-z0-9\-]{4,}",
            "${1}: [MRN]",
        ),
        (
            r"\b((?i:dob|date\s+of\s+birth))\s*:?[ \t]*\d{1,4}[/\-.]\d{1,2}[/\-.]\d{1,4}",
            "${1}: [DATE]",
        ),
        (r"[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}", "[EMAIL]"),
        (r"\b\d{3}-\d{2}-\d{4}\b", "[SSN]"),
        (r"\b(?:\d{4}[ \-]?){3}\d{4}\b", "[CARD]"),
        (r"\b(?:\d{1,3}\.){3}\d{1,3}\b", "[IP]"),
        (
            r"(?:\+?1[ .\-]?)?(?:\(\d{3}\)|\b\d{3})[ .\-]?\d{3}[ .\-]\d{4}\b",
            "[PHONE]",
        ),
        (r"\b\d{4}-\d{2}-\d{2}\b", "[DATE]"),
        (r"\b\d{1,2}/\d{1,2}/\d{2,4}\b", "[DATE]"),
    ]
    .into_iter()
    .map(|(pattern, replacement)| {
        (
            Regex::new(pattern).expect("redaction pattern must compile"),
            replacement,
        )
    })
    .collect()
});

/// Regex-based masking of identifiers. Runs entirely in-process.
pub struct PatternRedactor;

impl PiiRedactor for PatternRedactor {
    fn redact(&self, text: &str) -> String {
        PATTERNS
            .iter()
            .fold(text.to_string(), |acc, (re, replacement)| {
                re.replace_all(&acc, *replacement).into_owned()
            })
    }
}
