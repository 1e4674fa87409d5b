use async_trait::async_trait;

use super::SpecialistLocator;
use crate::config::DirectoryEntry;
use crate::errors::CollaboratorError;
use crate::models::SpecialistResult;

/// Searches a configured directory of specialists.
pub struct DirectoryLocator {
    entries: Vec<DirectoryEntry>,
}

impl DirectoryLocator {
    pub fn new(entries: Vec<DirectoryEntry>) -> Self {
        Self { entries }
    }
}

#[async_trait]
impl SpecialistLocator for DirectoryLocator {
    async fn search(
        &self,
        specialty: &str,
        condition: Option<&str>,
        location: Option<&str>,
    ) -> Result<Vec<SpecialistResult>, CollaboratorError> {
        let location = location.map(|l| l.trim().to_lowercase()).filter(|l| !l.is_empty());

        let mut results: Vec<SpecialistResult> = self
            .entries
            .iter()
            .filter(|e| e.specialty.eq_ignore_ascii_case(specialty.trim()))
            .filter(|e| {
                location
                    .as_deref()
                    .is_none_or(|loc| location_matches(&e.location, loc))
            })
            .map(|e| SpecialistResult {
                name: e.name.clone(),
                specialty: e.specialty.clone(),
                location: e.location.clone(),
                distance: e.distance.clone(),
                rating: e.rating,
                url: e.url.clone(),
            })
            .collect();

        // Best rated first; unrated entries keep directory order at the end.
        results.sort_by(|a, b| b.rating.unwrap_or(f64::MIN).total_cmp(&a.rating.unwrap_or(f64::MIN)));

        tracing::debug!(
            specialty,
            condition = condition.unwrap_or(""),
            found = results.len(),
            "searched specialist directory"
        );
        Ok(results)
    }
}

/// Either side containing the other, so "94110" matches
/// "San Francisco 94110" and "San Francisco, CA 94110" matches "94110".
fn location_matches(entry: &str, wanted: &str) -> bool {
    let entry = entry.to_lowercase();
    entry.contains(wanted) || wanted.contains(&entry)
}
