//! Ordered keyword rules deriving remote type and seniority from free text.

use pulse_core::{NormalizedFields, RemoteType, SeniorityLevel};

const REMOTE_TERMS: &[&str] = &["remote", "anywhere", "work from home", "wfh"];
const HYBRID_TERMS: &[&str] = &["hybrid"];

// Evaluated top to bottom, first hit wins. "Senior Staff Engineer" is senior.
const SENIORITY_RULES: &[(SeniorityLevel, &[&str])] = &[
    (SeniorityLevel::Intern, &["intern", "internship", "co-op"]),
    (
        SeniorityLevel::Entry,
        &["junior", "entry", "associate", "level 1"],
    ),
    (SeniorityLevel::Senior, &["senior", "sr", "lead", "level 4"]),
    (SeniorityLevel::Staff, &["staff", "principal", "level 5"]),
    (
        SeniorityLevel::Executive,
        &["director", "vp", "head of", "chief"],
    ),
];

pub fn normalize(title: Option<&str>, location: Option<&str>) -> NormalizedFields {
    NormalizedFields {
        remote_type: remote_type(title, location),
        seniority_level: seniority_level(title),
    }
}

/// Location and title are joined (location first) and scanned together.
pub fn remote_type(title: Option<&str>, location: Option<&str>) -> RemoteType {
    let combined = [location, title]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();

    if contains_any_term(&combined, REMOTE_TERMS) {
        RemoteType::Remote
    } else if contains_any_term(&combined, HYBRID_TERMS) {
        RemoteType::Hybrid
    } else {
        RemoteType::Onsite
    }
}

pub fn seniority_level(title: Option<&str>) -> SeniorityLevel {
    let title = title.unwrap_or_default().to_lowercase();
    SENIORITY_RULES
        .iter()
        .find(|(_, terms)| contains_any_term(&title, terms))
        .map(|(level, _)| *level)
        .unwrap_or(SeniorityLevel::Mid)
}

fn contains_any_term(haystack: &str, terms: &[&str]) -> bool {
    terms.iter().any(|term| contains_term(haystack, term))
}

/// Whole-word match: the term must not touch a letter or digit on either side.
fn contains_term(haystack: &str, term: &str) -> bool {
    haystack.match_indices(term).any(|(start, matched)| {
        let before = haystack[..start].chars().next_back();
        let after = haystack[start + matched.len()..].chars().next();
        !before.is_some_and(char::is_alphanumeric) && !after.is_some_and(char::is_alphanumeric)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_vocabulary_in_location_wins() {
        assert_eq!(
            remote_type(Some("Engineer"), Some("Remote - US")),
            RemoteType::Remote
        );
        assert_eq!(
            remote_type(Some("Engineer"), Some("New York")),
            RemoteType::Onsite
        );
        assert_eq!(
            remote_type(Some("Engineer (Work from Home)"), None),
            RemoteType::Remote
        );
    }

    #[test]
    fn remote_is_checked_before_hybrid_across_combined_text() {
        assert_eq!(
            remote_type(Some("Remote or Hybrid Analyst"), Some("Chicago")),
            RemoteType::Remote
        );
        assert_eq!(
            remote_type(Some("Analyst"), Some("London (Hybrid)")),
            RemoteType::Hybrid
        );
        assert_eq!(remote_type(None, None), RemoteType::Onsite);
    }

    #[test]
    fn seniority_follows_declared_precedence() {
        assert_eq!(
            seniority_level(Some("Senior Staff Engineer")),
            SeniorityLevel::Senior
        );
        assert_eq!(seniority_level(Some("Backend Intern")), SeniorityLevel::Intern);
        assert_eq!(
            seniority_level(Some("Senior Associate, Sales")),
            SeniorityLevel::Entry
        );
        assert_eq!(
            seniority_level(Some("Principal Engineer")),
            SeniorityLevel::Staff
        );
        assert_eq!(
            seniority_level(Some("Director of Lead Generation")),
            SeniorityLevel::Senior
        );
        assert_eq!(
            seniority_level(Some("Head of People")),
            SeniorityLevel::Executive
        );
        assert_eq!(seniority_level(Some("Sr. Data Scientist")), SeniorityLevel::Senior);
    }

    #[test]
    fn missing_or_plain_titles_default_to_mid() {
        assert_eq!(seniority_level(None), SeniorityLevel::Mid);
        assert_eq!(seniority_level(Some("")), SeniorityLevel::Mid);
        assert_eq!(seniority_level(Some("Software Engineer")), SeniorityLevel::Mid);
    }

    #[test]
    fn terms_match_whole_words_only() {
        assert_eq!(
            seniority_level(Some("International Sales Manager")),
            SeniorityLevel::Mid
        );
        assert_eq!(
            seniority_level(Some("Engineering Level 10")),
            SeniorityLevel::Mid
        );
        assert_eq!(seniority_level(Some("Co-op Student")), SeniorityLevel::Intern);
        assert_eq!(
            seniority_level(Some("Entry-Level Analyst")),
            SeniorityLevel::Entry
        );
        assert_eq!(
            remote_type(Some("Remotely Operated Vehicle Pilot"), None),
            RemoteType::Onsite
        );
    }

    #[test]
    fn distributed_systems_titles_stay_onsite() {
        assert_eq!(
            remote_type(Some("Distributed Systems Engineer"), Some("New York")),
            RemoteType::Onsite
        );
        assert_eq!(
            remote_type(Some("Software Engineer, Distributed Storage"), Some("Seattle, WA")),
            RemoteType::Onsite
        );
        assert_eq!(
            remote_type(Some("Distributed Systems Engineer"), Some("Remote - EU")),
            RemoteType::Remote
        );
    }

    #[test]
    fn normalize_combines_both_fields() {
        let fields = normalize(Some("Staff Engineer"), Some("Anywhere"));
        assert_eq!(fields.remote_type, RemoteType::Remote);
        assert_eq!(fields.seniority_level, SeniorityLevel::Staff);
    }
}
