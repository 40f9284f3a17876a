//! Keyword triage of incoming complaints.

use super::Priority;

/// Terms that make a complaint high priority. Checked first.
const HIGH_PRIORITY_KEYWORDS: &[&str] = &[
    "urgent",
    "critical",
    "emergency",
    "immediate",
    "suspension",
    "termination",
    "legal",
    "dmca",
    "copyright",
    "law enforcement",
    "police",
    "court",
    "lawsuit",
    "violation",
    "breach",
];

/// Terms that make a complaint medium priority.
const MEDIUM_PRIORITY_KEYWORDS: &[&str] = &[
    "warning",
    "notice",
    "complaint",
    "abuse",
    "spam",
    "malware",
    "virus",
    "attack",
    "ddos",
    "resource abuse",
    "bandwidth",
];

/// Classifies a message by case-insensitive substring match over
/// `subject + " " + body`.
///
/// Any high keyword wins outright; otherwise any medium keyword; otherwise
/// `Low`. There is no scoring, the first hit decides.
pub fn classify(subject: &str, body: &str) -> Priority {
    let content = format!("{} {}", subject, body).to_lowercase();

    if let Some(keyword) = first_match(&content, HIGH_PRIORITY_KEYWORDS) {
        log::debug!("High priority keyword '{}' matched", keyword);
        return Priority::High;
    }

    if let Some(keyword) = first_match(&content, MEDIUM_PRIORITY_KEYWORDS) {
        log::debug!("Medium priority keyword '{}' matched", keyword);
        return Priority::Medium;
    }

    Priority::Low
}

fn first_match<'a>(content: &str, keywords: &[&'a str]) -> Option<&'a str> {
    keywords.iter().copied().find(|k| content.contains(k))
}
