//! LLM analysis of newly created tickets.
//!
//! Analysis is best-effort: the pipeline stores whatever `AiAnalysis` the
//! `ClassificationService` returns and logs failures without touching the
//! ticket itself.

pub mod chat;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ticket::{Priority, Ticket, TicketStatus};

pub use chat::ChatAnalysisClient;

/// Analysis payload stored on a ticket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "snake_case")]
pub enum AiAnalysis {
    /// The model answered with the requested JSON object.
    Structured(StructuredAnalysis),
    /// The model answered in prose.
    RawText { text: String },
}

/// Fields requested from the model. Missing keys default to empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StructuredAnalysis {
    #[serde(default)]
    pub key_issues: Vec<String>,
    #[serde(default)]
    pub urgency_level: String,
    #[serde(default)]
    pub threat_assessment: String,
    #[serde(default)]
    pub recommended_actions: Vec<String>,
    #[serde(default)]
    pub response_template: String,
    #[serde(default)]
    pub compliance_notes: String,
    #[serde(default)]
    pub technical_details: String,
    #[serde(default)]
    pub body_analysis: String,
}

/// The ticket fields handed to the model.
#[derive(Debug, Clone, PartialEq)]
pub struct TicketSnapshot {
    pub ticket_id: String,
    pub subject: String,
    pub body: String,
    pub sender: String,
    pub recipient: String,
    pub priority: Priority,
    pub status: TicketStatus,
    pub received_at: DateTime<Utc>,
}

impl From<&Ticket> for TicketSnapshot {
    fn from(ticket: &Ticket) -> Self {
        Self {
            ticket_id: ticket.ticket_id.clone(),
            subject: ticket.subject.clone(),
            body: ticket.body.clone(),
            sender: ticket.sender.clone(),
            recipient: ticket.recipient.clone(),
            priority: ticket.priority,
            status: ticket.status,
            received_at: ticket.received_at,
        }
    }
}

/// Errors from the analysis backend.
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("API returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("API response contained no choices")]
    EmptyResponse,

    #[error("Failed to decode API response: {0}")]
    Decode(String),

    #[error("Analysis timed out after {0}s")]
    Timeout(u64),

    #[error("Analysis configuration error: {0}")]
    Config(String),
}

/// Produces an analysis for a ticket.
#[async_trait]
pub trait ClassificationService: Send + Sync {
    async fn analyze(&self, ticket: &TicketSnapshot) -> Result<AiAnalysis, AnalysisError>;
}

/// Interprets the model's reply.
///
/// A reply that is a JSON object, bare or inside a Markdown code fence,
/// becomes `Structured`; anything else, including malformed JSON, is kept
/// verbatim as `RawText`.
pub fn parse_analysis_content(content: &str) -> AiAnalysis {
    let unfenced = strip_code_fence(content.trim());

    if unfenced.starts_with('{') {
        let json = extract_json(unfenced);
        match serde_json::from_str::<StructuredAnalysis>(json) {
            Ok(parsed) => return AiAnalysis::Structured(parsed),
            Err(e) => log::debug!("Analysis reply is not valid JSON: {}", e),
        }
    }

    AiAnalysis::RawText {
        text: content.trim().to_string(),
    }
}

/// Removes a surrounding Markdown code fence, with or without an info string.
fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    // Drop the info string on the opening line.
    let rest = match rest.find('\n') {
        Some(newline) => &rest[newline + 1..],
        None => rest,
    };
    rest.trim_end()
        .strip_suffix("```")
        .unwrap_or(rest)
        .trim()
}

/// Cuts the first balanced `{...}` object out of `text`, ignoring braces
/// inside string literals. Returns the whole input when unbalanced.
fn extract_json(text: &str) -> &str {
    let Some(start) = text.find('{') else {
        return text;
    };

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, c) in text[start..].char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match c {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return &text[start..start + i + 1];
                }
            }
            _ => {}
        }
    }

    &text[start..]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bare_json() {
        let reply = r#"{"key_issues": ["spam"], "urgency_level": "high"}"#;
        match parse_analysis_content(reply) {
            AiAnalysis::Structured(a) => {
                assert_eq!(a.key_issues, vec!["spam"]);
                assert_eq!(a.urgency_level, "high");
                assert!(a.response_template.is_empty());
            }
            other => panic!("expected structured, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_fenced_json() {
        let reply = "```json\n{\"urgency_level\": \"low\", \"body_analysis\": \"a {brace}\"}\n```";
        match parse_analysis_content(reply) {
            AiAnalysis::Structured(a) => {
                assert_eq!(a.urgency_level, "low");
                assert_eq!(a.body_analysis, "a {brace}");
            }
            other => panic!("expected structured, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_json_with_trailing_prose() {
        let reply = "{\"urgency_level\": \"medium\"}\n\nLet me know if you need more.";
        assert!(matches!(
            parse_analysis_content(reply),
            AiAnalysis::Structured(a) if a.urgency_level == "medium"
        ));
    }

    #[test]
    fn test_parse_prose_is_raw_text() {
        let reply = "  This looks like a routine spam complaint.  ";
        assert_eq!(
            parse_analysis_content(reply),
            AiAnalysis::RawText {
                text: "This looks like a routine spam complaint.".to_string()
            }
        );
    }

    #[test]
    fn test_parse_malformed_json_is_raw_text() {
        let reply = "{\"key_issues\": [unterminated";
        assert!(matches!(parse_analysis_content(reply), AiAnalysis::RawText { .. }));
    }

    #[test]
    fn test_analysis_serializes_with_format_tag() {
        let raw = AiAnalysis::RawText {
            text: "hi".to_string(),
        };
        let json = serde_json::to_string(&raw).unwrap();
        assert_eq!(json, r#"{"format":"raw_text","text":"hi"}"#);

        let structured = AiAnalysis::Structured(StructuredAnalysis::default());
        let json = serde_json::to_value(&structured).unwrap();
        assert_eq!(json["format"], "structured");
        assert_eq!(serde_json::from_value::<AiAnalysis>(json).unwrap(), structured);
    }
}
