//! Pre-flight check of the external services, run before starting the
//! daemon for real. Touches neither the ticket store nor the stored cursor.

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use crate::analysis::{AiAnalysis, ClassificationService, TicketSnapshot};
use crate::email::{MailboxConnector, UidCursor};
use crate::ticket::{Priority, TicketStatus};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckStep {
    pub name: &'static str,
    pub ok: bool,
    pub detail: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemCheck {
    pub steps: Vec<CheckStep>,
}

impl SystemCheck {
    pub fn passed(&self) -> bool {
        self.steps.iter().all(|step| step.ok)
    }

    fn record(&mut self, name: &'static str, ok: bool, detail: String) {
        if ok {
            info!("Check '{}' passed: {}", name, detail);
        } else {
            warn!("Check '{}' failed: {}", name, detail);
        }
        self.steps.push(CheckStep { name, ok, detail });
    }
}

/// Ticket handed to the analyzer during the check.
pub fn sample_ticket() -> TicketSnapshot {
    TicketSnapshot {
        ticket_id: "TEST001".to_string(),
        subject: "Test abuse complaint".to_string(),
        body: "This is a test email for system validation.".to_string(),
        sender: "abuse@contabo.com".to_string(),
        recipient: String::new(),
        priority: Priority::Medium,
        status: TicketStatus::Open,
        received_at: Utc::now(),
    }
}

/// Connects, positions a scratch cursor, and optionally analyzes
/// [`sample_ticket`]. A failed connection skips the cursor step.
pub async fn run_system_check(
    connector: &dyn MailboxConnector,
    criteria: Vec<(String, String)>,
    analyzer: Option<&dyn ClassificationService>,
) -> SystemCheck {
    let mut check = SystemCheck::default();

    match connector.connect().await {
        Ok(mut session) => {
            let validity = session
                .uid_validity()
                .map_or_else(|| "no UIDVALIDITY".to_string(), |v| format!("UIDVALIDITY {}", v));
            check.record("mailbox", true, format!("connected, {}", validity));

            let mut cursor = UidCursor::new(criteria);
            if cursor.initialize(session.as_mut()).await {
                check.record(
                    "cursor",
                    true,
                    format!("newest matching UID is {}", cursor.uid_max()),
                );
            } else {
                check.record("cursor", false, "search for existing mail failed".to_string());
            }
            session.close().await;
        }
        Err(e) => check.record("mailbox", false, e.to_string()),
    }

    if let Some(analyzer) = analyzer {
        match analyzer.analyze(&sample_ticket()).await {
            Ok(AiAnalysis::Structured(analysis)) => check.record(
                "analysis",
                true,
                format!("structured answer, urgency '{}'", analysis.urgency_level),
            ),
            Ok(AiAnalysis::RawText { text }) => check.record(
                "analysis",
                true,
                format!("free-text answer ({} chars)", text.chars().count()),
            ),
            Err(e) => check.record("analysis", false, e.to_string()),
        }
    }

    check
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passed_requires_every_step() {
        let mut check = SystemCheck::default();
        assert!(check.passed());

        check.record("mailbox", true, "connected".to_string());
        assert!(check.passed());

        check.record("analysis", false, "HTTP 401".to_string());
        assert!(!check.passed());
    }

    #[test]
    fn test_sample_ticket() {
        let ticket = sample_ticket();
        assert_eq!(ticket.ticket_id, "TEST001");
        assert_eq!(ticket.priority, Priority::Medium);
        assert_eq!(ticket.status, TicketStatus::Open);
    }
}
