//! New-ticket notifications.
//!
//! The pipeline hands every freshly created ticket to a `NotificationSink`.
//! `BroadcastNotifier` fans events out over a tokio broadcast channel that a
//! WebSocket layer subscribes to, and records each delivery in the
//! `notifications` table when given a database.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::db::notification_repo::{self, NotificationRow};
use crate::db::{Database, DatabaseError};
use crate::ticket::{Priority, Ticket, TicketStatus};

/// Default channel capacity for `BroadcastNotifier`.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Channel name recorded for notifications published on the broadcast bus.
pub const CHANNEL_WEBSOCKET: &str = "websocket";

/// Errors from delivering a notification.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Failed to record notification: {0}")]
    Record(#[from] DatabaseError),

    #[error("Notification delivery failed: {0}")]
    Delivery(String),
}

/// Event published for the front-end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TicketNotification {
    /// In-app toast for a new ticket.
    NewTicket {
        ticket_id: String,
        subject: String,
        priority: Priority,
        status: TicketStatus,
        timestamp: DateTime<Utc>,
        message: String,
    },
    /// Desktop notification payload.
    Browser {
        title: String,
        body: String,
        ticket_id: String,
        priority: Priority,
        timestamp: DateTime<Utc>,
    },
}

impl TicketNotification {
    pub fn new_ticket(ticket: &Ticket) -> Self {
        TicketNotification::NewTicket {
            ticket_id: ticket.ticket_id.clone(),
            subject: ticket.subject.clone(),
            priority: ticket.priority,
            status: ticket.status,
            timestamp: ticket.created_at,
            message: format!("New abuse complaint received: {}", ticket.subject),
        }
    }

    pub fn browser(ticket: &Ticket) -> Self {
        TicketNotification::Browser {
            title: "New Abuse Complaint".to_string(),
            body: format!("New ticket: {}", ticket.subject),
            ticket_id: ticket.ticket_id.clone(),
            priority: ticket.priority,
            timestamp: ticket.created_at,
        }
    }

    pub fn ticket_id(&self) -> &str {
        match self {
            TicketNotification::NewTicket { ticket_id, .. }
            | TicketNotification::Browser { ticket_id, .. } => ticket_id,
        }
    }
}

/// Receives every newly created ticket.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, ticket: &Ticket) -> Result<(), NotifyError>;
}

/// Publishes ticket events on an in-process broadcast channel.
#[derive(Clone)]
pub struct BroadcastNotifier {
    sender: Arc<broadcast::Sender<TicketNotification>>,
    db: Option<Database>,
}

impl BroadcastNotifier {
    /// Creates a notifier with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Arc::new(sender),
            db: None,
        }
    }

    /// Records a `notifications` row for every published ticket.
    pub fn with_database(mut self, db: Database) -> Self {
        self.db = Some(db);
        self
    }

    /// Creates a new subscriber for ticket events.
    pub fn subscribe(&self) -> broadcast::Receiver<TicketNotification> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    fn publish(&self, event: TicketNotification) {
        // No active receivers is fine.
        let _ = self.sender.send(event);
    }
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

#[async_trait]
impl NotificationSink for BroadcastNotifier {
    async fn notify(&self, ticket: &Ticket) -> Result<(), NotifyError> {
        self.publish(TicketNotification::new_ticket(ticket));
        self.publish(TicketNotification::browser(ticket));

        log::info!(
            "Notification published for ticket {} ({} subscribers)",
            ticket.ticket_id,
            self.subscriber_count()
        );

        if let Some(db) = &self.db {
            notification_repo::insert(
                db,
                &NotificationRow {
                    ticket_id: ticket.ticket_id.clone(),
                    channel: CHANNEL_WEBSOCKET.to_string(),
                    status: "sent".to_string(),
                    sent_at: Utc::now().to_rfc3339(),
                },
            )?;
        }

        Ok(())
    }
}
