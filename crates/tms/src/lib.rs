pub mod analysis;
pub mod config;
pub mod db;
pub mod email;
pub mod error;
pub mod ingest;
pub mod logging;
pub mod notify;
pub mod secrets;
pub mod ticket;

pub use analysis::{AiAnalysis, AnalysisError, ChatAnalysisClient, ClassificationService};
pub use config::{load_config, TmsConfig};
pub use db::{Database, DatabaseError};
pub use email::{ImapConnector, MailboxConnector, MailboxError, MailboxSession, ParsedEmail};
pub use error::{ConfigError, Result, TmsError};
pub use ingest::{CycleSummary, IngestPhase, IngestSettings, IngestionService, Ingestor};
pub use logging::init_logging;
pub use notify::{BroadcastNotifier, NotificationSink, NotifyError, TicketNotification};
pub use secrets::{resolve_secret, SecretError};
pub use ticket::{Priority, SqliteTicketStore, Ticket, TicketStatus, TicketStore};
