//! Mailbox-to-ticket ingestion.
//!
//! [`Ingestor`] runs single cycles; [`IngestionService`] repeats them on a
//! timer in a background task. [`run_system_check`] verifies the mailbox
//! and analysis backends without ingesting anything.

pub mod check;
pub mod pipeline;
pub mod service;

pub use check::{run_system_check, CheckStep, SystemCheck};
pub use pipeline::{CycleSummary, IngestPhase, IngestSettings, Ingestor};
pub use service::{IngestionService, ServiceStatus};
