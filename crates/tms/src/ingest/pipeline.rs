//! One ingestion cycle: search the mailbox past the cursor, turn each new
//! message into a ticket, notify, queue analysis, advance the cursor.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::analysis::{ClassificationService, TicketSnapshot};
use crate::config::{IngestConfig, MailboxConfig};
use crate::db::cursor_repo::{self, CursorRow};
use crate::db::Database;
use crate::email::{parse_email, MailboxConnector, MailboxError, MailboxSession, UidCursor};
use crate::notify::NotificationSink;
use crate::ticket::{
    classify, generate_ticket_id, parse_mail_date, CreateOutcome, NewTicket, StoreError,
    TicketStore,
};

/// Knobs for the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestSettings {
    /// Folder name, used as the persisted cursor key.
    pub folder: String,
    /// IMAP search criteria, `FROM <sender>` first.
    pub criteria: Vec<(String, String)>,
    /// Start after the newest existing message when no cursor is stored.
    pub skip_existing: bool,
    pub persist_cursor: bool,
    /// Attempts per failing UID, including the first.
    pub max_fetch_attempts: u32,
    pub analysis_timeout: Duration,
}

impl IngestSettings {
    pub fn new(criteria: Vec<(String, String)>) -> Self {
        Self {
            folder: "INBOX".to_string(),
            criteria,
            skip_existing: true,
            persist_cursor: true,
            max_fetch_attempts: 3,
            analysis_timeout: Duration::from_secs(60),
        }
    }

    pub fn from_config(mailbox: &MailboxConfig, ingest: &IngestConfig) -> Self {
        Self {
            folder: mailbox.folder.clone(),
            criteria: mailbox.search_criteria(),
            skip_existing: ingest.skip_existing,
            persist_cursor: ingest.persist_cursor,
            max_fetch_attempts: ingest.max_fetch_attempts.max(1),
            analysis_timeout: Duration::from_secs(ingest.analysis_timeout),
        }
    }
}

/// What the orchestrator is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", content = "uid", rename_all = "snake_case")]
pub enum IngestPhase {
    Idle,
    Connecting,
    Searching,
    Processing(u32),
    AdvancingCursor,
    Sleeping,
    Stopped,
}

/// Outcome counters of one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleSummary {
    /// New UIDs returned by the search (retries not included).
    pub emails_found: usize,
    pub tickets_created: usize,
    pub tickets_existing: usize,
    pub notifications_sent: usize,
    pub analyses_completed: usize,
    /// Cursor after the cycle.
    pub uid_max: u32,
    /// One entry per failure, e.g. `UID 9: Failed to fetch UID 9: ...`.
    pub errors: Vec<String>,
}

#[derive(Debug, Error)]
enum MessageError {
    #[error(transparent)]
    Mailbox(#[from] MailboxError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl MessageError {
    /// The session cannot be trusted for further commands.
    fn aborts_session(&self) -> bool {
        matches!(self, MessageError::Mailbox(e) if e.is_connection_level())
    }
}

struct IngestState {
    cursor: UidCursor,
    initialized: bool,
    uid_validity: Option<u32>,
    /// Failed UIDs and how often they have been tried.
    retry: BTreeMap<u32, u32>,
}

impl IngestState {
    /// Highest UID below which nothing is pending. The in-memory cursor may
    /// run ahead of a UID awaiting retry; the stored one must not, or the
    /// retry is lost across a restart.
    fn durable_uid(&self) -> u32 {
        let uid_max = self.cursor.uid_max();
        match self.retry.keys().next() {
            Some(&pending) => uid_max.min(pending.saturating_sub(1)),
            None => uid_max,
        }
    }
}

/// Runs ingestion cycles against one mailbox folder.
///
/// Cycles are serialized by an internal lock, so the polling loop and a
/// manual trigger never interleave and the cursor has a single writer.
pub struct Ingestor {
    connector: Arc<dyn MailboxConnector>,
    store: Arc<dyn TicketStore>,
    notifier: Arc<dyn NotificationSink>,
    analyzer: Option<Arc<dyn ClassificationService>>,
    cursor_db: Option<Database>,
    settings: IngestSettings,
    state: Mutex<IngestState>,
    uid_max: AtomicU32,
    halt: AtomicBool,
    halt_signal: Notify,
    phase: watch::Sender<IngestPhase>,
}

impl Ingestor {
    pub fn new(
        connector: Arc<dyn MailboxConnector>,
        store: Arc<dyn TicketStore>,
        notifier: Arc<dyn NotificationSink>,
        settings: IngestSettings,
    ) -> Self {
        let (phase, _) = watch::channel(IngestPhase::Idle);
        Self {
            connector,
            store,
            notifier,
            analyzer: None,
            cursor_db: None,
            state: Mutex::new(IngestState {
                cursor: UidCursor::new(settings.criteria.clone()),
                initialized: false,
                uid_validity: None,
                retry: BTreeMap::new(),
            }),
            settings,
            uid_max: AtomicU32::new(0),
            halt: AtomicBool::new(false),
            halt_signal: Notify::new(),
            phase,
        }
    }

    /// Analyzes every created ticket in the background.
    pub fn with_analyzer(mut self, analyzer: Arc<dyn ClassificationService>) -> Self {
        self.analyzer = Some(analyzer);
        self
    }

    /// Persists the cursor in `mailbox_cursors` (when enabled in settings).
    pub fn with_cursor_store(mut self, db: Database) -> Self {
        self.cursor_db = Some(db);
        self
    }

    pub fn settings(&self) -> &IngestSettings {
        &self.settings
    }

    /// Cursor value as of the last completed step. Does not wait for a
    /// running cycle.
    pub fn uid_max(&self) -> u32 {
        self.uid_max.load(Ordering::Acquire)
    }

    pub fn phase(&self) -> IngestPhase {
        *self.phase.borrow()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<IngestPhase> {
        self.phase.subscribe()
    }

    pub(crate) fn set_phase(&self, phase: IngestPhase) {
        self.phase.send_replace(phase);
    }

    /// Asks a running cycle to stop after the message in flight. Pending
    /// analyses of that cycle are abandoned.
    pub fn halt(&self) {
        self.halt.store(true, Ordering::Release);
        self.halt_signal.notify_one();
    }

    pub fn resume(&self) {
        self.halt.store(false, Ordering::Release);
    }

    pub fn is_halted(&self) -> bool {
        self.halt.load(Ordering::Acquire)
    }

    /// Stores the cursor as it stands. Used after a cycle was cancelled
    /// before it could store the cursor itself.
    pub async fn flush_cursor(&self) {
        let state = self.state.lock().await;
        self.persist_cursor(&state);
    }

    /// Runs one cycle, folding cycle-level failures into `errors`.
    pub async fn run_cycle(&self) -> CycleSummary {
        match self.try_run_cycle().await {
            Ok(summary) => summary,
            Err(e) => {
                error!("Ingestion cycle failed: {}", e);
                CycleSummary {
                    uid_max: self.uid_max(),
                    errors: vec![e.to_string()],
                    ..CycleSummary::default()
                }
            }
        }
    }

    /// Runs one cycle. Connection, cursor-initialization and search
    /// failures are returned; per-message failures end up in `errors`.
    pub async fn try_run_cycle(&self) -> Result<CycleSummary, MailboxError> {
        let span = info_span!("ingest_cycle", folder = %self.settings.folder);
        self.run_locked_cycle().instrument(span).await
    }

    async fn run_locked_cycle(&self) -> Result<CycleSummary, MailboxError> {
        let mut state = self.state.lock().await;
        let mut summary = CycleSummary::default();

        self.set_phase(IngestPhase::Connecting);
        let mut session = match self.connector.connect().await {
            Ok(session) => session,
            Err(e) => {
                self.set_phase(IngestPhase::Idle);
                return Err(e);
            }
        };

        let mut analyses = JoinSet::new();
        let result = self
            .process_session(&mut state, session.as_mut(), &mut summary, &mut analyses)
            .await;
        session.close().await;

        self.drain_analyses(&mut analyses, &mut summary).await;

        self.persist_cursor(&state);
        summary.uid_max = state.cursor.uid_max();
        self.set_phase(IngestPhase::Idle);

        result?;

        info!(
            found = summary.emails_found,
            created = summary.tickets_created,
            existing = summary.tickets_existing,
            errors = summary.errors.len(),
            uid_max = summary.uid_max,
            "Ingestion cycle complete"
        );
        Ok(summary)
    }

    /// Waits for the cycle's analyses, or abandons them on halt.
    async fn drain_analyses(&self, analyses: &mut JoinSet<bool>, summary: &mut CycleSummary) {
        let mut aborted = false;
        loop {
            if !aborted && self.is_halted() {
                if !analyses.is_empty() {
                    info!("Halt requested, abandoning {} pending analyses", analyses.len());
                }
                analyses.abort_all();
                aborted = true;
            }

            let joined = tokio::select! {
                joined = analyses.join_next() => joined,
                _ = self.halt_signal.notified(), if !aborted => continue,
            };
            match joined {
                None => break,
                Some(Ok(true)) => summary.analyses_completed += 1,
                Some(Ok(false)) => {}
                Some(Err(e)) if e.is_cancelled() => {}
                Some(Err(e)) => warn!("Analysis task failed: {}", e),
            }
        }
    }

    async fn process_session(
        &self,
        state: &mut IngestState,
        session: &mut dyn MailboxSession,
        summary: &mut CycleSummary,
        analyses: &mut JoinSet<bool>,
    ) -> Result<(), MailboxError> {
        self.ensure_cursor(state, session).await?;

        self.set_phase(IngestPhase::Searching);
        let filter = state.cursor.filter();
        let found = if filter.is_exhausted() {
            debug!("Cursor at the highest possible UID, skipping search");
            Vec::new()
        } else {
            session.search(&filter).await?
        };

        let mut uids: Vec<u32> = found.into_iter().filter(|uid| filter.admits(*uid)).collect();
        uids.sort_unstable();
        uids.dedup();
        summary.emails_found = uids.len();

        uids.extend(state.retry.keys().copied());
        uids.sort_unstable();
        uids.dedup();

        if uids.is_empty() {
            debug!("No new messages past UID {}", state.cursor.uid_max());
            return Ok(());
        }
        info!("Processing {} messages", uids.len());

        for uid in uids {
            if self.is_halted() {
                info!("Halt requested, leaving remaining messages for the next cycle");
                break;
            }

            self.set_phase(IngestPhase::Processing(uid));
            match self.process_message(session, uid, summary, analyses).await {
                Ok(()) => {
                    state.retry.remove(&uid);
                    self.set_phase(IngestPhase::AdvancingCursor);
                    state.cursor.advance(uid);
                    self.uid_max.store(state.cursor.uid_max(), Ordering::Release);
                }
                Err(e) => {
                    error!("Failed to ingest UID {}: {}", uid, e);
                    summary.errors.push(format!("UID {}: {}", uid, e));
                    if self.record_failure(state, uid) {
                        state.cursor.advance(uid);
                        self.uid_max.store(state.cursor.uid_max(), Ordering::Release);
                    }

                    if e.aborts_session() {
                        warn!("Session unusable after UID {}, ending cycle early", uid);
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    /// Counts a failed attempt. Returns `true` once the UID is given up
    /// on; the caller then moves the cursor past it.
    fn record_failure(&self, state: &mut IngestState, uid: u32) -> bool {
        let attempts = state.retry.entry(uid).or_insert(0);
        *attempts += 1;
        if *attempts < self.settings.max_fetch_attempts {
            return false;
        }
        error!(
            "Giving up on UID {} after {} attempts",
            uid, self.settings.max_fetch_attempts
        );
        state.retry.remove(&uid);
        true
    }

    async fn process_message(
        &self,
        session: &mut dyn MailboxSession,
        uid: u32,
        summary: &mut CycleSummary,
        analyses: &mut JoinSet<bool>,
    ) -> Result<(), MessageError> {
        let raw = session.fetch(uid).await?;
        let email = parse_email(&raw);
        let ticket_id = generate_ticket_id(&email.subject, &email.raw_date);

        if self.store.exists(&ticket_id).await? {
            debug!("UID {} maps to existing ticket {}", uid, ticket_id);
            summary.tickets_existing += 1;
            return Ok(());
        }

        let priority = classify(&email.subject, &email.body);
        let received_at = parse_mail_date(&email.raw_date)
            .map(|date| date.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        let outcome = self
            .store
            .create(NewTicket {
                ticket_id: ticket_id.clone(),
                subject: email.subject,
                body: email.body,
                sender: email.sender,
                recipient: email.recipient,
                priority,
                source_uid: Some(uid),
                received_at,
            })
            .await?;

        let ticket = match outcome {
            CreateOutcome::Created(ticket) => ticket,
            CreateOutcome::AlreadyExists => {
                debug!("Ticket {} was created concurrently", ticket_id);
                summary.tickets_existing += 1;
                return Ok(());
            }
        };

        summary.tickets_created += 1;
        info!(ticket_id = %ticket.ticket_id, priority = %ticket.priority, uid, "Ticket created");

        match self.notifier.notify(&ticket).await {
            Ok(()) => summary.notifications_sent += 1,
            Err(e) => warn!("Notification for {} failed: {}", ticket.ticket_id, e),
        }

        if let Some(analyzer) = &self.analyzer {
            analyses.spawn(analyze_ticket(
                Arc::clone(analyzer),
                Arc::clone(&self.store),
                TicketSnapshot::from(&ticket),
                self.settings.analysis_timeout,
            ));
        }

        Ok(())
    }

    /// Makes sure the cursor is positioned for this folder generation.
    async fn ensure_cursor(
        &self,
        state: &mut IngestState,
        session: &mut dyn MailboxSession,
    ) -> Result<(), MailboxError> {
        let uid_validity = session.uid_validity();

        if state.initialized {
            match (state.uid_validity, uid_validity) {
                (Some(known), Some(current)) if known != current => {
                    warn!(
                        "UIDVALIDITY changed for '{}' ({} -> {}), resetting cursor",
                        self.settings.folder, known, current
                    );
                    state.initialized = false;
                    state.retry.clear();
                    state.cursor.reset(0);
                    self.uid_max.store(0, Ordering::Release);
                    self.delete_persisted_cursor();
                }
                _ => return Ok(()),
            }
        }

        if let Some(row) = self.load_persisted_cursor(uid_validity) {
            info!(
                "Resuming '{}' from stored cursor UID {}",
                self.settings.folder, row.uid_max
            );
            state.cursor.reset(row.uid_max);
        } else if self.settings.skip_existing {
            if !state.cursor.initialize(session).await {
                return Err(MailboxError::ProtocolError(
                    "cursor initialization search failed".to_string(),
                ));
            }
        } else {
            debug!("Starting '{}' from UID 0", self.settings.folder);
        }

        state.initialized = true;
        state.uid_validity = uid_validity;
        self.uid_max.store(state.cursor.uid_max(), Ordering::Release);
        self.persist_cursor(state);
        Ok(())
    }

    fn cursor_db(&self) -> Option<&Database> {
        if self.settings.persist_cursor {
            self.cursor_db.as_ref()
        } else {
            None
        }
    }

    fn load_persisted_cursor(&self, uid_validity: Option<u32>) -> Option<CursorRow> {
        let db = self.cursor_db()?;
        let row = match cursor_repo::find(db, &self.settings.folder) {
            Ok(row) => row?,
            Err(e) => {
                warn!("Failed to load stored cursor: {}", e);
                return None;
            }
        };

        match uid_validity {
            Some(current) if current != row.uidvalidity => {
                warn!(
                    "Stored cursor for '{}' belongs to UIDVALIDITY {} but server reports {}, discarding",
                    self.settings.folder, row.uidvalidity, current
                );
                self.delete_persisted_cursor();
                None
            }
            _ => Some(row),
        }
    }

    fn persist_cursor(&self, state: &IngestState) {
        let (Some(db), Some(uidvalidity)) = (self.cursor_db(), state.uid_validity) else {
            return;
        };
        if !state.initialized {
            return;
        }

        let row = CursorRow {
            folder: self.settings.folder.clone(),
            uidvalidity,
            uid_max: state.durable_uid(),
            updated_at: Utc::now().to_rfc3339(),
        };
        if let Err(e) = cursor_repo::upsert(db, &row) {
            warn!("Failed to store cursor: {}", e);
        }
    }

    fn delete_persisted_cursor(&self) {
        if let Some(db) = self.cursor_db() {
            if let Err(e) = cursor_repo::delete(db, &self.settings.folder) {
                warn!("Failed to delete stored cursor: {}", e);
            }
        }
    }
}

/// Analyzes one ticket and stores the result. Returns whether it was stored.
async fn analyze_ticket(
    analyzer: Arc<dyn ClassificationService>,
    store: Arc<dyn TicketStore>,
    snapshot: TicketSnapshot,
    limit: Duration,
) -> bool {
    let analysis = match tokio::time::timeout(limit, analyzer.analyze(&snapshot)).await {
        Ok(Ok(analysis)) => analysis,
        Ok(Err(e)) => {
            warn!("Analysis of {} failed: {}", snapshot.ticket_id, e);
            return false;
        }
        Err(_) => {
            warn!(
                "Analysis of {} timed out after {}s",
                snapshot.ticket_id,
                limit.as_secs()
            );
            return false;
        }
    };

    match store.update_analysis(&snapshot.ticket_id, &analysis).await {
        Ok(()) => {
            debug!("Stored analysis for {}", snapshot.ticket_id);
            true
        }
        Err(e) => {
            warn!("Failed to store analysis for {}: {}", snapshot.ticket_id, e);
            false
        }
    }
}
