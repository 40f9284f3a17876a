#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use tms::analysis::{AiAnalysis, AnalysisError, ClassificationService, TicketSnapshot};
use tms::db::Database;
use tms::email::{MailboxConnector, MailboxError, MailboxSession, RawMessage, SearchFilter};
use tms::ingest::{IngestSettings, Ingestor};
use tms::notify::{NotificationSink, NotifyError};
use tms::ticket::{SqliteTicketStore, Ticket};

pub const TARGET_SENDER: &str = "abuse@contabo.com";

/// Builds a plain-text complaint as the provider would send it.
pub fn complaint(subject: &str, date: &str, body: &str) -> Vec<u8> {
    format!(
        "From: Contabo Abuse <{TARGET_SENDER}>\r\n\
         To: ops@example.com\r\n\
         Subject: {subject}\r\n\
         Date: {date}\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         \r\n\
         {body}\r\n"
    )
    .into_bytes()
}

/// A complaint whose subject and date are unique per `n`.
pub fn numbered_complaint(n: u32) -> Vec<u8> {
    complaint(
        &format!("Abuse report #{n}"),
        &format!("Wed, {:02} Jul 2025 10:00:00 +0000", (n % 28) + 1),
        "We received a spam complaint about your server.",
    )
}

pub fn sender_criteria() -> Vec<(String, String)> {
    vec![("FROM".to_string(), TARGET_SENDER.to_string())]
}

/// Settings that ingest existing mail and keep the cursor in memory.
pub fn test_settings() -> IngestSettings {
    IngestSettings {
        skip_existing: false,
        persist_cursor: false,
        analysis_timeout: Duration::from_secs(2),
        ..IngestSettings::new(sender_criteria())
    }
}

#[derive(Default)]
struct MailboxState {
    messages: BTreeMap<u32, Vec<u8>>,
    uid_validity: Option<u32>,
    /// UID -> number of fetches that still fail.
    fetch_failures: BTreeMap<u32, u32>,
    fail_connect: bool,
    fail_search: bool,
    ignore_range: bool,
    /// Order in which SEARCH reports UIDs; key order when unset.
    search_order: Option<Vec<u32>>,
    /// UIDs whose fetch never completes.
    stalled: Vec<u32>,
    opened: usize,
    closed: usize,
    queries: Vec<String>,
    fetched: Vec<u32>,
}

/// Scripted in-memory mailbox.
#[derive(Clone)]
pub struct FakeMailbox {
    state: Arc<Mutex<MailboxState>>,
}

impl FakeMailbox {
    pub fn new() -> Self {
        let state = MailboxState {
            uid_validity: Some(1),
            ..MailboxState::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn with_messages(uids: &[u32]) -> Self {
        let mailbox = Self::new();
        for &uid in uids {
            mailbox.add(uid, numbered_complaint(uid));
        }
        mailbox
    }

    pub fn add(&self, uid: u32, bytes: Vec<u8>) {
        self.state.lock().unwrap().messages.insert(uid, bytes);
    }

    pub fn remove(&self, uid: u32) {
        self.state.lock().unwrap().messages.remove(&uid);
    }

    pub fn clear(&self) {
        self.state.lock().unwrap().messages.clear();
    }

    pub fn set_uid_validity(&self, value: Option<u32>) {
        self.state.lock().unwrap().uid_validity = value;
    }

    /// The next `times` fetches of `uid` fail.
    pub fn fail_fetch(&self, uid: u32, times: u32) {
        self.state.lock().unwrap().fetch_failures.insert(uid, times);
    }

    pub fn fail_connect(&self, fail: bool) {
        self.state.lock().unwrap().fail_connect = fail;
    }

    pub fn fail_search(&self, fail: bool) {
        self.state.lock().unwrap().fail_search = fail;
    }

    /// Answer every search with all UIDs, like a server that ignores the
    /// `UID n:*` bound.
    pub fn ignore_range(&self, ignore: bool) {
        self.state.lock().unwrap().ignore_range = ignore;
    }

    /// Report search hits in this order instead of ascending.
    pub fn set_search_order(&self, uids: &[u32]) {
        self.state.lock().unwrap().search_order = Some(uids.to_vec());
    }

    /// Fetching `uid` blocks forever.
    pub fn stall_fetch(&self, uid: u32) {
        self.state.lock().unwrap().stalled.push(uid);
    }

    pub fn opened(&self) -> usize {
        self.state.lock().unwrap().opened
    }

    pub fn closed(&self) -> usize {
        self.state.lock().unwrap().closed
    }

    pub fn queries(&self) -> Vec<String> {
        self.state.lock().unwrap().queries.clone()
    }

    pub fn fetched(&self) -> Vec<u32> {
        self.state.lock().unwrap().fetched.clone()
    }

    pub fn reset_fetched(&self) {
        self.state.lock().unwrap().fetched.clear();
    }
}

#[async_trait]
impl MailboxConnector for FakeMailbox {
    async fn connect(&self) -> Result<Box<dyn MailboxSession>, MailboxError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_connect {
            return Err(MailboxError::ConnectionFailed(
                "connection refused".to_string(),
            ));
        }
        state.opened += 1;
        Ok(Box::new(FakeSession {
            state: Arc::clone(&self.state),
            uid_validity: state.uid_validity,
            closed: false,
        }))
    }
}

struct FakeSession {
    state: Arc<Mutex<MailboxState>>,
    uid_validity: Option<u32>,
    closed: bool,
}

#[async_trait]
impl MailboxSession for FakeSession {
    fn uid_validity(&self) -> Option<u32> {
        self.uid_validity
    }

    async fn search(&mut self, filter: &SearchFilter) -> Result<Vec<u32>, MailboxError> {
        let mut state = self.state.lock().unwrap();
        state.queries.push(filter.to_imap_query());
        if state.fail_search {
            return Err(MailboxError::ProtocolError("SEARCH rejected".to_string()));
        }
        let ignore_range = state.ignore_range;
        let uids: Vec<u32> = match &state.search_order {
            Some(order) => order
                .iter()
                .copied()
                .filter(|uid| state.messages.contains_key(uid))
                .collect(),
            None => state.messages.keys().copied().collect(),
        };
        Ok(uids
            .into_iter()
            .filter(|uid| ignore_range || filter.admits(*uid))
            .collect())
    }

    async fn fetch(&mut self, uid: u32) -> Result<RawMessage, MailboxError> {
        let stalled = {
            let mut state = self.state.lock().unwrap();
            state.fetched.push(uid);
            state.stalled.contains(&uid)
        };
        if stalled {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        let mut state = self.state.lock().unwrap();
        if let Some(remaining) = state.fetch_failures.get_mut(&uid) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(MailboxError::FetchFailed {
                    uid,
                    reason: "server said NO".to_string(),
                });
            }
        }
        match state.messages.get(&uid) {
            Some(bytes) => Ok(RawMessage {
                uid,
                bytes: bytes.clone(),
            }),
            None => Err(MailboxError::MessageNotFound { uid }),
        }
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.state.lock().unwrap().closed += 1;
        }
    }
}

/// Notifier that records ticket IDs, optionally failing every call.
#[derive(Default)]
pub struct RecordingNotifier {
    pub fail: bool,
    notified: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn notified(&self) -> Vec<String> {
        self.notified.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationSink for RecordingNotifier {
    async fn notify(&self, ticket: &Ticket) -> Result<(), NotifyError> {
        self.notified.lock().unwrap().push(ticket.ticket_id.clone());
        if self.fail {
            return Err(NotifyError::Delivery("socket closed".to_string()));
        }
        Ok(())
    }
}

/// How a `FakeClassifier` answers.
#[derive(Clone)]
pub enum Verdict {
    Text(String),
    Fail,
    Hang,
}

pub struct FakeClassifier {
    verdict: Verdict,
    seen: Mutex<Vec<String>>,
}

impl FakeClassifier {
    pub fn new(verdict: Verdict) -> Self {
        Self {
            verdict,
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl ClassificationService for FakeClassifier {
    async fn analyze(&self, ticket: &TicketSnapshot) -> Result<AiAnalysis, AnalysisError> {
        self.seen.lock().unwrap().push(ticket.ticket_id.clone());
        match &self.verdict {
            Verdict::Text(text) => Ok(AiAnalysis::RawText { text: text.clone() }),
            Verdict::Fail => Err(AnalysisError::Api {
                status: 500,
                body: "upstream error".to_string(),
            }),
            Verdict::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(AnalysisError::EmptyResponse)
            }
        }
    }
}

pub struct Harness {
    pub mailbox: FakeMailbox,
    pub db: Database,
    pub store: SqliteTicketStore,
    pub notifier: Arc<RecordingNotifier>,
}

impl Harness {
    pub fn new(mailbox: FakeMailbox) -> Self {
        Self::with_notifier(mailbox, RecordingNotifier::default())
    }

    pub fn with_notifier(mailbox: FakeMailbox, notifier: RecordingNotifier) -> Self {
        let db = Database::open_in_memory().unwrap();
        Self {
            mailbox,
            store: SqliteTicketStore::new(db.clone()),
            db,
            notifier: Arc::new(notifier),
        }
    }

    pub fn ingestor(&self, settings: IngestSettings) -> Ingestor {
        Ingestor::new(
            Arc::new(self.mailbox.clone()),
            Arc::new(self.store.clone()),
            self.notifier.clone(),
            settings,
        )
    }
}
