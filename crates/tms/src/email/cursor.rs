//! UID cursor over the complaint folder.
//!
//! The cursor is the highest UID already ingested. Each cycle searches for
//! `UID cursor+1:*` combined with the sender criteria. IMAP answers `n:*`
//! with the highest existing UID even when `n` is past it, so results are
//! re-checked with `SearchFilter::admits`.

use log::{debug, info, warn};

use super::client::MailboxSession;

/// A UID SEARCH request: equality criteria plus a lower UID bound.
///
/// `min_uid` is `None` once the cursor sits at `u32::MAX`; no UID can be
/// newer, so nothing is admitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchFilter {
    pub criteria: Vec<(String, String)>,
    pub min_uid: Option<u32>,
}

impl SearchFilter {
    /// Renders the IMAP search key, e.g. `(FROM "abuse@contabo.com" UID 8:*)`.
    pub fn to_imap_query(&self) -> String {
        let mut parts: Vec<String> = self
            .criteria
            .iter()
            .map(|(key, value)| format!("{} {}", key, quote(value)))
            .collect();
        parts.push(format!("UID {}:*", self.min_uid.unwrap_or(u32::MAX)));
        format!("({})", parts.join(" "))
    }

    /// True when `uid` falls inside the `min_uid:*` range.
    pub fn admits(&self, uid: u32) -> bool {
        self.min_uid.is_some_and(|min| uid >= min)
    }

    /// No UID can satisfy the range; the search can be skipped.
    pub fn is_exhausted(&self) -> bool {
        self.min_uid.is_none()
    }
}

/// IMAP quoted string with `\` and `"` escaped.
fn quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for c in value.chars() {
        if c == '"' || c == '\\' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

/// Filter for messages newer than `cursor`.
pub fn build_filter(cursor: u32, criteria: &[(String, String)]) -> SearchFilter {
    SearchFilter {
        criteria: criteria.to_vec(),
        min_uid: cursor.checked_add(1),
    }
}

/// Highest ingested UID for one folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UidCursor {
    uid_max: u32,
    criteria: Vec<(String, String)>,
}

impl UidCursor {
    pub fn new(criteria: Vec<(String, String)>) -> Self {
        Self {
            uid_max: 0,
            criteria,
        }
    }

    pub fn uid_max(&self) -> u32 {
        self.uid_max
    }

    /// Filter for the next search.
    pub fn filter(&self) -> SearchFilter {
        build_filter(self.uid_max, &self.criteria)
    }

    /// Moves the cursor forward. Never moves it back.
    pub fn advance(&mut self, uid: u32) {
        self.uid_max = self.uid_max.max(uid);
    }

    /// Sets the cursor unconditionally (restore or UIDVALIDITY reset).
    pub fn reset(&mut self, uid: u32) {
        self.uid_max = uid;
    }

    /// Positions the cursor after the newest existing matching message so
    /// history is not ingested. Leaves the cursor untouched and returns
    /// `false` when the search fails.
    pub async fn initialize(&mut self, session: &mut dyn MailboxSession) -> bool {
        let filter = build_filter(0, &self.criteria);
        match session.search(&filter).await {
            Ok(uids) => {
                match uids.iter().copied().max() {
                    Some(max) => {
                        self.uid_max = self.uid_max.max(max);
                        info!(
                            "Cursor initialized at UID {} ({} existing messages skipped)",
                            self.uid_max,
                            uids.len()
                        );
                    }
                    None => debug!("No existing messages, cursor stays at {}", self.uid_max),
                }
                true
            }
            Err(e) => {
                warn!("Cursor initialization search failed: {}", e);
                false
            }
        }
    }
}
