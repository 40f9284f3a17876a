//! External ticket identifiers.
//!
//! IDs look like `TMS20250716482913`: the fixed prefix, the message date as
//! `YYYYMMDD` and a six digit fingerprint of the subject. Two different
//! subjects on the same day can collide; the store then treats the second
//! message as a duplicate.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, TimeZone, Utc};
use sha2::{Digest, Sha256};

/// Prefix shared by every generated ticket ID.
pub const TICKET_ID_PREFIX: &str = "TMS";

/// Derives the external ticket ID for a message.
///
/// Falls back to `TMS<unix seconds>` when `raw_date` cannot be parsed.
pub fn generate_ticket_id(subject: &str, raw_date: &str) -> String {
    match parse_mail_date(raw_date) {
        Some(date) => format!(
            "{}{}{}",
            TICKET_ID_PREFIX,
            date.format("%Y%m%d"),
            subject_fingerprint(subject)
        ),
        None => {
            log::debug!(
                "Unparsable date {:?}, using timestamp-based ticket ID",
                raw_date
            );
            format!("{}{}", TICKET_ID_PREFIX, Utc::now().timestamp())
        }
    }
}

/// Six decimal digits derived from a SHA-256 of the subject.
///
/// Stable across processes and platforms, unlike `std`'s randomized hasher.
pub fn subject_fingerprint(subject: &str) -> String {
    let digest = Sha256::digest(subject.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    format!("{:06}", u64::from_be_bytes(prefix) % 1_000_000)
}

/// Parses a mail `Date` header leniently.
///
/// Accepts RFC 2822 (with or without a trailing `(comment)`), RFC 3339,
/// `YYYY-MM-DD HH:MM:SS` and bare `YYYY-MM-DD`; the last two are read as
/// UTC. The returned value keeps the header's own offset so the calendar
/// date matches what the sender wrote.
pub fn parse_mail_date(raw: &str) -> Option<DateTime<FixedOffset>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    let without_comment = strip_trailing_comment(trimmed);

    if let Ok(dt) = DateTime::parse_from_rfc2822(without_comment) {
        return Some(dt);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(without_comment) {
        return Some(dt);
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(without_comment, "%Y-%m-%d %H:%M:%S") {
        return Some(Utc.from_utc_datetime(&naive).into());
    }
    if let Ok(date) = NaiveDate::parse_from_str(without_comment, "%Y-%m-%d") {
        let naive = date.and_hms_opt(0, 0, 0)?;
        return Some(Utc.from_utc_datetime(&naive).into());
    }

    None
}

/// Removes a trailing `(...)` comment such as `(UTC)` or `(PDT)`.
fn strip_trailing_comment(value: &str) -> &str {
    if value.ends_with(')') {
        if let Some(open) = value.rfind('(') {
            return value[..open].trim_end();
        }
    }
    value
}
