//! Turns raw RFC 822 bytes into the fields a ticket needs.
//!
//! Parsing is total: a message that cannot be understood still yields a
//! `ParsedEmail`, with whatever could be recovered from the raw header block.

use std::sync::LazyLock;

use base64::Engine;
use log::debug;
use mail_parser::{Address, Message, MessageParser, MessagePart, MimeHeaders, PartType};
use regex::Regex;

use super::client::RawMessage;

static RE_ENCODED_WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"=\?([^?\s]+)\?([BbQq])\?([^?\s]*)\?=").unwrap());
static RE_HTML_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]+>").unwrap());
static RE_WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// Ticket-relevant content of one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedEmail {
    pub subject: String,
    pub sender: String,
    pub recipient: String,
    /// `Date` header exactly as sent (unfolded, trimmed).
    pub raw_date: String,
    pub body: String,
    pub source_uid: u32,
}

/// Parses a fetched message. Never fails.
pub fn parse_email(raw: &RawMessage) -> ParsedEmail {
    let headers = RawHeaders::from_bytes(&raw.bytes);
    let raw_date = headers.get("Date").unwrap_or_default();

    let Some(message) = MessageParser::default().parse(&raw.bytes) else {
        debug!("UID {} is not parseable as MIME, using raw fallback", raw.uid);
        return ParsedEmail {
            subject: headers.decoded("Subject"),
            sender: headers.decoded("From"),
            recipient: headers.decoded("To"),
            raw_date,
            body: raw_body_text(&raw.bytes),
            source_uid: raw.uid,
        };
    };

    let subject = message
        .subject()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| headers.decoded("Subject"));
    let sender = message
        .from()
        .map(format_address_list)
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| headers.decoded("From"));
    let recipient = message
        .to()
        .map(format_address_list)
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| headers.decoded("To"));

    ParsedEmail {
        subject,
        sender,
        recipient,
        raw_date,
        body: extract_body(&message),
        source_uid: raw.uid,
    }
}

/// Renders addresses as `Name <addr>` or `addr`, joined with `, `.
fn format_address_list(address: &Address) -> String {
    address
        .iter()
        .map(format_address)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(", ")
}

fn format_address(addr: &mail_parser::Addr) -> String {
    match (addr.name(), addr.address()) {
        (Some(name), Some(address)) if !name.is_empty() => format!("{} <{}>", name, address),
        (_, Some(address)) => address.to_string(),
        (Some(name), None) => name.to_string(),
        (None, None) => String::new(),
    }
}

/// Plain text wins; tag-stripped HTML is used only when no plain text
/// exists. Attachments and container parts are skipped.
fn extract_body(message: &Message) -> String {
    let mut plain = String::new();
    let mut html = String::new();

    for part in &message.parts {
        if is_attachment(part) {
            continue;
        }
        match &part.body {
            PartType::Text(text) if is_plain_text(part) => plain.push_str(text),
            PartType::Html(markup) => html.push_str(&strip_html(markup)),
            _ => {}
        }
    }

    let body = if plain.trim().is_empty() { html } else { plain };
    body.trim().to_string()
}

fn is_attachment(part: &MessagePart) -> bool {
    part.content_disposition()
        .is_some_and(|d| d.ctype().to_ascii_lowercase().contains("attachment"))
}

/// Untyped parts default to `text/plain`.
fn is_plain_text(part: &MessagePart) -> bool {
    match part.content_type() {
        None => true,
        Some(ct) => {
            ct.ctype().eq_ignore_ascii_case("text")
                && ct.subtype().map_or(true, |s| s.eq_ignore_ascii_case("plain"))
        }
    }
}

/// Removes tags, decodes the common entities and collapses whitespace.
pub fn strip_html(markup: &str) -> String {
    let without_tags = RE_HTML_TAG.replace_all(markup, "");
    let decoded = without_tags
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&");
    RE_WHITESPACE.replace_all(&decoded, " ").trim().to_string()
}

/// Body text after the first blank line, for messages mail-parser rejects.
fn raw_body_text(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let body = text
        .find("\r\n\r\n")
        .map(|i| &text[i + 4..])
        .or_else(|| text.find("\n\n").map(|i| &text[i + 2..]))
        .unwrap_or("");
    body.trim().to_string()
}

/// Unfolded header block of a message.
struct RawHeaders {
    lines: Vec<String>,
}

impl RawHeaders {
    fn from_bytes(bytes: &[u8]) -> Self {
        let text = String::from_utf8_lossy(bytes);
        let mut lines: Vec<String> = Vec::new();

        for line in text.lines() {
            if line.is_empty() {
                break;
            }
            if line.starts_with(' ') || line.starts_with('\t') {
                if let Some(last) = lines.last_mut() {
                    last.push(' ');
                    last.push_str(line.trim());
                    continue;
                }
            }
            lines.push(line.trim_end().to_string());
        }

        Self { lines }
    }

    /// First value of the named header, trimmed.
    fn get(&self, name: &str) -> Option<String> {
        self.lines.iter().find_map(|line| {
            let (key, value) = line.split_once(':')?;
            key.trim()
                .eq_ignore_ascii_case(name)
                .then(|| value.trim().to_string())
        })
    }

    /// Header value with RFC 2047 encoded words decoded; empty when absent.
    fn decoded(&self, name: &str) -> String {
        self.get(name)
            .map(|v| decode_header_value(&v))
            .unwrap_or_default()
    }
}

/// Decodes RFC 2047 encoded words (`=?charset?B|Q?text?=`).
///
/// UTF-8, US-ASCII and ISO-8859-1 are decoded natively; any other charset
/// is read as lossy UTF-8. Whitespace between adjacent encoded words is
/// dropped. Malformed words are kept verbatim.
pub fn decode_header_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut last_end = 0;
    let mut previous_was_encoded = false;

    for caps in RE_ENCODED_WORD.captures_iter(value) {
        let Some(whole) = caps.get(0) else { continue };
        let between = &value[last_end..whole.start()];
        if !(previous_was_encoded && between.trim().is_empty()) {
            out.push_str(between);
        }

        match decode_encoded_word(&caps[1], &caps[2], &caps[3]) {
            Some(decoded) => {
                out.push_str(&decoded);
                previous_was_encoded = true;
            }
            None => {
                out.push_str(whole.as_str());
                previous_was_encoded = false;
            }
        }
        last_end = whole.end();
    }

    out.push_str(&value[last_end..]);
    out
}

fn decode_encoded_word(charset: &str, encoding: &str, text: &str) -> Option<String> {
    let bytes = if encoding.eq_ignore_ascii_case("b") {
        base64::engine::general_purpose::STANDARD
            .decode(text)
            .or_else(|_| base64::engine::general_purpose::STANDARD_NO_PAD.decode(text))
            .ok()?
    } else {
        decode_q(text)?
    };

    // RFC 2231 language suffix: "utf-8*en".
    let charset = charset.split('*').next().unwrap_or(charset).to_ascii_lowercase();
    Some(match charset.as_str() {
        "iso-8859-1" | "latin1" | "latin-1" => bytes.iter().map(|&b| b as char).collect(),
        _ => String::from_utf8_lossy(&bytes).into_owned(),
    })
}

/// Q encoding: `_` is a space, `=XX` a hex byte.
fn decode_q(text: &str) -> Option<Vec<u8>> {
    let raw = text.as_bytes();
    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        match raw[i] {
            b'_' => out.push(b' '),
            b'=' => {
                let hex = text.get(i + 1..i + 3)?;
                out.push(u8::from_str_radix(hex, 16).ok()?);
                i += 2;
            }
            b => out.push(b),
        }
        i += 1;
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(uid: u32, text: &str) -> RawMessage {
        RawMessage {
            uid,
            bytes: text.as_bytes().to_vec(),
        }
    }

    #[test]
    fn test_simple_plain_message() {
        let parsed = parse_email(&raw(
            7,
            "From: \"Contabo Abuse\" <abuse@contabo.com>\r\n\
             To: ops@example.com\r\n\
             Subject: Abuse report for 203.0.113.5\r\n\
             Date: Wed, 16 Jul 2025 10:15:00 +0000 (UTC)\r\n\
             \r\n\
             We received a complaint.\r\n",
        ));

        assert_eq!(parsed.subject, "Abuse report for 203.0.113.5");
        assert_eq!(parsed.sender, "Contabo Abuse <abuse@contabo.com>");
        assert_eq!(parsed.recipient, "ops@example.com");
        assert_eq!(parsed.raw_date, "Wed, 16 Jul 2025 10:15:00 +0000 (UTC)");
        assert_eq!(parsed.body, "We received a complaint.");
        assert_eq!(parsed.source_uid, 7);
    }

    #[test]
    fn test_html_only_multipart() {
        let parsed = parse_email(&raw(
            1,
            "From: abuse@contabo.com\r\n\
             Subject: HTML\r\n\
             MIME-Version: 1.0\r\n\
             Content-Type: multipart/alternative; boundary=\"b1\"\r\n\
             \r\n\
             --b1\r\n\
             Content-Type: text/html; charset=utf-8\r\n\
             \r\n\
             <p>Hello  world</p>\r\n\
             --b1--\r\n",
        ));
        assert_eq!(parsed.body, "Hello world");
    }

    #[test]
    fn test_plain_preferred_over_html() {
        let parsed = parse_email(&raw(
            1,
            "From: abuse@contabo.com\r\n\
             Subject: Both\r\n\
             MIME-Version: 1.0\r\n\
             Content-Type: multipart/alternative; boundary=\"b1\"\r\n\
             \r\n\
             --b1\r\n\
             Content-Type: text/plain; charset=utf-8\r\n\
             \r\n\
             Plain version\r\n\
             --b1\r\n\
             Content-Type: text/html; charset=utf-8\r\n\
             \r\n\
             <b>HTML version</b>\r\n\
             --b1--\r\n",
        ));
        assert_eq!(parsed.body, "Plain version");
    }

    #[test]
    fn test_attachments_are_skipped() {
        let parsed = parse_email(&raw(
            1,
            "From: abuse@contabo.com\r\n\
             Subject: With attachment\r\n\
             MIME-Version: 1.0\r\n\
             Content-Type: multipart/mixed; boundary=\"b2\"\r\n\
             \r\n\
             --b2\r\n\
             Content-Type: text/plain\r\n\
             \r\n\
             Main text\r\n\
             --b2\r\n\
             Content-Type: text/plain\r\n\
             Content-Disposition: attachment; filename=\"log.txt\"\r\n\
             \r\n\
             attached log line\r\n\
             --b2--\r\n",
        ));
        assert_eq!(parsed.body, "Main text");
    }

    #[test]
    fn test_encoded_headers() {
        let parsed = parse_email(&raw(
            1,
            "From: =?UTF-8?B?Q29udGFibyBBYnVzZQ==?= <abuse@contabo.com>\r\n\
             To: a@example.com, B Person <b@example.com>\r\n\
             Subject: =?ISO-8859-1?Q?Beschwerde_=FCber_Spam?=\r\n\
             Date: Wed, 16 Jul 2025 10:15:00 +0200\r\n\
             \r\n\
             body\r\n",
        ));
        assert_eq!(parsed.subject, "Beschwerde über Spam");
        assert_eq!(parsed.sender, "Contabo Abuse <abuse@contabo.com>");
        assert_eq!(parsed.recipient, "a@example.com, B Person <b@example.com>");
    }

    #[test]
    fn test_folded_date_header() {
        let parsed = parse_email(&raw(
            1,
            "Subject: x\r\nDate: Wed, 16 Jul 2025\r\n 10:15:00 +0000\r\n\r\nbody\r\n",
        ));
        assert_eq!(parsed.raw_date, "Wed, 16 Jul 2025 10:15:00 +0000");
    }

    #[test]
    fn test_missing_headers_are_empty() {
        let parsed = parse_email(&raw(3, "Subject: only subject\r\n\r\nbody\r\n"));
        assert_eq!(parsed.sender, "");
        assert_eq!(parsed.recipient, "");
        assert_eq!(parsed.raw_date, "");
    }

    #[test]
    fn test_empty_input_is_total() {
        let parsed = parse_email(&raw(9, ""));
        assert_eq!(parsed.subject, "");
        assert_eq!(parsed.body, "");
        assert_eq!(parsed.source_uid, 9);
    }

    #[test]
    fn test_binary_garbage_is_total() {
        let message = RawMessage {
            uid: 4,
            bytes: vec![0xff, 0xfe, 0x00, 0x80, b'\n', b'\n', 0xc3],
        };
        let parsed = parse_email(&message);
        assert_eq!(parsed.source_uid, 4);
    }

    #[test]
    fn test_decode_header_value() {
        assert_eq!(decode_header_value("plain text"), "plain text");
        assert_eq!(decode_header_value("=?utf-8?B?SGVsbG8=?="), "Hello");
        assert_eq!(decode_header_value("=?us-ascii?Q?a_b=21?="), "a b!");
        assert_eq!(
            decode_header_value("=?UTF-8?Q?foo?= =?UTF-8?Q?bar?= baz"),
            "foobar baz"
        );
        assert_eq!(decode_header_value("Re: =?utf-8?B?w6k=?="), "Re: é");
        assert_eq!(decode_header_value("=?koi8-r?B?SGk=?="), "Hi");
        assert_eq!(decode_header_value("=?utf-8?Q?bad=ZZ?="), "=?utf-8?Q?bad=ZZ?=");
    }

    #[test]
    fn test_strip_html() {
        assert_eq!(strip_html("<p>Hello  world</p>"), "Hello world");
        assert_eq!(
            strip_html("<div>\n  Port&nbsp;scan &amp; spam\n</div>"),
            "Port scan & spam"
        );
    }
}
