//! Envelope parsing and body cleanup for downloaded RFC 822 messages.

use std::sync::LazyLock;

use chrono::{DateTime, TimeZone, Utc};
use mail_parser::{Addr, MessageParser};
use regex::Regex;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ContentError {
    #[error("message could not be parsed as RFC 822")]
    Unparseable,
}

/// The parts of a message the archive and the AI pipeline care about.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedEmail {
    pub subject: Option<String>,
    pub sender: Option<String>,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub date: Option<DateTime<Utc>>,
    /// Cleaned body text: quotes, reply chains and footers removed.
    pub body: String,
    pub has_list_unsubscribe: bool,
    /// The raw body mentioned unsubscribing (footers are gone from `body`).
    pub mentions_unsubscribe: bool,
}

impl ParsedEmail {
    pub fn parse(raw: &[u8]) -> Result<Self, ContentError> {
        let message = MessageParser::default()
            .parse(raw)
            .ok_or(ContentError::Unparseable)?;

        let addresses = |addr: Option<&mail_parser::Address>| -> Vec<String> {
            addr.map(|a| a.iter().map(format_address).collect())
                .unwrap_or_default()
        };

        let raw_body = match message.body_text(0) {
            Some(text) => text.into_owned(),
            None => message
                .body_html(0)
                .map(|html| html_to_text(&html))
                .unwrap_or_default(),
        };
        let mentions_unsubscribe = raw_body.to_lowercase().contains("unsubscribe");

        Ok(Self {
            subject: message.subject().map(str::to_string),
            sender: message
                .from()
                .and_then(|addr| addr.first())
                .map(format_address),
            to: addresses(message.to()),
            cc: addresses(message.cc()),
            bcc: addresses(message.bcc()),
            date: message
                .date()
                .and_then(|d| Utc.timestamp_opt(d.to_timestamp(), 0).single()),
            body: clean_body(&raw_body),
            has_list_unsubscribe: message.header_raw("List-Unsubscribe").is_some(),
            mentions_unsubscribe,
        })
    }

    /// Whether there is anything for a model to look at.
    pub fn is_empty(&self) -> bool {
        self.body.trim().is_empty() && self.subject.as_deref().is_none_or(|s| s.trim().is_empty())
    }

    /// Header summary plus a body preview capped at `max_body_chars`.
    pub fn prompt_block(&self, max_body_chars: usize) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "Subject: {}\n",
            self.subject.as_deref().unwrap_or("(no subject)")
        ));
        out.push_str(&format!(
            "From: {}\n",
            self.sender.as_deref().unwrap_or("(unknown)")
        ));
        if !self.to.is_empty() {
            out.push_str(&format!("To: {}\n", self.to.join(", ")));
        }
        if !self.cc.is_empty() {
            out.push_str(&format!("Cc: {}\n", self.cc.join(", ")));
        }
        if let Some(date) = self.date {
            out.push_str(&format!("Date: {}\n", date.to_rfc3339()));
        }
        out.push('\n');
        out.push_str(&truncate_chars(&self.body, max_body_chars));
        out
    }
}

fn format_address(addr: &Addr) -> String {
    match (addr.name(), addr.address()) {
        (Some(name), Some(address)) => format!("{name} <{address}>"),
        (None, Some(address)) => address.to_string(),
        (Some(name), None) => name.to_string(),
        (None, None) => String::new(),
    }
}

pub fn html_to_text(html: &str) -> String {
    let stripped = SCRIPT_STYLE.replace_all(html, "");
    let mut bytes = std::io::Cursor::new(stripped.as_bytes());
    html2text::from_read(&mut bytes, 100)
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Cuts to at most `max_chars` characters without splitting a code point.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

static SCRIPT_STYLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<(script|style)[^>]*>.*?</(script|style)>").expect("valid regex")
});
static REPLY_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^On .* wrote:$").expect("valid regex"));
static FORWARD_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^-{2,}\s*(original message|forwarded message)\s*-{2,}$").expect("valid regex")
});
static FOOTER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)unsubscribe|privacy policy|terms of service|view in (your )?browser|copyright \d{4}|©\s*\d{4}")
        .expect("valid regex")
});
static BLANK_RUNS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n{3,}").expect("valid regex"));

/// Strips the noise a model doesn't need: quoted lines, everything after a
/// reply marker, short footer lines, and runs of blank lines.
pub fn clean_body(text: &str) -> String {
    let mut kept = Vec::new();

    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with('>') {
            continue;
        }
        if REPLY_MARKER.is_match(trimmed) || FORWARD_HEADER.is_match(trimmed) {
            break;
        }
        if trimmed.chars().count() < 100 && FOOTER.is_match(trimmed) {
            continue;
        }
        kept.push(line.trim_end());
    }

    BLANK_RUNS
        .replace_all(&kept.join("\n"), "\n\n")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAIN: &str = "From: Alice Example <alice@example.com>\r\n\
To: bob@example.com, Carol <carol@example.com>\r\n\
Cc: dave@example.com\r\n\
Subject: Quarterly invoice\r\n\
Date: Tue, 1 Oct 2024 10:00:00 +0000\r\n\
Message-ID: <abc@example.com>\r\n\
List-Unsubscribe: <mailto:unsub@example.com>\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
\r\n\
Hi Bob,\r\n\
\r\n\
Please find the invoice attached.\r\n\
\r\n\
\r\n\
\r\n\
> earlier quoted text\r\n\
Click here to unsubscribe\r\n\
On Mon, Sep 30, 2024 at 9:00 AM Bob wrote:\r\n\
Old thread content\r\n";

    #[test]
    fn parses_envelope_and_cleans_body() {
        let email = ParsedEmail::parse(PLAIN.as_bytes()).expect("parse");

        assert_eq!(email.subject.as_deref(), Some("Quarterly invoice"));
        assert_eq!(
            email.sender.as_deref(),
            Some("Alice Example <alice@example.com>")
        );
        assert_eq!(
            email.to,
            vec![
                "bob@example.com".to_string(),
                "Carol <carol@example.com>".to_string()
            ]
        );
        assert_eq!(email.cc, vec!["dave@example.com".to_string()]);
        assert_eq!(
            email.date.map(|d| d.timestamp()),
            Some(1_727_776_800)
        );
        assert!(email.has_list_unsubscribe);
        assert!(email.mentions_unsubscribe);
        assert_eq!(email.body, "Hi Bob,\n\nPlease find the invoice attached.");
        assert!(!email.is_empty());
    }

    #[test]
    fn html_only_message_is_converted() {
        let raw = "From: shop@example.com\r\n\
Subject: Sale\r\n\
Content-Type: text/html; charset=utf-8\r\n\
\r\n\
<html><head><style>p { color: red; }</style></head><body><h1>Big sale</h1><p>Everything 50% off</p></body></html>\r\n";
        let email = ParsedEmail::parse(raw.as_bytes()).expect("parse");
        assert!(email.body.contains("Big sale"));
        assert!(email.body.contains("50% off"));
        assert!(!email.body.contains("color: red"));
        assert!(!email.has_list_unsubscribe);
    }

    #[test]
    fn clean_body_keeps_long_lines_mentioning_footer_words() {
        let long = format!(
            "We updated our privacy policy {}",
            "and this sentence keeps going with substantive content ".repeat(3)
        );
        let cleaned = clean_body(&format!("{long}\nprivacy policy"));
        assert_eq!(cleaned, long.trim_end());
    }

    #[test]
    fn clean_body_stops_at_forwarded_header() {
        let cleaned = clean_body("fyi\n---------- Forwarded message ----------\nold");
        assert_eq!(cleaned, "fyi");
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("hi", 10), "hi");
    }

    #[test]
    fn prompt_block_includes_headers_and_preview() {
        let email = ParsedEmail {
            subject: Some("Hello".into()),
            sender: Some("a@example.com".into()),
            to: vec!["b@example.com".into()],
            body: "x".repeat(50),
            ..ParsedEmail::default()
        };
        let block = email.prompt_block(10);
        assert!(block.starts_with("Subject: Hello\nFrom: a@example.com\nTo: b@example.com\n"));
        assert!(block.ends_with(&"x".repeat(10)));
        assert!(!block.contains(&"x".repeat(11)));
    }
}
