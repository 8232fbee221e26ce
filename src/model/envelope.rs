//! The envelope sender and date carried by a message's separator line.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use tracing::warn;

use crate::parser::separator;

/// `asctime`-style layout used when writing separator lines.
const SEPARATOR_DATE_FORMAT: &str = "%a %b %e %H:%M:%S %Y";

/// Sender used when nothing better is known.
pub const UNKNOWN_SENDER: &str = "MAILER-DAEMON";

/// Envelope sender and date.
///
/// The date is kept as the raw text found in the separator so it is written
/// back unchanged; [`Envelope::date_time`] interprets it on demand.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Envelope {
    pub sender: String,
    pub date: String,
}

impl Envelope {
    pub fn new(sender: impl Into<String>, date: DateTime<Utc>) -> Self {
        Self {
            sender: sender.into(),
            date: date.format(SEPARATOR_DATE_FORMAT).to_string(),
        }
    }

    /// Envelope for a message with no known origin, stamped now.
    pub fn now() -> Self {
        Self::new(UNKNOWN_SENDER, Utc::now())
    }

    /// Parse a separator line. Returns an empty envelope if the line is malformed.
    pub fn from_separator(line: &[u8]) -> Self {
        match separator::locate(line) {
            Some(layout) => {
                let s = separator::trim_line(line);
                Self {
                    sender: String::from_utf8_lossy(&s[5..layout.sender_end])
                        .trim()
                        .to_string(),
                    date: String::from_utf8_lossy(&s[layout.date_start..layout.date_end])
                        .to_string(),
                }
            }
            None => {
                warn!(
                    line = %String::from_utf8_lossy(separator::trim_line(line)),
                    "Malformed separator line, envelope left empty"
                );
                Self::default()
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sender.is_empty() && self.date.is_empty()
    }

    /// Render the separator line, newline included.
    ///
    /// Missing parts are filled in so the result is always a valid separator.
    pub fn to_separator(&self) -> String {
        let sender = if self.sender.trim().is_empty() {
            UNKNOWN_SENDER
        } else {
            self.sender.trim()
        };
        let candidate = format!("From {} {}\n", sender, self.date.trim());
        if separator::is_separator(candidate.as_bytes()) {
            candidate
        } else {
            format!(
                "From {} {}\n",
                sender,
                Utc::now().format(SEPARATOR_DATE_FORMAT)
            )
        }
    }

    /// Interpret the envelope date.
    pub fn date_time(&self) -> Option<DateTime<Utc>> {
        parse_separator_date(&self.date)
    }
}

/// Parse the date of a separator line in any of the accepted layouts.
pub fn parse_separator_date(date: &str) -> Option<DateTime<Utc>> {
    let normalized = date.split_ascii_whitespace().collect::<Vec<_>>().join(" ");
    if normalized.is_empty() {
        return None;
    }

    let with_zone = [
        "%a %b %d %H:%M:%S %z %Y",
        "%a %b %d %H:%M %z %Y",
        "%a %b %d %H:%M:%S %Y %z",
        "%a %b %d %H:%M %Y %z",
    ];
    for fmt in &with_zone {
        if let Ok(dt) = DateTime::parse_from_str(&normalized, fmt) {
            return Some(dt.with_timezone(&Utc));
        }
    }

    // Named zones are ignored: drop the three-letter token and read as UTC.
    let without_name: String = normalized
        .split(' ')
        .filter(|tok| !(tok.len() == 3 && tok.chars().all(|c| c.is_ascii_uppercase())))
        .collect::<Vec<_>>()
        .join(" ");
    let naive = ["%a %b %d %H:%M:%S %Y", "%a %b %d %H:%M %Y"];
    for candidate in [&normalized, &without_name] {
        for fmt in &naive {
            if let Ok(ndt) = NaiveDateTime::parse_from_str(candidate, fmt) {
                return Some(Utc.from_utc_datetime(&ndt));
            }
        }
    }
    None
}
