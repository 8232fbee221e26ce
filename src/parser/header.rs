//! Header lines with structural meaning for the mailbox, and the
//! per-message header summary cache.
//!
//! Only a handful of fields are interpreted:
//!
//! - `Status:` carries the persisted attribute letters.
//! - `X-IMAPbase: <uidvalidity> <uidnext>` appears on the first message only.
//! - `X-UID: <uid>` carries the message UID.
//! - `Content-Length:` is dropped when a message body is replaced.
//!
//! Everything else is opaque and only counted.

use std::num::NonZeroUsize;

use lru::LruCache;

/// The structural role of a header line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderKind {
    Status,
    ImapBase,
    Uid,
    ContentLength,
    /// Folded continuation of the previous field.
    Continuation,
    Other,
}

/// Classify a raw header line.
pub fn classify(line: &[u8]) -> HeaderKind {
    if line.first().is_some_and(|&b| b == b' ' || b == b'\t') {
        return HeaderKind::Continuation;
    }
    if has_field_name(line, "status") {
        HeaderKind::Status
    } else if has_field_name(line, "x-imapbase") {
        HeaderKind::ImapBase
    } else if has_field_name(line, "x-uid") {
        HeaderKind::Uid
    } else if has_field_name(line, "content-length") {
        HeaderKind::ContentLength
    } else {
        HeaderKind::Other
    }
}

/// Header lines the engine regenerates instead of copying.
pub fn is_regenerated(kind: HeaderKind) -> bool {
    matches!(
        kind,
        HeaderKind::Status | HeaderKind::ImapBase | HeaderKind::Uid
    )
}

/// Case-insensitive `name` followed by `:`, space or tab.
fn has_field_name(line: &[u8], name: &str) -> bool {
    let n = name.len();
    line.len() > n
        && line[..n].eq_ignore_ascii_case(name.as_bytes())
        && matches!(line[n], b':' | b' ' | b'\t')
}

/// The value part of a header line (after the first colon), trimmed.
pub fn field_value(line: &[u8]) -> &[u8] {
    match line.iter().position(|&b| b == b':') {
        Some(pos) => line[pos + 1..].trim_ascii(),
        None => &[],
    }
}

/// Split a header line into `(name, value)`.
pub fn split_field(line: &[u8]) -> Option<(&[u8], &[u8])> {
    let pos = line.iter().position(|&b| b == b':')?;
    let name = line[..pos].trim_ascii();
    if name.is_empty() {
        return None;
    }
    Some((name, line[pos + 1..].trim_ascii()))
}

/// Parse `X-IMAPbase: <uidvalidity> <uidnext>`.
pub fn parse_imapbase(line: &[u8]) -> Option<(u64, u64)> {
    let value = std::str::from_utf8(field_value(line)).ok()?;
    let mut parts = value.split_ascii_whitespace();
    let uidvalidity = parts.next()?.parse().ok()?;
    let uidnext = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    Some((uidvalidity, uidnext))
}

/// Parse `X-UID: <uid>`.
pub fn parse_uid(line: &[u8]) -> Option<u64> {
    std::str::from_utf8(field_value(line)).ok()?.parse().ok()
}

/// Decode raw header bytes to a string.
///
/// Tries UTF-8 first, then falls back to Windows-1252 (which accepts every byte).
pub fn decode_header_bytes(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => {
            let (decoded, _, _) = encoding_rs::WINDOWS_1252.decode(bytes);
            decoded.into_owned()
        }
    }
}

/// Find the first value of `name` in a raw header block, unfolding
/// continuation lines.
pub fn find_field(headers: &[u8], name: &str) -> Option<String> {
    let mut found: Option<String> = None;
    for line in headers.split_inclusive(|&b| b == b'\n') {
        let trimmed = line.trim_ascii_end();
        if trimmed.is_empty() {
            break;
        }
        if let Some(value) = found.as_mut() {
            if classify(line) == HeaderKind::Continuation {
                value.push(' ');
                value.push_str(&decode_header_bytes(trimmed.trim_ascii()));
                continue;
            }
            break;
        }
        if let Some((field, value)) = split_field(trimmed) {
            if field.eq_ignore_ascii_case(name.as_bytes()) {
                found = Some(decode_header_bytes(value));
            }
        }
    }
    found
}

/// Bounded cache of selected header values, keyed by message UID.
///
/// Lets summary displays show sender / subject / date without reading the
/// mailbox file again. Least recently inserted messages fall out first.
#[derive(Debug)]
pub struct HeaderCache {
    fields: Vec<String>,
    entries: LruCache<u64, Vec<(String, String)>>,
}

impl HeaderCache {
    pub fn new(fields: &[String], capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            fields: fields.iter().map(|f| f.to_ascii_lowercase()).collect(),
            entries: LruCache::new(capacity),
        }
    }

    /// Whether `name` is one of the cached fields.
    pub fn tracks(&self, name: &str) -> bool {
        self.fields.iter().any(|f| f.eq_ignore_ascii_case(name))
    }

    /// Look up a cached value without disturbing recency.
    ///
    /// `Some(None)` means the message is cached and has no such field.
    pub fn peek(&self, uid: u64, name: &str) -> Option<Option<&str>> {
        if !self.tracks(name) {
            return None;
        }
        let fields = self.entries.peek(&uid)?;
        Some(
            fields
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_str()),
        )
    }

    pub fn insert(&mut self, uid: u64, fields: Vec<(String, String)>) {
        self.entries.put(uid, fields);
    }

    pub fn evict(&mut self, uid: u64) {
        self.entries.pop(&uid);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Accumulates the tracked fields of one message while it is being scanned.
#[derive(Debug, Default)]
pub struct FieldCollector {
    fields: Vec<(String, String)>,
    /// Whether the last field seen is one we keep (for continuations).
    in_tracked: bool,
}

impl FieldCollector {
    pub fn feed(&mut self, cache: &HeaderCache, line: &[u8]) {
        let trimmed = line.trim_ascii_end();
        if classify(line) == HeaderKind::Continuation {
            if self.in_tracked {
                if let Some((_, value)) = self.fields.last_mut() {
                    value.push(' ');
                    value.push_str(&decode_header_bytes(trimmed.trim_ascii()));
                }
            }
            return;
        }
        self.in_tracked = false;
        if let Some((name, value)) = split_field(trimmed) {
            let name = decode_header_bytes(name);
            if cache.tracks(&name) {
                self.fields.push((name, decode_header_bytes(value)));
                self.in_tracked = true;
            }
        }
    }

    pub fn finish(self) -> Vec<(String, String)> {
        self.fields
    }
}
