//! Serialising messages into mbox form.
//!
//! Shared by append and by the compactor when it re-serialises a record:
//! the separator line, the original headers minus the structural lines we
//! regenerate, fresh `X-IMAPbase:` / `Status:` / `X-UID:` lines, the blank
//! line, and the body with `From ` lines escaped.

use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{MboxError, Phase, Result};
use crate::model::attribute::{status_line, Flags};
use crate::model::envelope::Envelope;
use crate::parser::header::{self, HeaderKind};
use crate::parser::separator;
use crate::stream::ByteStream;
use crate::uid::UidState;

/// Split a raw message into its header block and body.
///
/// The header block keeps its terminating blank line. A message without a
/// blank line is all header.
pub fn split_message(raw: &[u8]) -> (&[u8], &[u8]) {
    let mut pos = 0;
    for line in raw.split_inclusive(|&b| b == b'\n') {
        pos += line.len();
        if separator::is_blank_line(line) {
            return raw.split_at(pos);
        }
    }
    (raw, &[])
}

/// Peel a leading separator line off a raw message, if it has one.
pub fn strip_separator(raw: &[u8]) -> (Option<&[u8]>, &[u8]) {
    let first_len = raw
        .iter()
        .position(|&b| b == b'\n')
        .map_or(raw.len(), |p| p + 1);
    if separator::is_separator(&raw[..first_len]) {
        (Some(&raw[..first_len]), &raw[first_len..])
    } else {
        (None, raw)
    }
}

/// Copy header lines, dropping the structural ones we regenerate.
///
/// Continuation lines follow the fate of the field they belong to. A line
/// that would read as a separator is quoted with `>`. The terminating blank
/// line is not written.
pub fn write_headers<W: Write>(out: &mut W, head: &[u8], drop_content_length: bool) -> io::Result<()> {
    let mut skipping = false;
    for line in head.split_inclusive(|&b| b == b'\n') {
        if separator::is_blank_line(line) {
            break;
        }
        let kind = header::classify(line);
        if kind != HeaderKind::Continuation {
            skipping = header::is_regenerated(kind)
                || (drop_content_length && kind == HeaderKind::ContentLength);
        }
        if skipping {
            continue;
        }
        if separator::is_separator(line) {
            out.write_all(b">")?;
        }
        out.write_all(line)?;
        if !line.ends_with(b"\n") {
            out.write_all(b"\n")?;
        }
    }
    Ok(())
}

/// Write the regenerated structural lines and the blank line ending the headers.
pub fn write_structural<W: Write>(
    out: &mut W,
    flags: Flags,
    uid: u64,
    generation: Option<(u64, u64)>,
) -> io::Result<()> {
    if let Some((uidvalidity, uidnext)) = generation {
        writeln!(out, "X-IMAPbase: {uidvalidity} {uidnext:010}")?;
    }
    if let Some(status) = status_line(flags) {
        out.write_all(status.as_bytes())?;
    }
    if uid != 0 {
        writeln!(out, "X-UID: {uid}")?;
    }
    out.write_all(b"\n")
}

/// Whether a body line would be mistaken for (or is an escaped) separator.
fn needs_escape(line: &[u8]) -> bool {
    let unquoted = &line[line.iter().take_while(|&&b| b == b'>').count()..];
    unquoted.starts_with(b"From ")
}

/// Write a body with `>` prepended to every line matching `>*From `.
///
/// Returns the number of lines written. The body always ends with a newline.
pub fn write_escaped_body<W: Write>(out: &mut W, body: &[u8]) -> io::Result<u64> {
    let mut lines = 0;
    for line in body.split_inclusive(|&b| b == b'\n') {
        if needs_escape(line) {
            out.write_all(b">")?;
        }
        out.write_all(line)?;
        lines += 1;
    }
    if !body.is_empty() && !body.ends_with(b"\n") {
        out.write_all(b"\n")?;
    }
    Ok(lines)
}

/// Render one complete message for appending, terminating blank line included.
pub fn render_message(
    raw: &[u8],
    envelope: Option<&Envelope>,
    flags: Flags,
    uid: u64,
    generation: Option<(u64, u64)>,
) -> io::Result<Vec<u8>> {
    let (embedded, message) = strip_separator(raw);
    let envelope = match (envelope, embedded) {
        (Some(env), _) => env.clone(),
        (None, Some(line)) => Envelope::from_separator(line),
        (None, None) => Envelope::now(),
    };
    let (head, body) = split_message(message);

    let mut out = Vec::with_capacity(raw.len() + 128);
    out.write_all(envelope.to_separator().as_bytes())?;
    write_headers(&mut out, head, true)?;
    write_structural(&mut out, flags & Flags::PERSISTENT, uid, generation)?;
    write_escaped_body(&mut out, body)?;
    out.write_all(b"\n")?;
    Ok(out)
}

/// A message handed to append.
#[derive(Debug, Clone, Copy)]
pub struct NewMessage<'a> {
    /// Headers, blank line and body. A leading separator line is allowed.
    pub raw: &'a [u8],
    pub envelope: Option<&'a Envelope>,
    pub flags: Flags,
}

/// Append one message at the end of the stream.
///
/// The caller holds the exclusive lock and has scanned the mailbox up to
/// `size`. Returns the offset the message starts at. On failure the stream
/// is cut back to `size`.
pub(crate) fn append_message(
    stream: &Arc<dyn ByteStream>,
    path: &Path,
    size: u64,
    uids: &mut UidState,
    first_message: bool,
    message: NewMessage<'_>,
) -> Result<u64> {
    uids.ensure_generation();
    let mut pending = *uids;
    let uid = pending.allocate();
    let generation = first_message.then(|| pending.as_pair());

    let mut bytes = Vec::new();
    if size > 0 && !ends_with_newline(stream.as_ref(), size, path)? {
        bytes.push(b'\n');
    }
    let offset = size + bytes.len() as u64;
    let rendered = render_message(message.raw, message.envelope, message.flags, uid, generation)
        .map_err(|e| MboxError::io(Phase::Append, offset, path, e))?;
    bytes.extend_from_slice(&rendered);

    let written = stream
        .write_at(&bytes, size)
        .and_then(|_| stream.flush());
    if let Err(e) = written {
        warn!(path = %path.display(), offset = size, error = %e, "Append failed, rolling back");
        if let Err(undo) = stream.truncate(size) {
            warn!(path = %path.display(), error = %undo, "Could not roll back partial append");
        }
        return Err(MboxError::io(Phase::Append, size, path, e));
    }

    *uids = pending;
    debug!(path = %path.display(), offset, uid, bytes = bytes.len(), "Appended message");
    Ok(offset)
}

fn ends_with_newline(stream: &dyn ByteStream, size: u64, path: &Path) -> Result<bool> {
    let mut last = [0u8; 1];
    let n = stream
        .read_at(&mut last, size - 1)
        .map_err(|e| MboxError::io(Phase::Read, size - 1, path, e))?;
    Ok(n == 1 && last[0] == b'\n')
}
