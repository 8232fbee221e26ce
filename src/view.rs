//! Message views: the reader-facing side of a message record.
//!
//! A view is attached lazily the first time a message is fetched and cached
//! on its record through a weak reference, so fetching the same message twice
//! returns the same view. Views never own the mailbox; they find their record
//! again by UID when attributes are read or changed.
//!
//! Once an expunge or rescan moves a message, its view is invalidated and
//! every further access reports [`MboxError::InvalidHandle`].

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crate::error::{MboxError, Phase, Result};
use crate::mailbox::Inner;
use crate::model::attribute::Flags;
use crate::model::envelope::Envelope;
use crate::model::record::MessageRecord;
use crate::parser::header;
use crate::stream::{ByteStream, SubStream};
use crate::writer::split_message;

/// Header, body, envelope and attribute access for one message.
pub struct MessageView {
    uid: u64,
    separator: SubStream,
    header: SubStream,
    body: SubStream,
    envelope: Mutex<Option<Envelope>>,
    envelope_changed: AtomicBool,
    replacement: Mutex<Option<Vec<u8>>>,
    live: Arc<AtomicBool>,
    mailbox: Weak<Inner>,
}

impl std::fmt::Debug for MessageView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageView")
            .field("uid", &self.uid)
            .field("header", &self.header)
            .field("body", &self.body)
            .field("live", &self.is_valid())
            .finish()
    }
}

fn poisoned() -> MboxError {
    MboxError::InvalidHandle("message view lock poisoned".into())
}

impl MessageView {
    pub(crate) fn attach(
        record: &MessageRecord,
        stream: &Arc<dyn ByteStream>,
        mailbox: Weak<Inner>,
    ) -> Self {
        let live = Arc::new(AtomicBool::new(true));
        let range = |start, end| {
            SubStream::new(Arc::clone(stream), start, end).with_liveness(Arc::clone(&live))
        };
        Self {
            uid: record.uid,
            separator: range(record.separator_start, record.separator_end),
            header: range(record.separator_end, record.body_start),
            body: range(record.body_start, record.body_end),
            envelope: Mutex::new(None),
            envelope_changed: AtomicBool::new(false),
            replacement: Mutex::new(None),
            live,
            mailbox,
        }
    }

    pub fn uid(&self) -> u64 {
        self.uid
    }

    /// Whether the view still refers to the message's current location.
    pub fn is_valid(&self) -> bool {
        self.live.load(Ordering::Acquire) && self.mailbox.strong_count() > 0
    }

    fn check(&self) -> Result<()> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(MboxError::InvalidHandle(format!(
                "message uid {} was moved or its mailbox closed",
                self.uid
            )))
        }
    }

    fn mailbox(&self) -> Result<Arc<Inner>> {
        self.check()?;
        self.mailbox
            .upgrade()
            .ok_or_else(|| MboxError::InvalidHandle("mailbox closed".into()))
    }

    fn read_range(&self, range: &SubStream) -> Result<Vec<u8>> {
        self.check()?;
        range.read_all().map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                MboxError::InvalidHandle(e.to_string())
            } else {
                let path = self
                    .mailbox
                    .upgrade()
                    .map(|m| m.path().to_path_buf())
                    .unwrap_or_default();
                MboxError::io(Phase::Read, range.start(), path, e)
            }
        })
    }

    fn replacement(&self) -> Result<MutexGuard<'_, Option<Vec<u8>>>> {
        self.replacement.lock().map_err(|_| poisoned())
    }

    /// 1-based position of the message in its mailbox.
    pub fn msgno(&self) -> Result<usize> {
        self.mailbox()?.position_of(self.uid).map(|pos| pos + 1)
    }

    /// Header stream, `[separator_end, body_start)` of the file.
    pub fn header_stream(&self) -> Result<SubStream> {
        self.check()?;
        Ok(self.header.clone())
    }

    /// Body stream, `[body_start, body_end)` of the file.
    pub fn body_stream(&self) -> Result<SubStream> {
        self.check()?;
        Ok(self.body.clone())
    }

    /// Raw header block, ending with the blank line when there is one.
    pub fn headers(&self) -> Result<Vec<u8>> {
        if let Some(raw) = self.replacement()?.as_ref() {
            return Ok(split_message(raw).0.to_vec());
        }
        self.read_range(&self.header)
    }

    pub fn body(&self) -> Result<Vec<u8>> {
        if let Some(raw) = self.replacement()?.as_ref() {
            return Ok(split_message(raw).1.to_vec());
        }
        self.read_range(&self.body)
    }

    /// Size of headers plus body in bytes.
    pub fn size(&self) -> Result<u64> {
        if let Some(raw) = self.replacement()?.as_ref() {
            return Ok(raw.len() as u64);
        }
        Ok(self.header.len() + self.body.len())
    }

    /// Value of a header field, unfolded.
    ///
    /// Served from the mailbox's header cache when the field is cached.
    pub fn header_value(&self, name: &str) -> Result<Option<String>> {
        if self.replacement()?.is_none() {
            let mailbox = self.mailbox()?;
            if let Some(cached) = mailbox.cached_header(self.uid, name)? {
                return Ok(cached);
            }
        }
        Ok(header::find_field(&self.headers()?, name))
    }

    /// Envelope sender and date, parsed from the separator line on first use.
    pub fn envelope(&self) -> Result<Envelope> {
        let mut slot = self.envelope.lock().map_err(|_| poisoned())?;
        if let Some(env) = slot.as_ref() {
            return Ok(env.clone());
        }
        let env = Envelope::from_separator(&self.read_range(&self.separator)?);
        *slot = Some(env.clone());
        Ok(env)
    }

    /// Replace the envelope. Written out at the next expunge or sync.
    pub fn set_envelope(&self, envelope: Envelope) -> Result<()> {
        self.check()?;
        *self.envelope.lock().map_err(|_| poisoned())? = Some(envelope);
        self.envelope_changed.store(true, Ordering::Release);
        Ok(())
    }

    /// Current attribute flags.
    pub fn flags(&self) -> Result<Flags> {
        self.mailbox()?.record_flags(self.uid)
    }

    pub fn set_flags(&self, bits: Flags) -> Result<Flags> {
        self.mailbox()?.update_flags(self.uid, |f| f.mark(bits))
    }

    pub fn unset_flags(&self, bits: Flags) -> Result<Flags> {
        self.mailbox()?.update_flags(self.uid, |f| f.unmark(bits))
    }

    /// Replace the whole message (headers, blank line, body).
    ///
    /// Nothing is written until the next expunge or sync rewrites the record.
    pub fn replace_content(&self, raw: impl Into<Vec<u8>>) -> Result<()> {
        self.check()?;
        *self.replacement()? = Some(raw.into());
        Ok(())
    }

    /// Whether the envelope or content changed since the message was read.
    pub fn has_unsaved_changes(&self) -> bool {
        self.envelope_changed.load(Ordering::Acquire)
            || self.replacement.lock().map(|r| r.is_some()).unwrap_or(false)
    }

    pub(crate) fn changed_envelope(&self) -> Option<Envelope> {
        if !self.envelope_changed.load(Ordering::Acquire) {
            return None;
        }
        self.envelope.lock().ok().and_then(|e| e.clone())
    }

    pub(crate) fn replaced_content(&self) -> Option<Vec<u8>> {
        self.replacement.lock().ok().and_then(|r| r.clone())
    }

    pub(crate) fn invalidate(&self) {
        self.live.store(false, Ordering::Release);
    }
}
