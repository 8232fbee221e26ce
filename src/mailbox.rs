//! The mailbox handle.
//!
//! [`Mailbox`] ties the pieces together: a byte stream over the file, the
//! advisory locker, the message index and the UID counters. Process-local
//! state sits behind one read/write monitor; other processes are kept in
//! step by the advisory lock and by rescanning whenever the file's size or
//! modification time moved.
//!
//! Lock order is always monitor first, then the advisory lock.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::SystemTime;

use tracing::{debug, info, warn};

use crate::compactor::Compactor;
use crate::config::Config;
use crate::error::{MboxError, Phase, Result};
use crate::index::MessageIndex;
use crate::locker::{FileLocker, LockGuard, LockMode, Locker, NullLocker};
use crate::model::attribute::Flags;
use crate::model::envelope::Envelope;
use crate::model::record::{MessageRecord, RecordSpan};
use crate::parser::header::HeaderCache;
use crate::scanner::{ScanOutcome, Scanner};
use crate::stream::{ByteStream, FileStream, MemStream};
use crate::uid::UidState;
use crate::view::MessageView;
use crate::writer::{self, NewMessage};

/// Notifications emitted by a mailbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MailboxEvent {
    /// A message not seen before was indexed (1-based number).
    MessageAdded { msgno: usize },
    /// Scan progress.
    Progress { percent: u8 },
    /// The file changed in a way that cannot be reconciled.
    Corrupt { reason: String },
    /// A message was removed by an expunge.
    ///
    /// `position` is its number before the expunge and `removed_so_far` the
    /// number of messages removed ahead of it, so its number at the time of
    /// the event is `position - removed_so_far`.
    MessageExpunged {
        position: usize,
        removed_so_far: usize,
    },
    /// A message was appended at `offset`.
    MessageAppended { offset: u64 },
}

/// Receives mailbox events.
///
/// `Progress` and `Corrupt` are delivered while a scan holds the mailbox
/// monitor, so observers must not call back into the mailbox for those.
pub trait Observer: Send + Sync {
    fn notify(&self, event: &MailboxEvent);
}

impl<F> Observer for F
where
    F: Fn(&MailboxEvent) + Send + Sync,
{
    fn notify(&self, event: &MailboxEvent) {
        self(event)
    }
}

/// Index and bookkeeping guarded by the monitor.
#[derive(Debug)]
pub(crate) struct MailboxState {
    pub index: MessageIndex,
    /// File size as of the last scan.
    pub size: u64,
    pub mtime: Option<SystemTime>,
    pub uids: UidState,
    /// `(uidvalidity, uidnext)` as found in the file.
    pub persisted_base: Option<(u64, u64)>,
    pub header_cache: HeaderCache,
    pub scanned: bool,
    /// A commit failed part way; writes wait for a rescan from the first message.
    pub needs_rescan: bool,
}

impl MailboxState {
    pub fn new(config: &Config) -> Self {
        Self {
            index: MessageIndex::new(),
            size: 0,
            mtime: None,
            uids: UidState::default(),
            persisted_base: None,
            header_cache: HeaderCache::new(
                &config.scan.header_cache,
                config.scan.header_cache_size,
            ),
            scanned: false,
            needs_rescan: false,
        }
    }
}

pub(crate) struct Inner {
    path: PathBuf,
    stream: Arc<dyn ByteStream>,
    locker: Box<dyn Locker>,
    config: Config,
    state: RwLock<MailboxState>,
    observers: RwLock<Vec<Arc<dyn Observer>>>,
    open: AtomicBool,
}

fn monitor_poisoned() -> MboxError {
    MboxError::InvalidHandle("mailbox monitor poisoned".into())
}

impl Inner {
    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    fn read_state(&self) -> Result<RwLockReadGuard<'_, MailboxState>> {
        self.state.read().map_err(|_| monitor_poisoned())
    }

    fn write_state(&self) -> Result<RwLockWriteGuard<'_, MailboxState>> {
        self.state.write().map_err(|_| monitor_poisoned())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.open.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(MboxError::InvalidHandle(format!(
                "mailbox {} is closed",
                self.path.display()
            )))
        }
    }

    fn emit(&self, event: &MailboxEvent) {
        if let Ok(observers) = self.observers.read() {
            for observer in observers.iter() {
                observer.notify(event);
            }
        }
    }

    /// Whether the file still has the size and mtime seen by the last scan.
    fn matches_file(&self, state: &MailboxState) -> Result<bool> {
        if !state.scanned {
            return Ok(false);
        }
        let size = self
            .stream
            .size()
            .map_err(|e| MboxError::io(Phase::Stat, 0, &self.path, e))?;
        let mtime = self
            .stream
            .modified()
            .map_err(|e| MboxError::io(Phase::Stat, 0, &self.path, e))?;
        Ok(size == state.size && mtime == state.mtime)
    }

    fn run_scan(
        &self,
        state: &mut MailboxState,
        guard: &LockGuard<'_>,
        from_msgno: usize,
    ) -> Result<ScanOutcome> {
        let emit = |event: MailboxEvent| self.emit(&event);
        let scanner = Scanner {
            stream: &self.stream,
            path: &self.path,
            config: &self.config.scan,
            guard,
            emit: &emit,
        };
        scanner.scan(state, from_msgno)
    }

    fn ensure_writable(&self, state: &MailboxState) -> Result<()> {
        if state.needs_rescan {
            Err(MboxError::NeedsRescan {
                path: self.path.clone(),
            })
        } else {
            Ok(())
        }
    }

    /// Rescan from the last known message if the file moved.
    fn refresh_locked(
        &self,
        state: &mut MailboxState,
        guard: &LockGuard<'_>,
    ) -> Result<Vec<MailboxEvent>> {
        if self.matches_file(state)? {
            return Ok(Vec::new());
        }
        let from = state.index.len();
        let outcome = self.run_scan(state, guard, from)?;
        Ok(outcome
            .added
            .map(|msgno| MailboxEvent::MessageAdded { msgno })
            .collect())
    }

    pub(crate) fn position_of(&self, uid: u64) -> Result<usize> {
        self.read_state()?
            .index
            .position_by_uid(uid)
            .ok_or_else(|| MboxError::InvalidHandle(format!("no message with uid {uid}")))
    }

    pub(crate) fn cached_header(&self, uid: u64, name: &str) -> Result<Option<Option<String>>> {
        Ok(self
            .read_state()?
            .header_cache
            .peek(uid, name)
            .map(|v| v.map(str::to_string)))
    }

    pub(crate) fn record_flags(&self, uid: u64) -> Result<Flags> {
        let state = self.read_state()?;
        let pos = state
            .index
            .position_by_uid(uid)
            .ok_or_else(|| MboxError::InvalidHandle(format!("no message with uid {uid}")))?;
        Ok(state.index.as_slice()[pos].flags)
    }

    pub(crate) fn update_flags(&self, uid: u64, change: impl FnOnce(&mut Flags)) -> Result<Flags> {
        let mut state = self.write_state()?;
        let pos = state
            .index
            .position_by_uid(uid)
            .ok_or_else(|| MboxError::InvalidHandle(format!("no message with uid {uid}")))?;
        let record = state
            .index
            .get_mut(pos)
            .ok_or(MboxError::NotFound(pos + 1))?;
        change(&mut record.flags);
        Ok(record.flags)
    }
}

/// An open mbox mailbox.
pub struct Mailbox {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mailbox")
            .field("path", &self.inner.path)
            .field("open", &self.inner.open.load(Ordering::Relaxed))
            .finish()
    }
}

impl Mailbox {
    /// Open an existing mbox file. Nothing is read until the first query.
    pub fn open(path: impl AsRef<Path>, config: Config) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let stream = match FileStream::open(&path) {
            Ok(stream) => stream,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(MboxError::FileNotFound(path));
            }
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                warn!(path = %path.display(), "No write access, opening read-only");
                FileStream::open_read_only(&path)
                    .map_err(|e| MboxError::io(Phase::Open, 0, &path, e))?
            }
            Err(e) => return Err(MboxError::io(Phase::Open, 0, &path, e)),
        };
        let locker = FileLocker::for_mailbox(&path, &config.lock);
        Self::from_parts(path, Arc::new(stream), Box::new(locker), config)
    }

    /// Open an mbox file, creating it empty if it does not exist.
    pub fn create(path: impl AsRef<Path>, config: Config) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let stream =
            FileStream::create(&path).map_err(|e| MboxError::io(Phase::Open, 0, &path, e))?;
        let locker = FileLocker::for_mailbox(&path, &config.lock);
        Self::from_parts(path, Arc::new(stream), Box::new(locker), config)
    }

    /// A scratch mailbox held in memory.
    pub fn in_memory(data: impl Into<Vec<u8>>, config: Config) -> Result<Self> {
        Self::from_parts(
            PathBuf::from("<memory>"),
            Arc::new(MemStream::new(data)),
            Box::new(NullLocker::default()),
            config,
        )
    }

    /// Assemble a mailbox from its collaborators.
    pub fn from_parts(
        path: PathBuf,
        stream: Arc<dyn ByteStream>,
        locker: Box<dyn Locker>,
        config: Config,
    ) -> Result<Self> {
        config.validate()?;
        debug!(path = %path.display(), "Opening mailbox");
        let state = MailboxState::new(&config);
        Ok(Self {
            inner: Arc::new(Inner {
                path,
                stream,
                locker,
                config,
                state: RwLock::new(state),
                observers: RwLock::new(Vec::new()),
                open: AtomicBool::new(true),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn subscribe(&self, observer: Arc<dyn Observer>) {
        if let Ok(mut observers) = self.inner.observers.write() {
            observers.push(observer);
        }
    }

    fn emit_all(&self, events: Vec<MailboxEvent>) {
        for event in &events {
            self.inner.emit(event);
        }
    }

    /// Drop the index and invalidate every message view.
    pub fn close(&self) -> Result<()> {
        self.inner.open.store(false, Ordering::Release);
        let mut state = self.inner.write_state()?;
        for record in state.index.clear() {
            record.detach_view();
        }
        state.header_cache.clear();
        state.scanned = false;
        state.size = 0;
        state.mtime = None;
        debug!(path = %self.inner.path.display(), "Mailbox closed");
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::Acquire)
    }

    /// Whether the file is unchanged since the last scan.
    pub fn is_updated(&self) -> Result<bool> {
        self.inner.ensure_open()?;
        let state = self.inner.read_state()?;
        self.inner.matches_file(&state)
    }

    /// Rescan the file from message `from_msgno` (1-based; 0 rescans everything).
    ///
    /// Returns the number of messages. A full rescan also lifts the write
    /// block left by a failed expunge.
    pub fn scan(&self, from_msgno: usize, notify: bool) -> Result<usize> {
        self.inner.ensure_open()?;
        let outcome = {
            let mut state = self.inner.write_state()?;
            let guard = LockGuard::acquire(self.inner.locker.as_ref(), LockMode::Shared)?;
            let outcome = self.inner.run_scan(&mut state, &guard, from_msgno)?;
            if from_msgno <= 1 && state.needs_rescan {
                info!(path = %self.inner.path.display(), "Mailbox rescanned, writes allowed again");
                state.needs_rescan = false;
            }
            outcome
        };
        if notify {
            self.emit_all(
                outcome
                    .added
                    .map(|msgno| MailboxEvent::MessageAdded { msgno })
                    .collect(),
            );
        }
        Ok(outcome.count)
    }

    /// Bring the index up to date with the file, scanning only if it moved.
    fn refresh(&self) -> Result<()> {
        self.inner.ensure_open()?;
        if self.is_updated()? {
            return Ok(());
        }
        let events = {
            let mut state = self.inner.write_state()?;
            let guard = LockGuard::acquire(self.inner.locker.as_ref(), LockMode::Shared)?;
            self.inner.refresh_locked(&mut state, &guard)?
        };
        self.emit_all(events);
        Ok(())
    }

    fn with_record<T>(&self, msgno: usize, f: impl FnOnce(&MessageRecord) -> T) -> Result<T> {
        self.refresh()?;
        let state = self.inner.read_state()?;
        msgno
            .checked_sub(1)
            .and_then(|i| state.index.get(i))
            .map(f)
            .ok_or(MboxError::NotFound(msgno))
    }

    pub fn messages_count(&self) -> Result<usize> {
        self.refresh()?;
        Ok(self.inner.read_state()?.index.len())
    }

    fn attach_view(&self, record: &MessageRecord) -> Result<Arc<MessageView>> {
        let mut slot = record.view.lock().map_err(|_| monitor_poisoned())?;
        if let Some(view) = slot.upgrade().filter(|v| v.is_valid()) {
            return Ok(view);
        }
        let view = Arc::new(MessageView::attach(
            record,
            &self.inner.stream,
            Arc::downgrade(&self.inner),
        ));
        *slot = Arc::downgrade(&view);
        Ok(view)
    }

    /// The view of message `msgno` (1-based). Repeated calls return the same view.
    pub fn get_message(&self, msgno: usize) -> Result<Arc<MessageView>> {
        self.with_record(msgno, |record| self.attach_view(record))?
    }

    /// Identifier of message `msgno` that survives reopening the mailbox:
    /// the offset of its separator line.
    pub fn message_qid(&self, msgno: usize) -> Result<u64> {
        self.with_record(msgno, |r| r.separator_start)
    }

    /// The view of the message starting at `qid`, without checking whether
    /// the file moved. Only an index that was never built is built first.
    pub fn quick_get_message(&self, qid: u64) -> Result<Arc<MessageView>> {
        self.inner.ensure_open()?;
        if !self.inner.read_state()?.scanned {
            self.refresh()?;
        }
        let state = self.inner.read_state()?;
        let pos = state.index.position_by_offset(qid).ok_or_else(|| {
            MboxError::InvalidHandle(format!("no message starts at offset {qid}"))
        })?;
        self.attach_view(&state.index.as_slice()[pos])
    }

    pub fn uid(&self, msgno: usize) -> Result<u64> {
        self.with_record(msgno, |r| r.uid)
    }

    pub fn flags(&self, msgno: usize) -> Result<Flags> {
        self.with_record(msgno, |r| r.flags)
    }

    fn change_flags(&self, msgno: usize, change: impl FnOnce(&mut Flags)) -> Result<Flags> {
        self.refresh()?;
        let mut state = self.inner.write_state()?;
        let record = msgno
            .checked_sub(1)
            .and_then(|i| state.index.get_mut(i))
            .ok_or(MboxError::NotFound(msgno))?;
        change(&mut record.flags);
        Ok(record.flags)
    }

    /// Set attribute bits. Persisted by the next expunge or sync.
    pub fn set_flags(&self, msgno: usize, bits: Flags) -> Result<Flags> {
        self.change_flags(msgno, |f| f.mark(bits))
    }

    pub fn unset_flags(&self, msgno: usize, bits: Flags) -> Result<Flags> {
        self.change_flags(msgno, |f| f.unmark(bits))
    }

    pub fn uidvalidity(&self) -> Result<u64> {
        self.refresh()?;
        Ok(self.inner.read_state()?.uids.uidvalidity)
    }

    pub fn uidnext(&self) -> Result<u64> {
        self.refresh()?;
        Ok(self.inner.read_state()?.uids.uidnext)
    }

    /// Number of messages not yet seen.
    pub fn messages_recent(&self) -> Result<usize> {
        self.refresh()?;
        let state = self.inner.read_state()?;
        Ok(state.index.iter().filter(|r| r.flags.is_recent()).count())
    }

    /// Number of the first unseen message, or 0 if all were seen.
    pub fn message_unseen(&self) -> Result<usize> {
        self.refresh()?;
        let state = self.inner.read_state()?;
        Ok(state
            .index
            .iter()
            .position(|r| r.flags.is_recent())
            .map_or(0, |pos| pos + 1))
    }

    /// File size as of the last scan.
    pub fn size(&self) -> Result<u64> {
        self.refresh()?;
        Ok(self.inner.read_state()?.size)
    }

    /// Snapshot of every record.
    pub fn records(&self) -> Result<Vec<RecordSpan>> {
        self.refresh()?;
        Ok(self.inner.read_state()?.index.iter().map(|r| r.span()).collect())
    }

    /// Remove deleted messages and write out every pending change.
    pub fn expunge(&self) -> Result<()> {
        self.compact(true)
    }

    /// Write out pending changes, keeping deleted messages.
    pub fn sync(&self) -> Result<()> {
        self.compact(false)
    }

    fn compact(&self, remove_deleted: bool) -> Result<()> {
        self.inner.ensure_open()?;
        let inner = &self.inner;
        let events = {
            let mut state = inner.write_state()?;
            inner.ensure_writable(&state)?;
            let guard = LockGuard::acquire(inner.locker.as_ref(), LockMode::Exclusive)?;
            let mut events = inner.refresh_locked(&mut state, &guard)?;

            let emit = |event: MailboxEvent| inner.emit(&event);
            let compactor = Compactor {
                stream: &inner.stream,
                path: &inner.path,
                config: &inner.config.expunge,
                buffer_size: inner.config.scan.read_buffer_size,
                touch_every: inner.config.scan.touch_every_messages,
                guard: &guard,
                emit: &emit,
            };
            let outcome = compactor.compact(&mut state, remove_deleted)?;
            if let Some(dirty) = outcome.dirty_from {
                if let Err(e) = inner.run_scan(&mut state, &guard, dirty) {
                    warn!(error = %e, "Rescan after expunge failed, will retry on next access");
                    state.scanned = false;
                }
            }
            events.extend(outcome.expunged);
            events
        };
        self.emit_all(events);
        Ok(())
    }

    /// Append a message at the end of the file. Returns its number.
    ///
    /// `raw` holds headers, a blank line and the body; a leading separator
    /// line is used as the envelope when `envelope` is `None`.
    pub fn append(&self, raw: &[u8], envelope: Option<&Envelope>, flags: Flags) -> Result<usize> {
        self.inner.ensure_open()?;
        let inner = &self.inner;
        let (msgno, events) = {
            let mut state = inner.write_state()?;
            inner.ensure_writable(&state)?;
            let guard = LockGuard::acquire(inner.locker.as_ref(), LockMode::Exclusive)?;
            let mut events = inner.refresh_locked(&mut state, &guard)?;

            let first_message = state.index.is_empty();
            let size = state.size;
            let offset = writer::append_message(
                &inner.stream,
                &inner.path,
                size,
                &mut state.uids,
                first_message,
                NewMessage {
                    raw,
                    envelope,
                    flags,
                },
            )?;
            events.push(MailboxEvent::MessageAppended { offset });

            let from = state.index.len();
            let outcome = inner.run_scan(&mut state, &guard, from)?;
            events.extend(
                outcome
                    .added
                    .map(|msgno| MailboxEvent::MessageAdded { msgno }),
            );
            (outcome.count, events)
        };
        info!(path = %inner.path.display(), msgno, "Message appended");
        self.emit_all(events);
        Ok(msgno)
    }

    /// Delete the mailbox file and its lock file, then close the handle.
    pub fn remove(&self) -> Result<()> {
        self.inner.ensure_open()?;
        let inner = &self.inner;
        {
            let _state = inner.write_state()?;
            let _guard = LockGuard::acquire(inner.locker.as_ref(), LockMode::Exclusive)?;
            inner
                .stream
                .remove()
                .map_err(|e| MboxError::io(Phase::Remove, 0, &inner.path, e))?;
        }
        inner.locker.remove()?;
        self.close()?;
        info!(path = %inner.path.display(), "Mailbox removed");
        Ok(())
    }
}

/// The operations every mailbox format provides.
pub trait MailboxBackend: Send + Sync {
    /// URL scheme of the format.
    fn scheme(&self) -> &'static str;
    fn path(&self) -> &Path;
    fn close(&self) -> Result<()>;
    fn scan(&self, from_msgno: usize, notify: bool) -> Result<usize>;
    fn messages_count(&self) -> Result<usize>;
    fn get_message(&self, msgno: usize) -> Result<Arc<MessageView>>;
    /// Offset-based identifier of a message, valid across reopen.
    fn message_qid(&self, msgno: usize) -> Result<u64>;
    fn quick_get_message(&self, qid: u64) -> Result<Arc<MessageView>>;
    fn append(&self, raw: &[u8], envelope: Option<&Envelope>, flags: Flags) -> Result<usize>;
    fn expunge(&self) -> Result<()>;
    fn sync(&self) -> Result<()>;
    fn uidvalidity(&self) -> Result<u64>;
    fn uidnext(&self) -> Result<u64>;
    fn messages_recent(&self) -> Result<usize>;
    fn message_unseen(&self) -> Result<usize>;
    fn subscribe(&self, observer: Arc<dyn Observer>);
    /// Delete the mailbox from storage.
    fn remove(&self) -> Result<()>;
}

impl MailboxBackend for Mailbox {
    fn scheme(&self) -> &'static str {
        MBOX_SCHEME
    }

    fn path(&self) -> &Path {
        Mailbox::path(self)
    }

    fn close(&self) -> Result<()> {
        Mailbox::close(self)
    }

    fn scan(&self, from_msgno: usize, notify: bool) -> Result<usize> {
        Mailbox::scan(self, from_msgno, notify)
    }

    fn messages_count(&self) -> Result<usize> {
        Mailbox::messages_count(self)
    }

    fn get_message(&self, msgno: usize) -> Result<Arc<MessageView>> {
        Mailbox::get_message(self, msgno)
    }

    fn message_qid(&self, msgno: usize) -> Result<u64> {
        Mailbox::message_qid(self, msgno)
    }

    fn quick_get_message(&self, qid: u64) -> Result<Arc<MessageView>> {
        Mailbox::quick_get_message(self, qid)
    }

    fn append(&self, raw: &[u8], envelope: Option<&Envelope>, flags: Flags) -> Result<usize> {
        Mailbox::append(self, raw, envelope, flags)
    }

    fn expunge(&self) -> Result<()> {
        Mailbox::expunge(self)
    }

    fn sync(&self) -> Result<()> {
        Mailbox::sync(self)
    }

    fn uidvalidity(&self) -> Result<u64> {
        Mailbox::uidvalidity(self)
    }

    fn uidnext(&self) -> Result<u64> {
        Mailbox::uidnext(self)
    }

    fn messages_recent(&self) -> Result<usize> {
        Mailbox::messages_recent(self)
    }

    fn message_unseen(&self) -> Result<usize> {
        Mailbox::message_unseen(self)
    }

    fn subscribe(&self, observer: Arc<dyn Observer>) {
        Mailbox::subscribe(self, observer)
    }

    fn remove(&self) -> Result<()> {
        Mailbox::remove(self)
    }
}

pub const MBOX_SCHEME: &str = "mbox";

/// Opens a mailbox of one format.
pub type OpenFn = fn(&Path, &Config) -> Result<Box<dyn MailboxBackend>>;

fn open_mbox(path: &Path, config: &Config) -> Result<Box<dyn MailboxBackend>> {
    Ok(Box::new(Mailbox::open(path, config.clone())?))
}

/// The set of mailbox formats known to a program.
///
/// Built once at startup and passed to whatever opens mailboxes.
#[derive(Default)]
pub struct FormatRegistry {
    formats: BTreeMap<String, OpenFn>,
}

impl FormatRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry knowing the formats built into this crate.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.formats.insert(MBOX_SCHEME.to_string(), open_mbox);
        registry
    }

    pub fn register(&mut self, scheme: &str, open: OpenFn) -> Result<()> {
        let key = scheme.to_ascii_lowercase();
        if self.formats.contains_key(&key) {
            return Err(MboxError::AlreadyExists(format!("format '{key}'")));
        }
        self.formats.insert(key, open);
        Ok(())
    }

    pub fn schemes(&self) -> impl Iterator<Item = &str> {
        self.formats.keys().map(String::as_str)
    }

    /// Open `url`, either `scheme:path`, `scheme://path` or a bare path (mbox).
    pub fn open(&self, url: &str, config: &Config) -> Result<Box<dyn MailboxBackend>> {
        let (scheme, path) = split_url(url);
        let scheme = scheme.unwrap_or(MBOX_SCHEME).to_ascii_lowercase();
        let open = self
            .formats
            .get(&scheme)
            .ok_or_else(|| MboxError::UnknownFormat(scheme.clone()))?;
        open(Path::new(path), config)
    }
}

fn split_url(url: &str) -> (Option<&str>, &str) {
    match url.split_once(':') {
        // One-letter schemes are drive letters.
        Some((scheme, rest))
            if scheme.len() > 1
                && scheme.starts_with(|c: char| c.is_ascii_alphabetic())
                && scheme
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.')) =>
        {
            (Some(scheme), rest.strip_prefix("//").unwrap_or(rest))
        }
        _ => (None, url),
    }
}
