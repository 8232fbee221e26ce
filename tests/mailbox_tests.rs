//! Integration tests for scanning, expunge, sync, append and locking.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use assert_fs::prelude::*;
use assert_fs::TempDir;
use predicates::prelude::*;

use mboxstore::config::{Config, ExpungeConfig, LockConfig};
use mboxstore::locker::{FileLocker, LockMode, Locker, NullLocker};
use mboxstore::stream::{ByteStream, MemStream};
use mboxstore::{Flags, FormatRegistry, Mailbox, MailboxEvent, MboxError};

fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

/// A scratch copy of the three-message fixture.
fn inbox(temp: &TempDir) -> assert_fs::fixture::ChildPath {
    let inbox = temp.child("inbox");
    inbox.write_file(&fixture("three.mbox")).unwrap();
    inbox
}

fn quick_locks() -> Config {
    Config {
        lock: LockConfig {
            retries: 0,
            retry_interval_ms: 1,
            ..LockConfig::default()
        },
        ..Config::default()
    }
}

fn recorder(mbox: &Mailbox) -> Arc<Mutex<Vec<MailboxEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    mbox.subscribe(Arc::new(move |e: &MailboxEvent| {
        sink.lock().unwrap().push(e.clone())
    }));
    events
}

type Hook = Box<dyn FnOnce(&MemStream) + Send>;

/// In-memory mailbox storage that can misbehave on demand.
struct FaultyStream {
    inner: MemStream,
    /// Writes stop five bytes short and then fail.
    fail_writes: AtomicBool,
    /// Run once after the next read, standing in for another process.
    after_read: Mutex<Option<Hook>>,
}

impl FaultyStream {
    fn new(data: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            inner: MemStream::new(data),
            fail_writes: AtomicBool::new(false),
            after_read: Mutex::new(None),
        })
    }

    fn on_next_read(&self, hook: impl FnOnce(&MemStream) + Send + 'static) {
        *self.after_read.lock().unwrap() = Some(Box::new(hook));
    }

    fn contents(&self) -> Vec<u8> {
        self.inner.contents()
    }
}

impl ByteStream for FaultyStream {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let n = self.inner.read_at(buf, offset)?;
        let hook = self.after_read.lock().unwrap().take();
        if let Some(hook) = hook {
            hook(&self.inner);
        }
        Ok(n)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            let partial = buf.len().saturating_sub(5);
            self.inner.write_at(&buf[..partial], offset)?;
            return Err(io::Error::other("disk full"));
        }
        self.inner.write_at(buf, offset)
    }

    fn size(&self) -> io::Result<u64> {
        self.inner.size()
    }

    fn truncate(&self, len: u64) -> io::Result<()> {
        self.inner.truncate(len)
    }

    fn flush(&self) -> io::Result<()> {
        self.inner.flush()
    }

    fn modified(&self) -> io::Result<Option<SystemTime>> {
        self.inner.modified()
    }

    fn path(&self) -> &Path {
        self.inner.path()
    }
}

/// The fixture on a [`FaultyStream`], spilling into `temp`.
fn faulty_inbox(temp: &TempDir) -> (Arc<FaultyStream>, Mailbox) {
    let stream = FaultyStream::new(std::fs::read(fixture("three.mbox")).unwrap());
    let config = Config {
        expunge: ExpungeConfig {
            temp_dir: Some(temp.path().to_path_buf()),
            keep_backup_on_failure: true,
        },
        ..Config::default()
    };
    let mbox = Mailbox::from_parts(
        temp.path().join("inbox"),
        stream.clone(),
        Box::new(NullLocker::default()),
        config,
    )
    .unwrap();
    assert_eq!(mbox.messages_count().unwrap(), 3);
    (stream, mbox)
}

// ─── Scanning ───────────────────────────────────────────────────────

#[test]
fn test_records_tile_the_file() {
    let temp = TempDir::new().unwrap();
    let inbox = inbox(&temp);
    let mbox = Mailbox::open(inbox.path(), Config::default()).unwrap();

    let records = mbox.records().unwrap();
    assert_eq!(records.len(), 3);
    assert_eq!(records[0].separator_start, 0);
    for pair in records.windows(2) {
        assert_eq!(pair[0].body_end, pair[1].separator_start);
    }
    let len = std::fs::metadata(inbox.path()).unwrap().len();
    assert_eq!(records[2].body_end, len);
    assert_eq!(
        records.iter().map(|r| r.uid).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
}

#[test]
fn test_reads_generation_and_flags() {
    let temp = TempDir::new().unwrap();
    let inbox = inbox(&temp);
    let mbox = Mailbox::open(inbox.path(), Config::default()).unwrap();

    assert_eq!(mbox.uidvalidity().unwrap(), 1_700_000_000);
    assert_eq!(mbox.uidnext().unwrap(), 4);
    assert_eq!(mbox.flags(1).unwrap(), Flags::SEEN | Flags::READ);
    assert_eq!(mbox.messages_recent().unwrap(), 1);
    assert_eq!(mbox.message_unseen().unwrap(), 2);
}

#[test]
fn test_view_contents() {
    let temp = TempDir::new().unwrap();
    let inbox = inbox(&temp);
    let mbox = Mailbox::open(inbox.path(), Config::default()).unwrap();

    let second = mbox.get_message(2).unwrap();
    assert_eq!(second.header_value("Subject").unwrap().as_deref(), Some("second"));
    assert_eq!(
        second.header_value("message-id").unwrap().as_deref(),
        Some("<second@example.com>")
    );
    assert_eq!(second.header_value("X-Missing").unwrap(), None);
    assert_eq!(second.body().unwrap(), b"Body two.\n>From the archives.\n\n");
    assert_eq!(second.envelope().unwrap().sender, "bob@example.com");

    let third = mbox.get_message(3).unwrap();
    assert_eq!(third.body().unwrap(), b"Third body.\n");
    assert!(matches!(mbox.get_message(4), Err(MboxError::NotFound(4))));
}

#[test]
fn test_external_growth_is_picked_up() {
    let temp = TempDir::new().unwrap();
    let inbox = inbox(&temp);
    let mbox = Mailbox::open(inbox.path(), Config::default()).unwrap();
    let events = recorder(&mbox);
    assert_eq!(mbox.messages_count().unwrap(), 3);

    let mut file = std::fs::OpenOptions::new()
        .append(true)
        .open(inbox.path())
        .unwrap();
    std::io::Write::write_all(
        &mut file,
        b"\nFrom dave@example.com Mon Jan  1 13:00:00 2024\nSubject: fourth\n\nfour\n",
    )
    .unwrap();
    drop(file);

    assert_eq!(mbox.messages_count().unwrap(), 4);
    assert_eq!(mbox.uid(4).unwrap(), 4);
    assert_eq!(mbox.uidnext().unwrap(), 5);
    assert!(events
        .lock()
        .unwrap()
        .contains(&MailboxEvent::MessageAdded { msgno: 4 }));
}

#[test]
fn test_truncation_is_reported_as_corrupt() {
    let temp = TempDir::new().unwrap();
    let inbox = inbox(&temp);
    let mbox = Mailbox::open(inbox.path(), Config::default()).unwrap();
    let events = recorder(&mbox);
    assert_eq!(mbox.messages_count().unwrap(), 3);

    let len = std::fs::metadata(inbox.path()).unwrap().len();
    let file = std::fs::OpenOptions::new()
        .write(true)
        .open(inbox.path())
        .unwrap();
    file.set_len(len / 2).unwrap();
    drop(file);

    let err = mbox.messages_count().unwrap_err();
    assert!(err.is_corruption(), "unexpected error: {err}");
    assert!(events
        .lock()
        .unwrap()
        .iter()
        .any(|e| matches!(e, MailboxEvent::Corrupt { .. })));
}

// ─── Expunge and sync ───────────────────────────────────────────────

#[test]
fn test_expunge_removes_deleted_and_keeps_neighbours_verbatim() {
    let temp = TempDir::new().unwrap();
    let inbox = inbox(&temp);
    let original = std::fs::read(inbox.path()).unwrap();
    let mbox = Mailbox::open(inbox.path(), Config::default()).unwrap();
    let events = recorder(&mbox);

    let spans = mbox.records().unwrap();
    let mut expected = original[..spans[0].body_end as usize].to_vec();
    expected.extend_from_slice(&original[spans[2].separator_start as usize..]);

    mbox.set_flags(2, Flags::DELETED).unwrap();
    mbox.expunge().unwrap();

    assert_eq!(std::fs::read(inbox.path()).unwrap(), expected);
    assert_eq!(mbox.messages_count().unwrap(), 2);
    assert_eq!(mbox.uid(2).unwrap(), 3);
    let third = mbox.get_message(2).unwrap();
    assert_eq!(third.header_value("Subject").unwrap().as_deref(), Some("third"));
    assert!(events.lock().unwrap().contains(&MailboxEvent::MessageExpunged {
        position: 2,
        removed_so_far: 0,
    }));
}

#[test]
fn test_expunge_counts_earlier_removals() {
    let temp = TempDir::new().unwrap();
    let inbox = inbox(&temp);
    let mbox = Mailbox::open(inbox.path(), Config::default()).unwrap();
    let events = recorder(&mbox);

    mbox.set_flags(1, Flags::DELETED).unwrap();
    mbox.set_flags(3, Flags::DELETED).unwrap();
    mbox.expunge().unwrap();

    let expunged: Vec<_> = events
        .lock()
        .unwrap()
        .iter()
        .filter(|e| matches!(e, MailboxEvent::MessageExpunged { .. }))
        .cloned()
        .collect();
    assert_eq!(
        expunged,
        vec![
            MailboxEvent::MessageExpunged {
                position: 1,
                removed_so_far: 0
            },
            MailboxEvent::MessageExpunged {
                position: 3,
                removed_so_far: 1
            },
        ]
    );

    // The survivor now carries the generation line.
    assert_eq!(mbox.messages_count().unwrap(), 1);
    inbox.assert(predicate::str::starts_with("From bob@example.com"));
    inbox.assert(predicate::str::contains("X-IMAPbase: 1700000000 0000000004"));
    drop(mbox);

    let reopened = Mailbox::open(inbox.path(), Config::default()).unwrap();
    assert_eq!(reopened.uidvalidity().unwrap(), 1_700_000_000);
    assert_eq!(reopened.uid(1).unwrap(), 2);
}

#[test]
fn test_expunge_without_changes_leaves_file_untouched() {
    let temp = TempDir::new().unwrap();
    let inbox = inbox(&temp);
    let before = std::fs::metadata(inbox.path()).unwrap().modified().unwrap();
    let original = std::fs::read(inbox.path()).unwrap();

    let mbox = Mailbox::open(inbox.path(), Config::default()).unwrap();
    mbox.expunge().unwrap();
    mbox.sync().unwrap();

    let after = std::fs::metadata(inbox.path()).unwrap().modified().unwrap();
    assert_eq!(before, after);
    assert_eq!(std::fs::read(inbox.path()).unwrap(), original);
}

#[test]
fn test_sync_keeps_deleted_messages() {
    let temp = TempDir::new().unwrap();
    let inbox = inbox(&temp);
    let mbox = Mailbox::open(inbox.path(), Config::default()).unwrap();

    mbox.set_flags(2, Flags::DELETED | Flags::FLAGGED).unwrap();
    mbox.sync().unwrap();
    assert_eq!(mbox.messages_count().unwrap(), 3);
    inbox.assert(predicate::str::contains("Status: Fd\nX-UID: 2\n"));
    mbox.close().unwrap();

    let reopened = Mailbox::open(inbox.path(), Config::default()).unwrap();
    assert_eq!(reopened.messages_count().unwrap(), 3);
    assert_eq!(reopened.flags(2).unwrap(), Flags::DELETED | Flags::FLAGGED);
    assert_eq!(reopened.uid(3).unwrap(), 3);
}

#[test]
fn test_uids_assigned_and_stable_across_reopen() {
    let temp = TempDir::new().unwrap();
    let plain = temp.child("plain");
    plain
        .write_str(
            "From a@example.com Mon Jan  1 10:00:00 2024\nSubject: a\n\none\n\n\
             From b@example.com Mon Jan  1 11:00:00 2024\nSubject: b\n\ntwo\n",
        )
        .unwrap();

    let mbox = Mailbox::open(plain.path(), Config::default()).unwrap();
    let uidvalidity = mbox.uidvalidity().unwrap();
    assert!(uidvalidity > 0);
    assert_eq!(mbox.uid(1).unwrap(), 1);
    assert_eq!(mbox.uid(2).unwrap(), 2);
    // A second scan must not start a new generation.
    mbox.scan(0, false).unwrap();
    assert_eq!(mbox.uidvalidity().unwrap(), uidvalidity);

    mbox.sync().unwrap();
    drop(mbox);
    plain.assert(predicate::str::contains(format!(
        "X-IMAPbase: {uidvalidity} 0000000003"
    )));

    let reopened = Mailbox::open(plain.path(), Config::default()).unwrap();
    assert_eq!(reopened.uidvalidity().unwrap(), uidvalidity);
    assert_eq!(reopened.uidnext().unwrap(), 3);
    assert_eq!(reopened.uid(2).unwrap(), 2);
}

#[test]
fn test_replaced_content_written_on_sync() {
    let temp = TempDir::new().unwrap();
    let inbox = inbox(&temp);
    let mbox = Mailbox::open(inbox.path(), Config::default()).unwrap();

    let view = mbox.get_message(2).unwrap();
    view.replace_content(b"Subject: replaced\nContent-Length: 9\n\nnew body\nFrom here\n".to_vec())
        .unwrap();
    mbox.sync().unwrap();
    assert!(!view.is_valid());

    let fresh = mbox.get_message(2).unwrap();
    assert_eq!(fresh.uid(), 2);
    assert_eq!(fresh.header_value("Subject").unwrap().as_deref(), Some("replaced"));
    assert_eq!(fresh.header_value("Content-Length").unwrap(), None);
    assert_eq!(fresh.body().unwrap(), b"new body\n>From here\n\n");
    assert_eq!(
        mbox.get_message(3).unwrap().body().unwrap(),
        b"Third body.\n"
    );
}

#[test]
fn test_views_in_rewritten_suffix_are_invalidated() {
    let temp = TempDir::new().unwrap();
    let inbox = inbox(&temp);
    let mbox = Mailbox::open(inbox.path(), Config::default()).unwrap();

    let first = mbox.get_message(1).unwrap();
    let third = mbox.get_message(3).unwrap();
    mbox.set_flags(2, Flags::DELETED).unwrap();
    mbox.expunge().unwrap();

    assert!(first.is_valid());
    assert_eq!(first.body().unwrap(), b"Hello from Alice.\n\n");
    assert!(!third.is_valid());
    assert!(matches!(third.body(), Err(MboxError::InvalidHandle(_))));
    assert_eq!(mbox.get_message(2).unwrap().body().unwrap(), b"Third body.\n");
}

#[test]
fn test_replaced_content_with_separator_stays_one_message() {
    let temp = TempDir::new().unwrap();
    let inbox = inbox(&temp);
    let mbox = Mailbox::open(inbox.path(), Config::default()).unwrap();

    let view = mbox.get_message(2).unwrap();
    view.replace_content(
        b"From z@example.com Fri Jan  5 09:00:00 2024\nSubject: new\n\nnew body\n".to_vec(),
    )
    .unwrap();
    mbox.sync().unwrap();
    assert!(!view.is_valid());

    assert_eq!(mbox.messages_count().unwrap(), 3);
    let second = mbox.get_message(2).unwrap();
    assert_eq!(second.envelope().unwrap().sender, "z@example.com");
    assert_eq!(second.header_value("Subject").unwrap().as_deref(), Some("new"));
    assert_eq!(second.uid(), 2);
    inbox.assert(predicate::str::contains("From bob@example.com").not());
}

#[test]
fn test_separator_inside_replaced_headers_is_quoted() {
    let temp = TempDir::new().unwrap();
    let inbox = inbox(&temp);
    let mbox = Mailbox::open(inbox.path(), Config::default()).unwrap();

    let view = mbox.get_message(1).unwrap();
    view.replace_content(
        b"Subject: odd\nFrom y@example.com Sat Jan  6 09:00:00 2024\n\nbody\n".to_vec(),
    )
    .unwrap();
    mbox.sync().unwrap();

    assert_eq!(mbox.messages_count().unwrap(), 3);
    assert_eq!(mbox.get_message(1).unwrap().envelope().unwrap().sender, "alice@example.com");
    inbox.assert(predicate::str::contains(
        "\n>From y@example.com Sat Jan  6 09:00:00 2024\n",
    ));
}

// ─── Expunge failures ───────────────────────────────────────────────

#[test]
fn test_expunge_keeps_mail_that_arrives_meanwhile() {
    let temp = TempDir::new().unwrap();
    let (stream, mbox) = faulty_inbox(&temp);

    mbox.set_flags(1, Flags::DELETED).unwrap();
    stream.on_next_read(|inner| {
        inner.append(b"\nFrom dave@example.com Sat Jan  6 08:00:00 2024\nSubject: late\n\nLate body.\n");
    });
    mbox.expunge().unwrap();

    assert_eq!(mbox.messages_count().unwrap(), 3);
    let senders: Vec<String> = (1..=3)
        .map(|n| mbox.get_message(n).unwrap().envelope().unwrap().sender)
        .collect();
    assert_eq!(senders, ["bob@example.com", "carol@example.com", "dave@example.com"]);
    assert_eq!(mbox.get_message(3).unwrap().body().unwrap(), b"Late body.\n");
    assert!(stream.contents().starts_with(b"From bob@example.com"));
}

#[test]
fn test_shrink_during_expunge_aborts_without_writing() {
    let temp = TempDir::new().unwrap();
    let (stream, mbox) = faulty_inbox(&temp);
    let events = recorder(&mbox);

    // Bob goes, so only Carol is read; the file loses a byte right after.
    mbox.set_flags(2, Flags::DELETED).unwrap();
    stream.on_next_read(|inner| {
        let len = inner.size().unwrap();
        inner.truncate(len - 1).unwrap();
    });
    let expected = {
        let mut bytes = stream.contents();
        bytes.pop();
        bytes
    };

    let err = mbox.expunge().unwrap_err();
    assert!(matches!(err, MboxError::Corrupt { .. }), "got {err}");
    assert_eq!(stream.contents(), expected);
    let events = events.lock().unwrap();
    assert!(events.iter().any(|e| matches!(e, MailboxEvent::Corrupt { .. })));
    assert!(!events
        .iter()
        .any(|e| matches!(e, MailboxEvent::MessageExpunged { .. })));
}

#[test]
fn test_failed_commit_keeps_backup_and_blocks_writes() {
    let temp = TempDir::new().unwrap();
    let (stream, mbox) = faulty_inbox(&temp);
    let events = recorder(&mbox);

    let carol = mbox.get_message(3).unwrap();
    mbox.set_flags(1, Flags::DELETED).unwrap();
    stream.fail_writes.store(true, Ordering::SeqCst);

    let err = mbox.expunge().unwrap_err();
    assert!(!err.is_retryable());
    let backup = match &err {
        MboxError::CorruptionRisk {
            backup: Some(backup),
            ..
        } => backup.clone(),
        other => panic!("expected a kept backup, got {other}"),
    };
    assert!(backup.starts_with(temp.path()));
    let spilled = std::fs::read_to_string(&backup).unwrap();
    assert!(spilled.starts_with("From bob@example.com"));
    assert!(spilled.contains("X-IMAPbase: 1700000000 0000000004\n"));
    assert!(spilled.ends_with("Third body.\n"));
    assert!(!carol.is_valid());
    assert!(!events
        .lock()
        .unwrap()
        .iter()
        .any(|e| matches!(e, MailboxEvent::MessageExpunged { .. })));

    // The index no longer describes the file, so retrying must not write.
    stream.fail_writes.store(false, Ordering::SeqCst);
    assert!(!mbox.is_updated().unwrap());
    let damaged = stream.contents();
    let retry = mbox.expunge().unwrap_err();
    assert!(matches!(retry, MboxError::NeedsRescan { .. }), "got {retry}");
    assert!(matches!(
        mbox.append(b"Subject: x\n\nx\n", None, Flags::empty()),
        Err(MboxError::NeedsRescan { .. })
    ));
    assert_eq!(stream.contents(), damaged);

    // A full rescan indexes what is really there and lifts the block.
    mbox.scan(0, false).unwrap();
    let records = mbox.records().unwrap();
    assert_eq!(records.first().unwrap().separator_start, 0);
    for pair in records.windows(2) {
        assert_eq!(pair[0].body_end, pair[1].separator_start);
    }
    assert_eq!(records.last().unwrap().body_end, damaged.len() as u64);
    mbox.sync().unwrap();
}

// ─── Append ─────────────────────────────────────────────────────────

#[test]
fn test_append_to_new_mailbox() {
    let temp = TempDir::new().unwrap();
    let path = temp.child("new");
    let mbox = Mailbox::create(path.path(), Config::default()).unwrap();
    let events = recorder(&mbox);
    assert_eq!(mbox.messages_count().unwrap(), 0);

    let first = mbox
        .append(b"Subject: one\n\nFrom the start\n", None, Flags::empty())
        .unwrap();
    let second = mbox
        .append(
            b"From x@example.com Tue Jan  2 09:00:00 2024\nSubject: two\n\nsecond\n",
            None,
            Flags::SEEN,
        )
        .unwrap();
    assert_eq!((first, second), (1, 2));
    assert!(events
        .lock()
        .unwrap()
        .contains(&MailboxEvent::MessageAppended { offset: 0 }));

    path.assert(predicate::str::contains(">From the start\n"));
    path.assert(predicate::str::contains("From x@example.com Tue Jan  2 09:00:00 2024\n"));
    drop(mbox);

    let reopened = Mailbox::open(path.path(), Config::default()).unwrap();
    assert_eq!(reopened.messages_count().unwrap(), 2);
    assert_eq!(reopened.uid(1).unwrap(), 1);
    assert_eq!(reopened.uid(2).unwrap(), 2);
    assert_eq!(reopened.uidnext().unwrap(), 3);
    assert!(reopened.flags(2).unwrap().contains(Flags::SEEN));
    assert_eq!(
        reopened.get_message(2).unwrap().header_value("Subject").unwrap().as_deref(),
        Some("two")
    );
}

#[test]
fn test_append_after_existing_messages() {
    let temp = TempDir::new().unwrap();
    let inbox = inbox(&temp);
    let mbox = Mailbox::open(inbox.path(), Config::default()).unwrap();

    let msgno = mbox
        .append(b"Subject: four\n\nfourth\n", None, Flags::empty())
        .unwrap();
    assert_eq!(msgno, 4);
    assert_eq!(mbox.uid(4).unwrap(), 4);
    assert_eq!(mbox.uidnext().unwrap(), 5);
    // The file already ended with a newline, so nothing was inserted before the new separator.
    assert_eq!(mbox.get_message(3).unwrap().body().unwrap(), b"Third body.\n");
    assert_eq!(
        mbox.get_message(4).unwrap().header_value("Subject").unwrap().as_deref(),
        Some("four")
    );
}

// ─── Quick access and removal ───────────────────────────────────────

#[test]
fn test_quick_get_by_qid() {
    let temp = TempDir::new().unwrap();
    let inbox = inbox(&temp);
    let mbox = Mailbox::open(inbox.path(), Config::default()).unwrap();

    let qid = mbox.message_qid(2).unwrap();
    assert_eq!(qid, mbox.records().unwrap()[1].separator_start);
    let quick = mbox.quick_get_message(qid).unwrap();
    assert!(Arc::ptr_eq(&quick, &mbox.get_message(2).unwrap()));
    assert!(matches!(
        mbox.quick_get_message(qid + 1),
        Err(MboxError::InvalidHandle(_))
    ));
    drop(mbox);

    // Still valid for a fresh handle that has not scanned yet.
    let reopened = Mailbox::open(inbox.path(), Config::default()).unwrap();
    let view = reopened.quick_get_message(qid).unwrap();
    assert_eq!(view.envelope().unwrap().sender, "bob@example.com");
    assert_eq!(view.uid(), 2);
}

#[test]
fn test_remove_deletes_mailbox_and_lock() {
    let temp = TempDir::new().unwrap();
    let inbox = inbox(&temp);
    let config = Config::default();
    let mbox = Mailbox::open(inbox.path(), config.clone()).unwrap();
    assert_eq!(mbox.messages_count().unwrap(), 3);
    let lock = FileLocker::for_mailbox(inbox.path(), &config.lock);
    assert!(lock.lock_path().exists());

    mbox.remove().unwrap();
    inbox.assert(predicate::path::missing());
    assert!(!lock.lock_path().exists());
    assert!(matches!(
        mbox.messages_count(),
        Err(MboxError::InvalidHandle(_))
    ));
    assert!(matches!(
        Mailbox::open(inbox.path(), config),
        Err(MboxError::FileNotFound(_))
    ));
}

// ─── Opening and locking ────────────────────────────────────────────

#[test]
fn test_missing_file() {
    let temp = TempDir::new().unwrap();
    let err = Mailbox::open(temp.path().join("absent"), Config::default()).unwrap_err();
    assert!(matches!(err, MboxError::FileNotFound(_)));
}

#[test]
fn test_registry_opens_urls() {
    let temp = TempDir::new().unwrap();
    let inbox = inbox(&temp);
    let registry = FormatRegistry::with_defaults();

    let url = format!("mbox://{}", inbox.path().display());
    let mailbox = registry.open(&url, &Config::default()).unwrap();
    assert_eq!(mailbox.scheme(), "mbox");
    assert_eq!(mailbox.messages_count().unwrap(), 3);

    let bare = registry
        .open(&inbox.path().to_string_lossy(), &Config::default())
        .unwrap();
    assert_eq!(bare.messages_count().unwrap(), 3);
}

#[test]
fn test_contended_lock_is_denied() {
    let temp = TempDir::new().unwrap();
    let inbox = inbox(&temp);
    let config = quick_locks();
    let mbox = Mailbox::open(inbox.path(), config.clone()).unwrap();
    assert_eq!(mbox.messages_count().unwrap(), 3);
    mbox.set_flags(1, Flags::DELETED).unwrap();

    let other = FileLocker::for_mailbox(inbox.path(), &config.lock);
    other.lock(LockMode::Shared).unwrap();
    let err = mbox.expunge().unwrap_err();
    assert!(matches!(err, MboxError::LockDenied { .. }), "got {err}");
    assert!(err.is_retryable());

    other.unlock().unwrap();
    mbox.expunge().unwrap();
    assert_eq!(mbox.messages_count().unwrap(), 2);
}

#[test]
fn test_closed_mailbox_rejects_calls() {
    let temp = TempDir::new().unwrap();
    let inbox = inbox(&temp);
    let mbox = Mailbox::open(inbox.path(), Config::default()).unwrap();
    let view = mbox.get_message(1).unwrap();
    mbox.close().unwrap();

    assert!(!view.is_valid());
    assert!(matches!(mbox.expunge(), Err(MboxError::InvalidHandle(_))));
}
