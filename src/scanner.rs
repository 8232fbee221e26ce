//! Incremental mailbox scanner.
//!
//! Walks the file line by line from a known message, recognises separator
//! lines and the handful of structural header lines, and rebuilds the index
//! from that message on. Records are built on the side and only committed
//! once the whole pass succeeded, so a failed scan leaves the previous index
//! untouched.
//!
//! The scanner always restarts at the last known message (or earlier, if
//! asked), which is how growth of the final message is picked up.

use std::io::{BufRead, BufReader};
use std::ops::Range;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::config::ScanConfig;
use crate::error::{MboxError, Phase, Result};
use crate::locker::LockGuard;
use crate::mailbox::{MailboxEvent, MailboxState};
use crate::model::attribute::{string_to_flags, Flags};
use crate::model::record::MessageRecord;
use crate::parser::header::{self, FieldCollector, HeaderKind};
use crate::parser::separator;
use crate::stream::{ByteStream, SubStream};
use crate::uid;

/// Result of one scan pass.
#[derive(Debug)]
pub(crate) struct ScanOutcome {
    /// Messages in the index after the pass.
    pub count: usize,
    /// 1-based numbers of messages that were not known before.
    pub added: Range<usize>,
}

/// Everything a scan pass needs besides the mailbox state.
pub(crate) struct Scanner<'a> {
    pub stream: &'a Arc<dyn ByteStream>,
    pub path: &'a Path,
    pub config: &'a ScanConfig,
    pub guard: &'a LockGuard<'a>,
    pub emit: &'a dyn Fn(MailboxEvent),
}

/// A message whose end has not been seen yet.
struct Building {
    record: MessageRecord,
    in_headers: bool,
    fields: FieldCollector,
}

#[derive(Default)]
struct Pass {
    fresh: Vec<MessageRecord>,
    fields: Vec<Vec<(String, String)>>,
    current: Option<Building>,
    /// Whether the first message built is the first message of the file.
    at_file_start: bool,
    base: Option<(u64, u64)>,
    prev_blank: bool,
    preamble: u64,
}

impl Scanner<'_> {
    /// Rescan from message `from_msgno` (1-based; 0 means the first).
    pub fn scan(&self, state: &mut MailboxState, from_msgno: usize) -> Result<ScanOutcome> {
        let started = Instant::now();
        let live_size = self
            .stream
            .size()
            .map_err(|e| MboxError::io(Phase::Stat, 0, self.path, e))?;
        if live_size < state.size {
            return Err(self.corrupt(format!(
                "file shrank from {} to {} bytes since the last scan",
                state.size, live_size
            )));
        }

        let known = state.index.len();
        let first = from_msgno
            .saturating_sub(1)
            .min(known.saturating_sub(1));
        let start = state.index.get(first).map_or(0, |r| r.separator_start);
        debug!(
            path = %self.path.display(),
            from = first + 1,
            start,
            size = live_size,
            "Scanning mailbox"
        );

        let mut pass = Pass {
            at_file_start: first == 0,
            prev_blank: true,
            ..Pass::default()
        };
        let sub = SubStream::new(Arc::clone(self.stream), start, live_size);
        let mut reader = BufReader::with_capacity(self.config.read_buffer_size, sub);
        let mut offset = start;
        let mut lines: u64 = 0;
        let mut line_buf: Vec<u8> = Vec::with_capacity(4096);

        loop {
            line_buf.clear();
            let line_len = reader
                .read_until(b'\n', &mut line_buf)
                .map_err(|e| MboxError::io(Phase::Scan, offset, self.path, e))?
                as u64;
            if line_len == 0 {
                break;
            }

            if lines == 0 && start > 0 && !separator::is_separator(&line_buf) {
                return Err(self.corrupt(format!(
                    "message {} no longer starts at offset {}",
                    first + 1,
                    start
                )));
            }

            self.feed(&mut pass, state, &line_buf, offset)?;

            offset += line_len;
            lines += 1;
            if self.config.progress_every_lines > 0 && lines % self.config.progress_every_lines == 0
            {
                (self.emit)(MailboxEvent::Progress {
                    percent: percent(offset, live_size),
                });
            }
        }

        if offset != live_size {
            return Err(self.corrupt(format!(
                "expected {} bytes, read {}",
                live_size, offset
            )));
        }
        if let Some(building) = pass.current.take() {
            self.finish(&mut pass, state, building, offset)?;
        }
        if pass.preamble > 0 {
            warn!(
                path = %self.path.display(),
                bytes = pass.preamble,
                "Ignoring data before the first message"
            );
        }

        let count = self.commit(state, first, pass, live_size)?;
        let added = (known + 1)..(count + 1).max(known + 1);
        info!(
            path = %self.path.display(),
            messages = count,
            new = added.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Scan complete"
        );
        Ok(ScanOutcome { count, added })
    }

    fn corrupt(&self, reason: String) -> MboxError {
        warn!(path = %self.path.display(), reason = %reason, "Mailbox corrupt");
        (self.emit)(MailboxEvent::Corrupt {
            reason: reason.clone(),
        });
        MboxError::corrupt(self.path, reason)
    }

    fn feed(
        &self,
        pass: &mut Pass,
        state: &MailboxState,
        line: &[u8],
        offset: u64,
    ) -> Result<()> {
        let line_len = line.len() as u64;

        if separator::is_separator(line) {
            if let Some(building) = pass.current.take() {
                if !pass.prev_blank {
                    warn!(
                        offset,
                        "Found 'From ' separator without preceding blank line"
                    );
                }
                self.finish(pass, state, building, offset)?;
            }
            pass.current = Some(Building {
                record: MessageRecord {
                    separator_start: offset,
                    separator_end: offset + line_len,
                    body_start: offset + line_len,
                    ..MessageRecord::default()
                },
                in_headers: true,
                fields: FieldCollector::default(),
            });
            pass.prev_blank = false;
            return Ok(());
        }

        pass.prev_blank = separator::is_blank_line(line);
        let reads_base = pass.at_file_start && pass.fresh.is_empty();
        let Some(building) = pass.current.as_mut() else {
            pass.preamble += line_len;
            return Ok(());
        };

        if !building.in_headers {
            building.record.body_line_count += 1;
            return Ok(());
        }
        if pass.prev_blank {
            building.in_headers = false;
            building.record.body_start = offset + line_len;
            return Ok(());
        }

        building.record.header_line_count += 1;
        match header::classify(line) {
            HeaderKind::Status => {
                let value = header::field_value(line);
                building.record.flags = string_to_flags(&String::from_utf8_lossy(value));
            }
            HeaderKind::Uid => match header::parse_uid(line) {
                Some(uid) => building.record.uid = uid,
                None => warn!(offset, "Unparseable X-UID line ignored"),
            },
            HeaderKind::ImapBase if reads_base => match header::parse_imapbase(line) {
                Some(base) => pass.base = Some(base),
                None => warn!(offset, "Unparseable X-IMAPbase line ignored"),
            },
            _ => building.fields.feed(&state.header_cache, line),
        }
        Ok(())
    }

    /// Close the message under construction at `end`.
    fn finish(
        &self,
        pass: &mut Pass,
        state: &MailboxState,
        building: Building,
        end: u64,
    ) -> Result<()> {
        let mut record = building.record;
        if building.in_headers {
            // No blank line: the whole message is header.
            record.body_start = end;
        }
        record.body_end = end;

        if let Some(old) = state
            .index
            .position_by_offset(record.separator_start)
            .and_then(|pos| state.index.get(pos))
        {
            if old.flags.is_modified() {
                record.flags = old.flags;
                record.uid = old.uid;
            } else {
                record.flags |= old.flags & Flags::DELETED;
                if record.uid == 0 {
                    record.uid = old.uid;
                }
            }
            if same_layout(old, &record) {
                if let (Ok(mut slot), Ok(old_slot)) = (record.view.lock(), old.view.lock()) {
                    *slot = old_slot.clone();
                }
            }
        }

        pass.fresh.try_reserve(1)?;
        pass.fresh.push(record);
        pass.fields.push(building.fields.finish());

        let every = self.config.touch_every_messages;
        if every > 0 && pass.fresh.len() % every == 0 {
            if let Err(e) = self.guard.touch() {
                warn!(error = %e, "Failed to refresh mailbox lock during scan");
            }
        }
        Ok(())
    }

    /// Swap the rebuilt suffix into the index and settle UIDs.
    fn commit(
        &self,
        state: &mut MailboxState,
        first: usize,
        pass: Pass,
        live_size: u64,
    ) -> Result<usize> {
        let Pass {
            fresh,
            fields,
            base,
            at_file_start,
            ..
        } = pass;

        let stale = state.index.truncate(first);
        for old in &stale {
            let kept = fresh
                .binary_search_by_key(&old.separator_start, |r| r.separator_start)
                .ok()
                .is_some_and(|pos| same_layout(old, &fresh[pos]));
            if !kept {
                old.detach_view();
                state.header_cache.evict(old.uid);
            }
        }
        for record in fresh {
            state.index.push(record)?;
        }

        if at_file_start {
            state.persisted_base = base;
        }
        state.uids.adopt(state.persisted_base);
        state.uids.ensure_generation();
        let reassigned = uid::normalize(&mut state.index, first, &mut state.uids);
        if reassigned > 0 {
            debug!(reassigned, "Assigned UIDs");
        }
        uid::mark_generation_holder(&mut state.index, &state.uids, state.persisted_base);

        for (record, fields) in state.index.iter().skip(first).zip(fields) {
            state.header_cache.insert(record.uid, fields);
        }

        state.size = live_size;
        state.mtime = self
            .stream
            .modified()
            .map_err(|e| MboxError::io(Phase::Stat, 0, self.path, e))?;
        state.scanned = true;
        Ok(state.index.len())
    }
}

fn same_layout(a: &MessageRecord, b: &MessageRecord) -> bool {
    a.separator_start == b.separator_start
        && a.separator_end == b.separator_end
        && a.body_start == b.body_start
        && a.body_end == b.body_end
}

fn percent(done: u64, total: u64) -> u8 {
    if total == 0 {
        100
    } else {
        ((done.min(total) * 100) / total) as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::locker::{LockMode, NullLocker};
    use crate::stream::MemStream;
    use std::sync::Mutex;

    const THREE: &[u8] = b"From a@example.com Thu Jan  4 10:00:00 2024\n\
Subject: one\n\
\n\
first body\n\
\n\
From b@example.com Thu Jan  4 11:00:00 2024\n\
Subject: two\n\
Status: RO\n\
X-UID: 7\n\
\n\
second body\n\
\n\
From c@example.com Thu Jan  4 12:00:00 2024\n\
Subject: three\n\
\n\
third body\n";

    fn run(
        stream: &Arc<dyn ByteStream>,
        state: &mut MailboxState,
        from: usize,
    ) -> (Result<ScanOutcome>, Vec<MailboxEvent>) {
        let config = Config::default();
        let locker = NullLocker::default();
        let guard = LockGuard::acquire(&locker, LockMode::Shared).unwrap();
        let events = Mutex::new(Vec::new());
        let emit = |e: MailboxEvent| events.lock().unwrap().push(e);
        let scanner = Scanner {
            stream,
            path: Path::new("test.mbox"),
            config: &config.scan,
            guard: &guard,
            emit: &emit,
        };
        let res = scanner.scan(state, from);
        drop(guard);
        (res, events.into_inner().unwrap())
    }

    fn fresh_state() -> MailboxState {
        MailboxState::new(&Config::default())
    }

    #[test]
    fn test_records_tile_the_file() {
        let stream: Arc<dyn ByteStream> = Arc::new(MemStream::new(THREE));
        let mut state = fresh_state();
        let (res, _) = run(&stream, &mut state, 0);
        assert_eq!(res.unwrap().count, 3);

        let mut expected_start = 0;
        for record in state.index.iter() {
            assert_eq!(record.separator_start, expected_start);
            assert!(record.separator_end <= record.body_start);
            assert!(record.body_start <= record.body_end);
            expected_start = record.body_end;
        }
        assert_eq!(expected_start, THREE.len() as u64);
    }

    #[test]
    fn test_structural_headers_interpreted() {
        let stream: Arc<dyn ByteStream> = Arc::new(MemStream::new(THREE));
        let mut state = fresh_state();
        run(&stream, &mut state, 0).0.unwrap();

        let second = state.index.get(1).unwrap();
        assert!(second.flags.contains(Flags::READ | Flags::SEEN));
        assert_eq!(second.uid, 7);
        assert_eq!(second.header_line_count, 3);
        assert_eq!(second.body_line_count, 2);

        // Missing UIDs are handed out and must ascend.
        let uids: Vec<u64> = state.index.iter().map(|r| r.uid).collect();
        assert!(uids.windows(2).all(|w| w[0] < w[1]));
        assert!(state.index.get(0).unwrap().flags.is_modified());
        assert!(state.uids.is_known());
    }

    #[test]
    fn test_empty_file() {
        let stream: Arc<dyn ByteStream> = Arc::new(MemStream::new(Vec::new()));
        let mut state = fresh_state();
        let (res, _) = run(&stream, &mut state, 0);
        assert_eq!(res.unwrap().count, 0);
    }

    #[test]
    fn test_no_trailing_blank_line() {
        let data = b"From a@example.com Thu Jan  4 10:00:00 2024\nSubject: x\n\nbody without newline";
        let stream: Arc<dyn ByteStream> = Arc::new(MemStream::new(&data[..]));
        let mut state = fresh_state();
        run(&stream, &mut state, 0).0.unwrap();
        let record = state.index.get(0).unwrap();
        assert_eq!(record.body_end, data.len() as u64);
        assert_eq!(record.body_line_count, 1);
    }

    #[test]
    fn test_growth_keeps_offsets_and_uids() {
        let mem = Arc::new(MemStream::new(THREE));
        let stream: Arc<dyn ByteStream> = mem.clone();
        let mut state = fresh_state();
        run(&stream, &mut state, 0).0.unwrap();
        let before: Vec<_> = state.index.iter().map(|r| (r.separator_start, r.uid)).collect();

        mem.append(b"\nFrom d@example.com Thu Jan  4 13:00:00 2024\nSubject: four\n\nfourth\n");
        let prev_len = state.index.len();
        let (res, events) = run(&stream, &mut state, prev_len);
        let outcome = res.unwrap();
        assert_eq!(outcome.count, 4);
        assert_eq!(outcome.added, 4..5);
        assert!(events.is_empty() || events.iter().all(|e| matches!(e, MailboxEvent::Progress { .. })));

        let after: Vec<_> = state.index.iter().map(|r| (r.separator_start, r.uid)).collect();
        assert_eq!(&after[..3], &before[..]);
        assert!(after[3].1 > before[2].1);
    }

    #[test]
    fn test_shrink_is_corrupt_and_leaves_index() {
        let mem = Arc::new(MemStream::new(THREE));
        let stream: Arc<dyn ByteStream> = mem.clone();
        let mut state = fresh_state();
        run(&stream, &mut state, 0).0.unwrap();

        mem.truncate(40).unwrap();
        let (res, events) = run(&stream, &mut state, 0);
        assert!(matches!(res, Err(MboxError::Corrupt { .. })));
        assert!(events.iter().any(|e| matches!(e, MailboxEvent::Corrupt { .. })));
        assert_eq!(state.index.len(), 3);
    }

    #[test]
    fn test_pending_delete_survives_rescan() {
        let stream: Arc<dyn ByteStream> = Arc::new(MemStream::new(THREE));
        let mut state = fresh_state();
        run(&stream, &mut state, 0).0.unwrap();
        state.index.get_mut(2).unwrap().flags.mark(Flags::DELETED);

        run(&stream, &mut state, 0).0.unwrap();
        assert!(state.index.get(2).unwrap().flags.is_deleted());
    }

    #[test]
    fn test_reads_generation_line() {
        let data = b"From a@example.com Thu Jan  4 10:00:00 2024\n\
X-IMAPbase: 1700000000 0000000003\n\
X-UID: 1\n\
\n\
one\n\
\n\
From b@example.com Thu Jan  4 11:00:00 2024\n\
X-IMAPbase: 99 99\n\
X-UID: 2\n\
\n\
two\n";
        let stream: Arc<dyn ByteStream> = Arc::new(MemStream::new(&data[..]));
        let mut state = fresh_state();
        run(&stream, &mut state, 0).0.unwrap();
        assert_eq!(state.uids.uidvalidity, 1_700_000_000);
        assert_eq!(state.uids.uidnext, 3);
        assert_eq!(state.persisted_base, Some((1_700_000_000, 3)));
        assert!(state.index.iter().all(|r| !r.flags.is_modified()));
    }

    #[test]
    fn test_progress_reported() {
        let mut data = Vec::new();
        for i in 0..5 {
            data.extend_from_slice(
                format!("From u{i}@example.com Thu Jan  4 10:00:00 2024\n\n").as_bytes(),
            );
            for _ in 0..400 {
                data.extend_from_slice(b"line\n");
            }
        }
        let stream: Arc<dyn ByteStream> = Arc::new(MemStream::new(data));
        let mut state = fresh_state();
        let (res, events) = run(&stream, &mut state, 0);
        assert_eq!(res.unwrap().count, 5);
        assert!(events
            .iter()
            .any(|e| matches!(e, MailboxEvent::Progress { percent } if *percent > 0)));
    }
}
