//! Expunge and sync: rewriting the dirty suffix of the mailbox.
//!
//! Only the part of the file from the first dirty record on is touched.
//! That suffix is streamed into a spill file next to the mailbox (or in the
//! configured temp dir): unchanged records are copied byte for byte,
//! modified ones are re-serialised, deleted ones are dropped. Data appended
//! by another process in the meantime is copied after them.
//!
//! Nothing in the mailbox is overwritten until the spill file is complete.
//! The copy-back itself runs with termination signals blocked; if it fails
//! part way the spill file is kept and [`MboxError::CorruptionRisk`] is
//! returned.

use std::fs::File;
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use tempfile::NamedTempFile;
use tracing::{debug, error, info, warn};

use crate::config::ExpungeConfig;
use crate::error::{MboxError, Phase, Result};
use crate::locker::LockGuard;
use crate::mailbox::{MailboxEvent, MailboxState};
use crate::model::envelope::Envelope;
use crate::model::record::MessageRecord;
use crate::parser::separator;
use crate::stream::{copy_range, ByteStream};
use crate::view::MessageView;
use crate::writer;

pub(crate) struct Compactor<'a> {
    pub stream: &'a Arc<dyn ByteStream>,
    pub path: &'a Path,
    pub config: &'a ExpungeConfig,
    pub buffer_size: usize,
    /// Records copied between two lock refreshes; 0 never refreshes.
    pub touch_every: usize,
    pub guard: &'a LockGuard<'a>,
    pub emit: &'a dyn Fn(MailboxEvent),
}

/// What a compaction did.
#[derive(Debug, Default)]
pub(crate) struct CompactOutcome {
    /// Index of the first rewritten record, if anything was written.
    pub dirty_from: Option<usize>,
    /// `MessageExpunged` events, to be delivered once the monitor is released.
    pub expunged: Vec<MailboxEvent>,
}

/// Whether `record` forces a rewrite.
fn needs_rewrite(record: &MessageRecord, remove_deleted: bool) -> bool {
    record.is_dirty() || (remove_deleted && record.flags.is_deleted())
}

impl Compactor<'_> {
    pub fn compact(&self, state: &mut MailboxState, remove_deleted: bool) -> Result<CompactOutcome> {
        let Some(dirty) = state
            .index
            .iter()
            .position(|r| needs_rewrite(r, remove_deleted))
        else {
            debug!(path = %self.path.display(), "Nothing to expunge");
            return Ok(CompactOutcome::default());
        };

        let started = Instant::now();
        let marker = state.index.as_slice()[dirty].separator_start;
        debug!(
            path = %self.path.display(),
            dirty_from = dirty + 1,
            marker,
            remove_deleted,
            "Expunging"
        );

        let mut spill = self.spill_file()?;
        let expunged = self.write_suffix(state, dirty, remove_deleted, spill.as_file())?;
        let spill_len = self.reconcile(state, spill.as_file_mut())?;

        if let Err(e) = self.commit(spill, marker, spill_len) {
            // Nothing from `marker` on can be trusted any more.
            forget_suffix(state, dirty, marker);
            state.mtime = None;
            state.scanned = false;
            state.needs_rescan = true;
            warn!(path = %self.path.display(), "Writes blocked until the mailbox is rescanned");
            return Err(e);
        }

        // The suffix moved: drop its records and let the next scan rebuild them.
        forget_suffix(state, dirty, marker);

        info!(
            path = %self.path.display(),
            rewritten_from = dirty + 1,
            removed = expunged.len(),
            bytes = spill_len,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Expunge complete"
        );
        Ok(CompactOutcome {
            dirty_from: Some(dirty),
            expunged,
        })
    }

    fn spill_file(&self) -> Result<NamedTempFile> {
        let dir = match &self.config.temp_dir {
            Some(dir) => dir.clone(),
            None => std::env::temp_dir(),
        };
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "mbox".to_string());
        tempfile::Builder::new()
            .prefix(&format!("mboxstore_{name}_"))
            .tempfile_in(&dir)
            .map_err(|e| MboxError::io(Phase::Spill, 0, &dir, e))
    }

    /// Stream records `dirty..` into the spill file.
    fn write_suffix(
        &self,
        state: &MailboxState,
        dirty: usize,
        remove_deleted: bool,
        spill: &File,
    ) -> Result<Vec<MailboxEvent>> {
        let records = state.index.as_slice();
        let survives = |r: &MessageRecord| !(remove_deleted && r.flags.is_deleted());
        // The generation line lives on the first surviving message.
        let generation_holder = if dirty == 0 {
            records.iter().position(survives)
        } else {
            None
        };

        let mut out = BufWriter::new(spill);
        let mut buf = vec![0u8; self.buffer_size.max(4096)];
        let mut expunged = Vec::new();
        let mut position = 0u64;

        for (i, record) in records.iter().enumerate().skip(dirty) {
            if self.touch_every > 0 && (i - dirty) % self.touch_every == self.touch_every - 1 {
                if let Err(e) = self.guard.touch() {
                    warn!(error = %e, "Failed to refresh mailbox lock during expunge");
                }
            }
            if !survives(record) {
                expunged.push(MailboxEvent::MessageExpunged {
                    position: i + 1,
                    removed_so_far: expunged.len(),
                });
                continue;
            }

            let holder = generation_holder == Some(i);
            let result = if record.is_dirty() || holder {
                let generation = holder.then(|| state.uids.as_pair());
                self.reserialize(record, generation, &mut out, &mut buf)
            } else {
                copy_range(
                    self.stream.as_ref(),
                    record.separator_start,
                    record.len(),
                    &mut out,
                    &mut buf,
                )
            };
            result.map_err(|e| MboxError::io(Phase::Spill, record.separator_start, self.path, e))?;
            position += 1;
        }
        out.flush()
            .map_err(|e| MboxError::io(Phase::Spill, 0, self.path, e))?;
        debug!(kept = position, removed = expunged.len(), "Suffix spilled");
        Ok(expunged)
    }

    /// Write a record anew with regenerated structural headers.
    fn reserialize<W: Write>(
        &self,
        record: &MessageRecord,
        generation: Option<(u64, u64)>,
        out: &mut W,
        buf: &mut [u8],
    ) -> io::Result<()> {
        let view: Option<Arc<MessageView>> = record.attached_view();
        let replaced = view.as_ref().and_then(|v| v.replaced_content());
        let (embedded, message) = match &replaced {
            Some(raw) => writer::strip_separator(raw),
            None => (None, &[][..]),
        };
        let envelope = view
            .as_ref()
            .and_then(|v| v.changed_envelope())
            .or_else(|| embedded.map(Envelope::from_separator));

        match envelope {
            Some(env) => out.write_all(env.to_separator().as_bytes())?,
            None => {
                let line = self.read(record.separator_start, record.separator_end)?;
                out.write_all(&line)?;
                if !line.ends_with(b"\n") {
                    out.write_all(b"\n")?;
                }
                if !separator::is_separator(&line) {
                    warn!(offset = record.separator_start, "Rewriting malformed separator verbatim");
                }
            }
        }

        let flags = record.flags;
        if replaced.is_some() {
            let (head, body) = writer::split_message(message);
            writer::write_headers(out, head, true)?;
            writer::write_structural(out, flags, record.uid, generation)?;
            writer::write_escaped_body(out, body)?;
            out.write_all(b"\n")
        } else {
            let head = self.read(record.separator_end, record.body_start)?;
            writer::write_headers(out, &head, false)?;
            writer::write_structural(out, flags, record.uid, generation)?;
            copy_range(
                self.stream.as_ref(),
                record.body_start,
                record.body_end - record.body_start,
                out,
                buf,
            )
        }
    }

    fn read(&self, start: u64, end: u64) -> io::Result<Vec<u8>> {
        let mut bytes = Vec::with_capacity((end - start) as usize);
        copy_range(
            self.stream.as_ref(),
            start,
            end - start,
            &mut bytes,
            &mut [0u8; 8192],
        )?;
        Ok(bytes)
    }

    /// Pick up data appended since the scan. Returns the final spill length.
    fn reconcile(&self, state: &MailboxState, spill: &mut File) -> Result<u64> {
        let live = self
            .stream
            .size()
            .map_err(|e| MboxError::io(Phase::Reconcile, 0, self.path, e))?;
        if live < state.size {
            let reason = format!(
                "file shrank from {} to {} bytes during expunge",
                state.size, live
            );
            error!(path = %self.path.display(), reason = %reason, "Aborting expunge");
            (self.emit)(MailboxEvent::Corrupt {
                reason: reason.clone(),
            });
            return Err(MboxError::corrupt(self.path, reason));
        }
        if live > state.size {
            let tail = live - state.size;
            info!(path = %self.path.display(), bytes = tail, "Mailbox grew during expunge, keeping new data");
            spill
                .seek(SeekFrom::End(0))
                .and_then(|_| {
                    let mut out = BufWriter::new(&*spill);
                    copy_range(self.stream.as_ref(), state.size, tail, &mut out, &mut [0u8; 8192])?;
                    out.flush()
                })
                .map_err(|e| MboxError::io(Phase::Reconcile, state.size, self.path, e))?;
        }
        spill
            .metadata()
            .map(|m| m.len())
            .map_err(|e| MboxError::io(Phase::Reconcile, 0, self.path, e))
    }

    /// Copy the spill file over the mailbox from `marker` and cut it to size.
    fn commit(&self, mut spill: NamedTempFile, marker: u64, spill_len: u64) -> Result<()> {
        let copied = {
            let _mask = SignalMask::block();
            copy_back(self.stream.as_ref(), spill.as_file_mut(), marker, spill_len)
        };
        match copied {
            Ok(()) => Ok(()),
            Err((phase, source)) => {
                let backup = if self.config.keep_backup_on_failure {
                    match spill.keep() {
                        Ok((_, path)) => Some(path),
                        Err(e) => {
                            warn!(error = %e, "Could not keep spill file");
                            None
                        }
                    }
                } else {
                    None
                };
                error!(
                    path = %self.path.display(),
                    %phase,
                    backup = ?backup,
                    error = %source,
                    "Expunge failed while rewriting the mailbox, manual recovery may be needed"
                );
                Err(MboxError::CorruptionRisk {
                    path: self.path.to_path_buf(),
                    backup,
                    source,
                })
            }
        }
    }
}

/// Drop the records from `dirty` on; the file holds `marker` trusted bytes.
fn forget_suffix(state: &mut MailboxState, dirty: usize, marker: u64) {
    for record in state.index.truncate(dirty) {
        record.detach_view();
        state.header_cache.evict(record.uid);
    }
    state.size = marker;
    if dirty == 0 {
        state.persisted_base = None;
    }
}

fn copy_back(
    stream: &dyn ByteStream,
    spill: &mut File,
    marker: u64,
    spill_len: u64,
) -> std::result::Result<(), (Phase, io::Error)> {
    spill
        .seek(SeekFrom::Start(0))
        .map_err(|e| (Phase::Commit, e))?;
    let mut buf = vec![0u8; 64 * 1024];
    let mut done = 0u64;
    loop {
        let n = spill.read(&mut buf).map_err(|e| (Phase::Commit, e))?;
        if n == 0 {
            break;
        }
        stream
            .write_at(&buf[..n], marker + done)
            .map_err(|e| (Phase::Commit, e))?;
        done += n as u64;
    }
    if done != spill_len {
        return Err((
            Phase::Commit,
            io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("spill file holds {done} bytes, expected {spill_len}"),
            ),
        ));
    }
    stream
        .truncate(marker + spill_len)
        .map_err(|e| (Phase::Truncate, e))?;
    stream.flush().map_err(|e| (Phase::Commit, e))
}

/// Blocks termination signals for its lifetime.
#[cfg(unix)]
struct SignalMask {
    previous: nix::sys::signal::SigSet,
}

#[cfg(unix)]
impl SignalMask {
    fn block() -> Option<Self> {
        use nix::sys::signal::{pthread_sigmask, SigSet, SigmaskHow, Signal};

        let mut set = SigSet::empty();
        for sig in [
            Signal::SIGINT,
            Signal::SIGHUP,
            Signal::SIGTSTP,
            Signal::SIGWINCH,
            Signal::SIGTERM,
        ] {
            set.add(sig);
        }
        let mut previous = SigSet::empty();
        match pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&set), Some(&mut previous)) {
            Ok(()) => Some(Self { previous }),
            Err(e) => {
                warn!(error = %e, "Could not block signals for the commit");
                None
            }
        }
    }
}

#[cfg(unix)]
impl Drop for SignalMask {
    fn drop(&mut self) {
        use nix::sys::signal::{pthread_sigmask, SigmaskHow};

        if let Err(e) = pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&self.previous), None) {
            warn!(error = %e, "Could not restore signal mask");
        }
    }
}

#[cfg(not(unix))]
struct SignalMask;

#[cfg(not(unix))]
impl SignalMask {
    fn block() -> Option<Self> {
        Some(SignalMask)
    }
}
