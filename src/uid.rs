//! UID and UIDVALIDITY bookkeeping.
//!
//! `uidvalidity` names a generation of the mailbox and is only ever chosen
//! once, on the first scan of a file that carries no `X-IMAPbase:` line.
//! Every message gets a UID, either read from its `X-UID:` line or handed
//! out from `uidnext`. UIDs must ascend through the file; a message whose UID
//! does not is given a fresh one.
//!
//! Changes only reach the disk through the compactor, which regenerates the
//! structural header lines of every record flagged `MODIFIED`.

use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{info, warn};

use crate::index::MessageIndex;
use crate::model::attribute::Flags;

/// The mailbox-wide UID counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UidState {
    pub uidvalidity: u64,
    pub uidnext: u64,
}

impl UidState {
    pub fn is_known(&self) -> bool {
        self.uidvalidity != 0
    }

    /// Adopt the persisted `(uidvalidity, uidnext)` pair unless already known.
    pub fn adopt(&mut self, persisted: Option<(u64, u64)>) {
        if self.is_known() {
            return;
        }
        if let Some((uidvalidity, uidnext)) = persisted {
            if uidvalidity != 0 {
                self.uidvalidity = uidvalidity;
                self.uidnext = uidnext.max(1);
            }
        }
    }

    /// Start a new generation if none is known yet.
    pub fn ensure_generation(&mut self) {
        if self.is_known() {
            return;
        }
        self.uidvalidity = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(1)
            .max(1);
        self.uidnext = 1;
        info!(uidvalidity = self.uidvalidity, "Started new UID generation");
    }

    /// Hand out the next UID.
    pub fn allocate(&mut self) -> u64 {
        let uid = self.uidnext.max(1);
        self.uidnext = uid + 1;
        uid
    }

    /// The pair as it should be persisted.
    pub fn as_pair(&self) -> (u64, u64) {
        (self.uidvalidity, self.uidnext)
    }
}

/// Give every record from `from` on a valid, ascending UID.
///
/// Returns how many records were (re)assigned. Reassigned records are marked
/// `MODIFIED` so their `X-UID:` line is rewritten.
pub fn normalize(index: &mut MessageIndex, from: usize, uids: &mut UidState) -> usize {
    let mut prev = from
        .checked_sub(1)
        .and_then(|i| index.get(i))
        .map_or(0, |r| r.uid);
    let mut changed = 0;
    for (pos, record) in index.iter_mut().enumerate().skip(from) {
        if record.uid == 0 || record.uid <= prev {
            if record.uid != 0 {
                warn!(
                    msgno = pos + 1,
                    uid = record.uid,
                    previous = prev,
                    "UID out of order, reassigning"
                );
            }
            uids.uidnext = uids.uidnext.max(prev + 1);
            record.uid = uids.allocate();
            record.flags.insert(Flags::MODIFIED);
            changed += 1;
        }
        prev = record.uid;
    }
    uids.uidnext = uids.uidnext.max(prev + 1);
    changed
}

/// Flag the first message when the persisted generation line is stale.
pub fn mark_generation_holder(
    index: &mut MessageIndex,
    uids: &UidState,
    persisted: Option<(u64, u64)>,
) -> bool {
    if persisted == Some(uids.as_pair()) {
        return false;
    }
    match index.get_mut(0) {
        Some(first) => {
            first.flags.insert(Flags::MODIFIED);
            true
        }
        None => false,
    }
}
