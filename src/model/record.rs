//! Per-message offset record kept in the message index.

use std::sync::{Arc, Mutex, Weak};

use super::attribute::Flags;
use crate::view::MessageView;

/// Location and state of one message inside the mailbox file.
///
/// Offsets are immutable between scans. `body_end` of a record equals the
/// `separator_start` of the next one, so the trailing blank line that
/// separates two messages belongs to the body of the first.
#[derive(Debug, Default)]
pub struct MessageRecord {
    /// Offset of the `From ` line.
    pub separator_start: u64,
    /// Offset just past the `From ` line (start of the headers).
    pub separator_end: u64,
    /// Offset just past the blank line ending the headers.
    pub body_start: u64,
    /// Offset of the next separator, or end of file.
    pub body_end: u64,
    pub header_line_count: u64,
    pub body_line_count: u64,
    pub flags: Flags,
    pub uid: u64,
    /// Attached view, if any caller still holds one.
    pub(crate) view: Mutex<Weak<MessageView>>,
}

/// Plain copy of a record's position and state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordSpan {
    pub separator_start: u64,
    pub separator_end: u64,
    pub body_start: u64,
    pub body_end: u64,
    pub header_line_count: u64,
    pub body_line_count: u64,
    pub flags: Flags,
    pub uid: u64,
}

impl MessageRecord {
    /// Total bytes from the separator to the end of the body.
    pub fn len(&self) -> u64 {
        self.body_end - self.separator_start
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn span(&self) -> RecordSpan {
        RecordSpan {
            separator_start: self.separator_start,
            separator_end: self.separator_end,
            body_start: self.body_start,
            body_end: self.body_end,
            header_line_count: self.header_line_count,
            body_line_count: self.body_line_count,
            flags: self.flags,
            uid: self.uid,
        }
    }

    /// The live view attached to this record, if any.
    pub fn attached_view(&self) -> Option<Arc<MessageView>> {
        self.view.lock().ok().and_then(|weak| weak.upgrade())
    }

    /// Whether the record must be rewritten at the next compaction.
    pub fn is_dirty(&self) -> bool {
        self.flags.is_modified()
            || self
                .attached_view()
                .is_some_and(|view| view.has_unsaved_changes())
    }

    /// Drop the attached view, marking it stale first.
    pub(crate) fn detach_view(&self) {
        if let Ok(mut weak) = self.view.lock() {
            if let Some(view) = weak.upgrade() {
                view.invalidate();
            }
            *weak = Weak::new();
        }
    }
}
