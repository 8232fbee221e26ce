//! The ordered collection of message records owned by a mailbox.
//!
//! Capacity grows in fixed chunks through `try_reserve`, so a huge mailbox
//! that exhausts memory reports [`MboxError::OutOfMemory`] instead of
//! aborting the process.

use std::cmp::Ordering;

use crate::error::{MboxError, Result};
use crate::model::record::MessageRecord;

/// Records added per growth step.
const CHUNK: usize = 32;

#[derive(Debug, Default)]
pub struct MessageIndex {
    records: Vec<MessageRecord>,
}

impl MessageIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Record at a 0-based position.
    pub fn get(&self, index: usize) -> Option<&MessageRecord> {
        self.records.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut MessageRecord> {
        self.records.get_mut(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, MessageRecord> {
        self.records.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, MessageRecord> {
        self.records.iter_mut()
    }

    pub fn as_slice(&self) -> &[MessageRecord] {
        &self.records
    }

    fn reserve_slot(&mut self) -> Result<()> {
        if self.records.len() == self.records.capacity() {
            self.records.try_reserve_exact(CHUNK)?;
        }
        Ok(())
    }

    /// Open an empty slot at `index`, shifting later records right.
    pub fn expand(&mut self, index: usize) -> Result<&mut MessageRecord> {
        if index > self.records.len() {
            return Err(MboxError::NotFound(index));
        }
        self.reserve_slot()?;
        self.records.insert(index, MessageRecord::default());
        Ok(&mut self.records[index])
    }

    /// Remove `count` records starting at `index`, shifting the rest left.
    pub fn shrink(&mut self, index: usize, count: usize) -> Result<Vec<MessageRecord>> {
        let end = index
            .checked_add(count)
            .filter(|&end| end <= self.records.len())
            .ok_or(MboxError::NotFound(index))?;
        Ok(self.records.drain(index..end).collect())
    }

    pub fn push(&mut self, record: MessageRecord) -> Result<()> {
        self.reserve_slot()?;
        self.records.push(record);
        Ok(())
    }

    /// Insert keeping the index sorted by `cmp`. Equal keys are rejected.
    pub fn insert_sorted_by<F>(&mut self, record: MessageRecord, cmp: F) -> Result<usize>
    where
        F: Fn(&MessageRecord, &MessageRecord) -> Ordering,
    {
        match self.records.binary_search_by(|existing| cmp(existing, &record)) {
            Ok(pos) => Err(MboxError::AlreadyExists(format!(
                "record at position {} (uid {})",
                pos + 1,
                record.uid
            ))),
            Err(pos) => {
                *self.expand(pos)? = record;
                Ok(pos)
            }
        }
    }

    /// Drop every record from `at` on, returning them.
    pub fn truncate(&mut self, at: usize) -> Vec<MessageRecord> {
        let at = at.min(self.records.len());
        self.records.drain(at..).collect()
    }

    pub fn clear(&mut self) -> Vec<MessageRecord> {
        self.truncate(0)
    }

    /// Position of the record with `uid`. UIDs ascend through the index.
    pub fn position_by_uid(&self, uid: u64) -> Option<usize> {
        self.records.binary_search_by_key(&uid, |r| r.uid).ok()
    }

    /// Position of the record whose separator starts at `offset`.
    pub fn position_by_offset(&self, offset: u64) -> Option<usize> {
        self.records
            .binary_search_by_key(&offset, |r| r.separator_start)
            .ok()
    }
}
