//! Centralized error types for mboxstore.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// The stage of an operation an I/O error happened in.
///
/// Carried by [`MboxError::Io`] so a log line says *where* things broke,
/// not only *what* the OS reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Open,
    Stat,
    Scan,
    Read,
    Append,
    /// Streaming the dirty suffix into the spill file.
    Spill,
    /// Re-checking the live size before the commit.
    Reconcile,
    /// Copying the spill file back into the mailbox.
    Commit,
    Truncate,
    Lock,
    Remove,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Open => "open",
            Phase::Stat => "stat",
            Phase::Scan => "scan",
            Phase::Read => "read",
            Phase::Append => "append",
            Phase::Spill => "spill",
            Phase::Reconcile => "reconcile",
            Phase::Commit => "commit",
            Phase::Truncate => "truncate",
            Phase::Lock => "lock",
            Phase::Remove => "remove",
        };
        f.write_str(name)
    }
}

/// All errors produced by the mboxstore library.
#[derive(Error, Debug)]
pub enum MboxError {
    /// A handle (message view, closed mailbox) no longer refers to live data.
    #[error("Invalid handle: {0}")]
    InvalidHandle(String),

    /// An allocation for the message index could not be satisfied.
    #[error("Out of memory while growing the message index")]
    OutOfMemory,

    /// I/O error with the phase, byte offset and file it happened on.
    #[error("I/O error during {phase} at offset {offset} of '{path}': {source}")]
    Io {
        phase: Phase,
        offset: u64,
        path: PathBuf,
        source: std::io::Error,
    },

    /// The advisory lock is held by someone else.
    #[error("Mailbox is locked by another process: {path}")]
    LockDenied { path: PathBuf },

    /// Gave up waiting for the advisory lock.
    #[error("Timed out after {waited:?} waiting for the lock on {path}")]
    LockTimeout { path: PathBuf, waited: Duration },

    /// The file shrank behind our back or a structural invariant broke.
    #[error("Mailbox '{path}' is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    /// The expunge commit failed part way; the mailbox may need manual repair.
    #[error("Expunge of '{path}' failed while rewriting the file (spill copy kept at {backup:?}): {source}")]
    CorruptionRisk {
        path: PathBuf,
        backup: Option<PathBuf>,
        source: std::io::Error,
    },

    /// An earlier expunge failed part way; writes wait for a full rescan.
    #[error("Mailbox '{path}' must be rescanned from the first message before it is written again")]
    NeedsRescan { path: PathBuf },

    /// Message number out of range.
    #[error("No such message: {0}")]
    NotFound(usize),

    /// Duplicate key inserted into a sorted index.
    #[error("Entry already exists: {0}")]
    AlreadyExists(String),

    /// The specified mailbox file does not exist.
    #[error("Mailbox file not found: {0}")]
    FileNotFound(PathBuf),

    /// No storage format is registered for the requested scheme.
    #[error("Unknown mailbox format: {0}")]
    UnknownFormat(String),

    /// A configuration value is out of range.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Convenience alias for `Result<T, MboxError>`.
pub type Result<T> = std::result::Result<T, MboxError>;

impl MboxError {
    /// Create an `Io` variant with full context.
    pub fn io(
        phase: Phase,
        offset: u64,
        path: impl Into<PathBuf>,
        source: std::io::Error,
    ) -> Self {
        Self::Io {
            phase,
            offset,
            path: path.into(),
            source,
        }
    }

    /// Create a `Corrupt` variant.
    pub fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Whether the caller may simply try the same operation again.
    ///
    /// Lock contention is always retryable. I/O failures are retryable unless
    /// they happened while the original file was being rewritten, which is
    /// reported as [`MboxError::CorruptionRisk`] instead.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::LockDenied { .. } | Self::LockTimeout { .. } | Self::Io { .. }
        )
    }

    /// Whether the error signals damage (observed or possible) to the file.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::Corrupt { .. } | Self::CorruptionRisk { .. } | Self::NeedsRescan { .. }
        )
    }
}

/// Allow `?` on `std::io::Error` when no context is available
/// (rare, prefer `MboxError::io`).
impl From<std::io::Error> for MboxError {
    fn from(source: std::io::Error) -> Self {
        Self::Io {
            phase: Phase::Read,
            offset: 0,
            path: PathBuf::from("<unknown>"),
            source,
        }
    }
}

impl From<std::collections::TryReserveError> for MboxError {
    fn from(_: std::collections::TryReserveError) -> Self {
        Self::OutOfMemory
    }
}
