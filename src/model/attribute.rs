//! Message attribute flags and their `Status:` header encoding.
//!
//! Each known flag maps to one letter:
//!
//! | Flag       | Letter |
//! |------------|--------|
//! | `SEEN`     | `O`    |
//! | `ANSWERED` | `A`    |
//! | `FLAGGED`  | `F`    |
//! | `READ`     | `R`    |
//! | `DRAFT`    | `T`    |
//! | `DELETED`  | `d`    |
//!
//! Parsing is case-insensitive and ignores letters it does not know.
//! `MODIFIED` never reaches the disk.

use bitflags::bitflags;

bitflags! {
    /// Per-message attribute bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Flags: u32 {
        const SEEN     = 0x0001;
        const ANSWERED = 0x0002;
        const FLAGGED  = 0x0004;
        const DELETED  = 0x0008;
        const DRAFT    = 0x0010;
        const READ     = 0x0020;
        /// In-memory only: the record must be rewritten at the next expunge.
        const MODIFIED = 0x1000;
    }
}

/// Letter order used when writing a status string.
const LETTERS: [(Flags, char); 6] = [
    (Flags::SEEN, 'O'),
    (Flags::ANSWERED, 'A'),
    (Flags::FLAGGED, 'F'),
    (Flags::READ, 'R'),
    (Flags::DRAFT, 'T'),
    (Flags::DELETED, 'd'),
];

impl Flags {
    /// Flags that are persisted in the status line.
    pub const PERSISTENT: Flags = Flags::SEEN
        .union(Flags::ANSWERED)
        .union(Flags::FLAGGED)
        .union(Flags::DELETED)
        .union(Flags::DRAFT)
        .union(Flags::READ);

    /// A message nobody has seen yet.
    pub fn is_recent(self) -> bool {
        !self.contains(Flags::SEEN)
    }

    pub fn is_deleted(self) -> bool {
        self.contains(Flags::DELETED)
    }

    pub fn is_modified(self) -> bool {
        self.contains(Flags::MODIFIED)
    }

    /// Set `bits` and raise `MODIFIED`.
    pub fn mark(&mut self, bits: Flags) {
        self.insert(bits | Flags::MODIFIED);
    }

    /// Clear `bits` and raise `MODIFIED`, unless `MODIFIED` itself is being cleared.
    pub fn unmark(&mut self, bits: Flags) {
        self.remove(bits);
        if !bits.contains(Flags::MODIFIED) {
            self.insert(Flags::MODIFIED);
        }
    }
}

/// Encode the persistent flags as status letters (`"OAd"`, …).
pub fn flags_to_string(flags: Flags) -> String {
    LETTERS
        .iter()
        .filter(|(f, _)| flags.contains(*f))
        .map(|(_, c)| *c)
        .collect()
}

/// Decode status letters. Accepts an optional `Status:` prefix.
pub fn string_to_flags(s: &str) -> Flags {
    let value = match s.get(..7) {
        Some(prefix) if prefix.eq_ignore_ascii_case("status:") => &s[7..],
        _ => s,
    };
    value.chars().fold(Flags::empty(), |acc, c| {
        acc | match c.to_ascii_uppercase() {
            'O' => Flags::SEEN,
            'A' => Flags::ANSWERED,
            'F' => Flags::FLAGGED,
            'R' => Flags::READ,
            'T' => Flags::DRAFT,
            'D' => Flags::DELETED,
            _ => Flags::empty(),
        }
    })
}

/// The full `Status:` header line for `flags`, or `None` when no letter applies.
pub fn status_line(flags: Flags) -> Option<String> {
    let letters = flags_to_string(flags);
    if letters.is_empty() {
        None
    } else {
        Some(format!("Status: {letters}\n"))
    }
}
