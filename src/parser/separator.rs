//! Recognition of the `From ` separator line that opens every message.
//!
//! A line only counts as a separator when it ends in a date in one of the
//! historical mailer layouts:
//!
//! ```text
//!              From user Wed Dec  2 05:53 1992
//! BSD          From user Wed Dec  2 05:53:22 1992
//! SysV         From user Wed Dec  2 05:53 PST 1992
//! rn           From user Wed Dec  2 05:53:22 PST 1992
//!              From user Wed Dec  2 05:53 -0700 1992
//!              From user Wed Dec  2 05:53:22 -0700 1992
//!              From user Wed Dec  2 05:53 1992 PST
//!              From user Wed Dec  2 05:53:22 1992 PST
//!              From user Wed Dec  2 05:53 1992 -0700
//! Solaris      From user Wed Dec  2 05:53:22 1992 -0700
//! ```
//!
//! each optionally followed by ` remote from <host>`. The date is located
//! by walking backwards from the end of the line because the sender token
//! may itself contain spaces.

/// Byte positions of the parts of a separator line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeparatorLayout {
    /// End of the sender token (exclusive).
    pub sender_end: usize,
    /// Start of the weekday that opens the date.
    pub date_start: usize,
    /// End of the date, before any ` remote from` suffix.
    pub date_end: usize,
}

const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];
const REMOTE_FROM: &[u8] = b" remote from";

/// Check whether a line is an mbox separator.
pub fn is_separator(line: &[u8]) -> bool {
    locate(line).is_some()
}

/// Strip a leading BOM and the line terminator.
pub fn trim_line(line: &[u8]) -> &[u8] {
    let line = line.strip_prefix(UTF8_BOM).unwrap_or(line);
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Find the sender and date within a separator line.
///
/// Offsets refer to the line after [`trim_line`]. Returns `None` if the
/// line does not match any accepted layout.
pub fn locate(line: &[u8]) -> Option<SeparatorLayout> {
    let s = trim_line(line);
    if !s.starts_with(b"From ") {
        return None;
    }

    let mut end = s.len();
    if end >= 41 {
        if let Some(sp) = s.iter().rposition(|&b| b == b' ') {
            if sp >= REMOTE_FROM.len() && &s[sp - REMOTE_FROM.len()..sp] == REMOTE_FROM {
                end = sp - REMOTE_FROM.len();
            }
        }
    }
    if end < 27 {
        return None;
    }

    // Byte at `k` positions relative to `end` (k is negative).
    let at = |k: isize| -> u8 {
        let idx = end as isize + k;
        if idx < 0 {
            0
        } else {
            s[idx as usize]
        }
    };
    let is_sign = |b: u8| b == b'+' || b == b'-';

    // `ti` ends up on the space in front of the time of day.
    let mut ti: isize = 0;
    if at(-5) == b' ' {
        if at(-8) == b':' {
            ti = -5;
        } else if at(-9) == b' ' {
            ti = -9;
        } else if at(-11) == b' ' && is_sign(at(-10)) {
            ti = -11;
        }
    } else if at(-4) == b' ' {
        if at(-9) == b' ' {
            ti = -9;
        }
    } else if at(-6) == b' ' && at(-11) == b' ' && is_sign(at(-5)) {
        ti = -11;
    }
    if ti == 0 || at(ti - 3) != b':' {
        return None;
    }
    ti -= if at(ti - 6) == b':' { 9 } else { 6 };
    if at(ti) != b' ' || at(ti - 3) != b' ' || at(ti - 7) != b' ' || at(ti - 11) != b' ' {
        return None;
    }

    let weekday_space = end as isize + ti - 11;
    // The sender must be at least one byte long.
    if weekday_space < 6 {
        return None;
    }
    let weekday_space = weekday_space as usize;
    Some(SeparatorLayout {
        sender_end: weekday_space,
        date_start: weekday_space + 1,
        date_end: end,
    })
}

/// Check whether a line is blank (empty or only CR / LF).
pub fn is_blank_line(line: &[u8]) -> bool {
    line.iter().all(|&b| b == b'\n' || b == b'\r')
}
