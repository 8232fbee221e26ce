//! Line-level mbox parsing: separator lines and header fields.

pub mod header;
pub mod separator;
