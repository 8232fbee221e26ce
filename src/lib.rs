//! `mboxstore`: an mbox mailbox storage engine.
//!
//! This crate indexes UNIX mbox files incrementally, gives read access to
//! individual messages, tracks IMAP-style flags and UIDs in the file itself,
//! and rewrites only the changed tail of the file on expunge or sync. Other
//! processes are kept out with an advisory lock file.

mod compactor;
pub mod config;
pub mod error;
pub mod index;
pub mod locker;
pub mod mailbox;
pub mod model;
pub mod parser;
mod scanner;
pub mod stream;
pub mod uid;
pub mod view;
pub mod writer;

pub use config::Config;
pub use error::{MboxError, Result};
pub use mailbox::{FormatRegistry, Mailbox, MailboxBackend, MailboxEvent, Observer};
pub use model::attribute::Flags;
pub use model::envelope::Envelope;
pub use view::MessageView;
