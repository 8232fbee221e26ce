//! Core data model types: attribute flags, envelopes and message records.

pub mod attribute;
pub mod envelope;
pub mod record;
