//! declog-interchange: decision record types and validation.
//!
//! Provides the typed [`DecisionRecord`] that every other declog crate
//! passes around, the small enums for timestamp sources, temporal modes
//! and trust tiers, and a single [`validate`] entry point that turns a
//! candidate `serde_json::Value` into a record or a [`ValidationError`]
//! naming the first failing field.
//!
//! Unknown top-level blocks are kept verbatim in
//! [`DecisionRecord::extensions`] so records written by newer producers
//! survive storage and replay unchanged.

pub mod types;
pub mod validate;

pub use types::*;
pub use validate::{validate, validate_line, ValidationError, MAX_RATIONALE_CHARS};
