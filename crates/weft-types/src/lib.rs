//! Core types for the weft Matrix client SDK.
//!
//! This crate holds the protocol-level value types that have no network or
//! storage dependencies: Matrix identifiers and content URIs, the dynamic
//! event envelope with its redaction and relation semantics, text helpers
//! (reply-fallback stripping, emote detection), and the pluggable
//! localization seam used to render event summaries.
//!
//! Everything here is pure data plus parsing. The stateful parts of the SDK
//! (rooms, timelines, the sync engine) live in `weft-client`.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod event;
mod identifiers;
pub mod localizations;
pub mod text;

pub use event::{Event, EventStatus, Membership};
pub use identifiers::{is_valid_matrix_id, IdParseError, MxcUri, UserId};
pub use localizations::{EnglishLocalizations, Localizations, SummaryContext};
