//! Wire protocol for the termaway daemon.
//!
//! Every frame on the wire is one UTF-8 JSON object with a `"type"`
//! discriminator, kebab-cased. Field names are camelCase to match the
//! client-side protocol. This crate is serde-only; framing and transport
//! live in the daemon.

pub mod messages;
pub mod types;

pub use messages::{ClientFrame, FrameParseError, ServerFrame};
pub use types::{ClientEntry, SessionEntry};
