//! # cairn-events
//!
//! Lifecycle events emitted by the panel's service layer and consumed by the
//! proxy manager.
//!
//! Events describe things that already happened to a server, listener or
//! module (a container started, a hostname changed, a listener was deleted).
//! Consumers re-read the current record from the store instead of trusting
//! payload snapshots, so payloads only carry identifiers plus whatever prior
//! state is needed to undo a route (old hostname, old listener).
//!
//! Event types:
//! - Server events (`server.*`)
//! - Listener events (`listener.*`)
//! - Module events (`module.*`)

mod envelope;
mod error;
mod types;

pub use envelope::*;
pub use error::EventError;
pub use types::*;
