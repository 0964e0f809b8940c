//! Error types for event handling.

use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum EventError {
    #[error("unsupported event version: {event_type} v{version}")]
    UnsupportedVersion { event_type: String, version: i32 },
}
