//! # cairn-id
//!
//! Typed identifiers for panel resources.
//!
//! Every ID renders as `{prefix}_{ulid}`:
//! - `srv_01HV4Z2WQXKJNM8GPQY6VBKC3D` for a game server
//! - `lst_01HV4Z3MXNKPQR9HSTZ7WCLD4E` for a shared proxy listener
//! - `mod_01HV4Z4NYPLTRS0JTUA8XDME5F` for a server module
//!
//! The prefix keeps a server ID from being handed to an API expecting a
//! listener ID, and ULIDs keep records sortable by creation time.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

pub use ulid::Ulid;
