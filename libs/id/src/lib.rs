//! # fleet-id
//!
//! Identifier types shared by the runner-fleet crates.
//!
//! ## ID Format
//!
//! Generated IDs use a prefixed, hostname-safe format: `{prefix}-{ulid}` with
//! the ULID in lowercase Crockford base32.
//!
//! Examples:
//! - `runner-01hv4z2wqxkjnm8gpqy6vbkc3d`
//! - `pass-01hv4z3mxnkpqr9hstz7wcld4e`
//!
//! Runner IDs double as VM names on every backend, so they must be valid
//! hostnames (letters, digits and `-`, starting with a letter). Because the
//! ULID is time-ordered, sorting runner IDs sorts them by creation time.
//!
//! Job dedup keys are opaque strings chosen by the queue producer and are
//! carried as [`DedupKey`].

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
