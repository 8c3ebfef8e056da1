//! Shared error and identifier types.
//!
//! - [`error`] - The unified [`Error`] enum and its HTTP mapping.
//! - [`source`] - Clock and randomness seams.
//! - [`workspace_id`] - Collision-free per-request identifiers.

pub mod error;
pub mod source;
pub mod workspace_id;

pub use error::{Error, Result};
pub use source::{RandSource, SystemClock, ThreadRandom, TimeSource};
pub use workspace_id::WorkspaceId;
