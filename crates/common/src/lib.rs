//! Shared types for the OIDC gateway workspace
//!
//! Holds the redacting `Secret` wrapper used for client secrets and the
//! configuration error type shared by the service binary.

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
