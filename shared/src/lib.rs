//! Burrow Shared Library
//!
//! Wire protocol and error types used by both the relay and the agent.

pub mod protocol;
pub mod error;

pub use error::{Error, ErrorKind, Result};
