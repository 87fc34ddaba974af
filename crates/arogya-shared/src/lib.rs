//! # arogya-shared
//!
//! Types shared by the ArogyaPath chat store and gateway: principal and
//! conversation identifiers, the JSON event protocol spoken over client
//! connections, error codes, and auth-service session tokens.

pub mod constants;
pub mod error;
pub mod protocol;
pub mod token;
pub mod types;

pub use error::{ChatError, ErrorCode, TokenError};
pub use types::*;
