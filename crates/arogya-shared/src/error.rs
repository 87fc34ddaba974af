use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Distinguishable error codes surfaced to clients in `error` events and
/// HTTP error bodies.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    AuthRequired,
    Forbidden,
    NotAMember,
    EmptyContent,
    InvalidParticipants,
    InvalidGroup,
    DuplicateMember,
    NotGroupConversation,
    DeliveryFailed,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AuthRequired => "AuthRequired",
            Self::Forbidden => "Forbidden",
            Self::NotAMember => "NotAMember",
            Self::EmptyContent => "EmptyContent",
            Self::InvalidParticipants => "InvalidParticipants",
            Self::InvalidGroup => "InvalidGroup",
            Self::DuplicateMember => "DuplicateMember",
            Self::NotGroupConversation => "NotGroupConversation",
            Self::DeliveryFailed => "DeliveryFailed",
        }
    }

    /// Client errors are the caller's fault and are never retried.
    pub fn is_client_error(&self) -> bool {
        !matches!(self, Self::DeliveryFailed)
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-call chat failures. Every variant maps onto exactly one [`ErrorCode`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChatError {
    #[error("Authentication required: {0}")]
    AuthRequired(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not a participant in this conversation")]
    NotAMember,

    #[error("Message content is empty")]
    EmptyContent,

    #[error("Invalid participants: {0}")]
    InvalidParticipants(String),

    #[error("Invalid group: {0}")]
    InvalidGroup(String),

    #[error("Duplicate member: {0}")]
    DuplicateMember(String),

    #[error("Conversation is not a group")]
    NotGroupConversation,

    #[error("Delivery failed: {0}")]
    DeliveryFailed(String),
}

impl ChatError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::AuthRequired(_) => ErrorCode::AuthRequired,
            Self::Forbidden(_) => ErrorCode::Forbidden,
            Self::NotAMember => ErrorCode::NotAMember,
            Self::EmptyContent => ErrorCode::EmptyContent,
            Self::InvalidParticipants(_) => ErrorCode::InvalidParticipants,
            Self::InvalidGroup(_) => ErrorCode::InvalidGroup,
            Self::DuplicateMember(_) => ErrorCode::DuplicateMember,
            Self::NotGroupConversation => ErrorCode::NotGroupConversation,
            Self::DeliveryFailed(_) => ErrorCode::DeliveryFailed,
        }
    }
}

#[derive(Error, Debug)]
pub enum TokenError {
    #[error("Token encoding is invalid")]
    Malformed,

    #[error("Token has expired")]
    Expired,

    #[error("Token signature is invalid")]
    BadSignature,
}

impl From<TokenError> for ChatError {
    fn from(err: TokenError) -> Self {
        ChatError::AuthRequired(err.to_string())
    }
}
