use serde::{Deserialize, Serialize};

use crate::error::{ChatError, ErrorCode};
use crate::types::{ChatMessage, ConnectionId, ConversationId, PrincipalId};

/// Events a client may send over its connection.
///
/// Transport-level disconnect is not an event: it is the socket closing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase",
    deny_unknown_fields
)]
pub enum ClientEvent {
    /// Present a session token issued by the auth service
    Authenticate { token: String },

    /// Go live on an existing conversation
    JoinConversation { conversation_id: ConversationId },

    /// Resolve (or create) the 1:1 conversation with another principal and join it
    JoinPrivate { other_principal_id: PrincipalId },

    /// Post text to a joined conversation
    SendMessage {
        conversation_id: ConversationId,
        text: String,
    },
}

/// Events pushed from the server to a connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    Authenticated {
        principal_id: PrincipalId,
        connection_id: ConnectionId,
    },

    /// `last_seq` is the catch-up marker: history up to and including it is
    /// read via the history endpoint, everything after arrives live.
    Joined {
        conversation_id: ConversationId,
        last_seq: u64,
    },

    NewMessage {
        conversation_id: ConversationId,
        message: ChatMessage,
    },

    Error { code: ErrorCode, message: String },
}

impl ClientEvent {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Authenticate { .. } => "authenticate",
            Self::JoinConversation { .. } => "joinConversation",
            Self::JoinPrivate { .. } => "joinPrivate",
            Self::SendMessage { .. } => "sendMessage",
        }
    }
}

impl ServerEvent {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn error(err: &ChatError) -> Self {
        Self::Error {
            code: err.code(),
            message: err.to_string(),
        }
    }
}
