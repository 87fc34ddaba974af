use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::{PRIVATE_ROOM_NAMESPACE, ROOM_ID_SEPARATOR};
use crate::error::ChatError;

// Principal identity = opaque account id issued by the account service
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct PrincipalId(pub String);

impl PrincipalId {
    /// Validate and wrap a raw id.
    ///
    /// Ids must be non-empty and may not contain the room separator, otherwise
    /// two different pairs could collapse onto the same canonical room id.
    pub fn parse(raw: &str) -> Result<Self, ChatError> {
        let raw = raw.trim();
        if raw.is_empty() || raw.contains(ROOM_ID_SEPARATOR) {
            return Err(ChatError::InvalidParticipants(format!(
                "malformed principal id {raw:?}"
            )));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PrincipalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct ConversationId(pub Uuid);

impl ConversationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Deterministic id of the private conversation behind a canonical room.
    pub fn for_room(room: &RoomId) -> Self {
        Self(Uuid::new_v5(&PRIVATE_ROOM_NAMESPACE, room.0.as_bytes()))
    }
}

impl Default for ConversationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Order-independent room key of a 1:1 chat: the two principal ids, sorted
/// and joined with `:`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct RoomId(pub String);

impl RoomId {
    pub fn canonical_private(a: &PrincipalId, b: &PrincipalId) -> Result<Self, ChatError> {
        if a == b {
            return Err(ChatError::InvalidParticipants(
                "a private conversation needs two different principals".into(),
            ));
        }
        let (low, high) = if a < b { (a, b) } else { (b, a) };
        Ok(Self(format!("{}{}{}", low, ROOM_ID_SEPARATOR, high)))
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConversationKind {
    Private,
    Group,
}

impl ConversationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Private => "private",
            Self::Group => "group",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "private" => Some(Self::Private),
            "group" => Some(Self::Group),
            _ => None,
        }
    }
}

/// A private or group chat and its authoritative participant set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: ConversationId,
    pub kind: ConversationKind,
    /// Sorted, duplicate-free.
    pub participants: Vec<PrincipalId>,
    pub name: Option<String>,
    pub owner: Option<PrincipalId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn is_member(&self, principal: &PrincipalId) -> bool {
        self.participants.binary_search(principal).is_ok()
    }

    pub fn is_group(&self) -> bool {
        self.kind == ConversationKind::Group
    }
}

/// A persisted chat message. `seq` is strictly increasing within its
/// conversation and doubles as the pagination cursor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: Uuid,
    pub conversation_id: ConversationId,
    pub seq: u64,
    pub sender: PrincipalId,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(s: &str) -> PrincipalId {
        PrincipalId::parse(s).unwrap()
    }

    #[test]
    fn test_canonical_room_is_order_independent() {
        let a = pid("64f0c1aa");
        let b = pid("64f0c1bb");
        let ab = RoomId::canonical_private(&a, &b).unwrap();
        let ba = RoomId::canonical_private(&b, &a).unwrap();
        assert_eq!(ab, ba);
        assert_eq!(ab.0, "64f0c1aa:64f0c1bb");
        assert_eq!(ConversationId::for_room(&ab), ConversationId::for_room(&ba));
    }

    #[test]
    fn test_canonical_room_rejects_self_chat() {
        let a = pid("user-1");
        assert!(matches!(
            RoomId::canonical_private(&a, &a),
            Err(ChatError::InvalidParticipants(_))
        ));
    }

    #[test]
    fn test_principal_id_rejects_separator_and_blank() {
        assert!(PrincipalId::parse("").is_err());
        assert!(PrincipalId::parse("   ").is_err());
        assert!(PrincipalId::parse("a:b").is_err());
        assert_eq!(pid(" doc-7 ").as_str(), "doc-7");
    }

    #[test]
    fn test_membership_lookup_on_sorted_participants() {
        let now = Utc::now();
        let conv = Conversation {
            id: ConversationId::new(),
            kind: ConversationKind::Group,
            participants: vec![pid("a"), pid("b"), pid("c")],
            name: Some("Care Circle".into()),
            owner: Some(pid("a")),
            created_at: now,
            updated_at: now,
        };
        assert!(conv.is_member(&pid("b")));
        assert!(!conv.is_member(&pid("z")));
        assert!(conv.is_group());
    }
}
