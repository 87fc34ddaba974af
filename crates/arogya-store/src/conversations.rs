//! CRUD operations for conversations and their participant sets.

use arogya_shared::{ChatError, Conversation, ConversationId, ConversationKind, PrincipalId, RoomId};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use uuid::Uuid;

use crate::database::Database;
use crate::error::{Result, StoreError};

impl Database {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Resolve the private conversation between two principals, creating it
    /// on first use.
    ///
    /// The lookup key is the canonical room id, so argument order does not
    /// matter and concurrent callers converge on the same row.
    pub fn get_or_create_private(
        &mut self,
        a: &PrincipalId,
        b: &PrincipalId,
    ) -> Result<Conversation> {
        let room = RoomId::canonical_private(a, b)?;
        let id = ConversationId::for_room(&room);
        let now = Utc::now().to_rfc3339();

        let tx = self
            .conn_mut()
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let inserted = tx.execute(
            "INSERT OR IGNORE INTO conversations (id, kind, room_key, name, owner, created_at, updated_at)
             VALUES (?1, 'private', ?2, NULL, NULL, ?3, ?3)",
            params![id.0.to_string(), room.0, now],
        )?;

        if inserted == 1 {
            for principal in [a, b] {
                tx.execute(
                    "INSERT INTO conversation_members (conversation_id, principal_id, joined_at)
                     VALUES (?1, ?2, ?3)",
                    params![id.0.to_string(), principal.as_str(), now],
                )?;
            }
            tracing::debug!(conversation = %id, room = %room, "created private conversation");
        }

        tx.commit()?;

        self.get_conversation(id)
    }

    /// Insert a fully-formed group conversation with its participants.
    ///
    /// Validation of the participant set is the caller's job.
    pub fn insert_group(&mut self, conversation: &Conversation) -> Result<()> {
        if !conversation.is_group() {
            return Err(ChatError::NotGroupConversation.into());
        }

        let tx = self
            .conn_mut()
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        tx.execute(
            "INSERT INTO conversations (id, kind, room_key, name, owner, created_at, updated_at)
             VALUES (?1, 'group', NULL, ?2, ?3, ?4, ?5)",
            params![
                conversation.id.0.to_string(),
                conversation.name,
                conversation.owner.as_ref().map(PrincipalId::as_str),
                conversation.created_at.to_rfc3339(),
                conversation.updated_at.to_rfc3339(),
            ],
        )?;

        for principal in &conversation.participants {
            tx.execute(
                "INSERT INTO conversation_members (conversation_id, principal_id, joined_at)
                 VALUES (?1, ?2, ?3)",
                params![
                    conversation.id.0.to_string(),
                    principal.as_str(),
                    conversation.created_at.to_rfc3339(),
                ],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    /// Fetch a conversation together with its sorted participant list.
    pub fn get_conversation(&self, id: ConversationId) -> Result<Conversation> {
        let row = self
            .conn()
            .query_row(
                "SELECT id, kind, name, owner, created_at, updated_at
                 FROM conversations
                 WHERE id = ?1",
                params![id.0.to_string()],
                read_conversation_row,
            )
            .optional()?
            .ok_or(StoreError::NotFound)?;

        let participants = self.list_members(id)?;
        row.into_conversation(participants)
    }

    pub fn list_members(&self, id: ConversationId) -> Result<Vec<PrincipalId>> {
        let mut stmt = self.conn().prepare(
            "SELECT principal_id FROM conversation_members
             WHERE conversation_id = ?1",
        )?;

        let rows = stmt.query_map(params![id.0.to_string()], |row| row.get::<_, String>(0))?;

        let mut members = Vec::new();
        for row in rows {
            members.push(PrincipalId(row?));
        }
        members.sort();
        Ok(members)
    }

    pub fn is_member(&self, id: ConversationId, principal: &PrincipalId) -> Result<bool> {
        let found = self
            .conn()
            .query_row(
                "SELECT 1 FROM conversation_members
                 WHERE conversation_id = ?1 AND principal_id = ?2",
                params![id.0.to_string(), principal.as_str()],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// All conversations a principal participates in, most recently updated
    /// first.
    pub fn list_conversations_for(&self, principal: &PrincipalId) -> Result<Vec<Conversation>> {
        let ids = {
            let mut stmt = self.conn().prepare(
                "SELECT c.id FROM conversations c
                 JOIN conversation_members m ON m.conversation_id = c.id
                 WHERE m.principal_id = ?1
                 ORDER BY c.updated_at DESC",
            )?;
            let rows = stmt.query_map(params![principal.as_str()], |row| row.get::<_, String>(0))?;

            let mut ids = Vec::new();
            for row in rows {
                ids.push(parse_conversation_id(&row?)?);
            }
            ids
        };

        ids.into_iter().map(|id| self.get_conversation(id)).collect()
    }

    // ------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------

    /// Add a participant to a group. Returns `false` if already a member.
    pub fn add_member(&mut self, id: ConversationId, principal: &PrincipalId) -> Result<bool> {
        let tx = self
            .conn_mut()
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        require_group(&tx, id)?;

        let now = Utc::now().to_rfc3339();
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO conversation_members (conversation_id, principal_id, joined_at)
             VALUES (?1, ?2, ?3)",
            params![id.0.to_string(), principal.as_str(), now],
        )?;
        if inserted == 1 {
            touch(&tx, id, &now)?;
        }

        tx.commit()?;
        Ok(inserted == 1)
    }

    /// Remove a participant from a group. Returns `false` if not a member.
    pub fn remove_member(&mut self, id: ConversationId, principal: &PrincipalId) -> Result<bool> {
        let tx = self
            .conn_mut()
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        require_group(&tx, id)?;

        let removed = tx.execute(
            "DELETE FROM conversation_members
             WHERE conversation_id = ?1 AND principal_id = ?2",
            params![id.0.to_string(), principal.as_str()],
        )?;
        if removed == 1 {
            touch(&tx, id, &Utc::now().to_rfc3339())?;
        }

        tx.commit()?;
        Ok(removed == 1)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn require_group(conn: &rusqlite::Connection, id: ConversationId) -> Result<()> {
    let kind: String = conn
        .query_row(
            "SELECT kind FROM conversations WHERE id = ?1",
            params![id.0.to_string()],
            |row| row.get(0),
        )
        .optional()?
        .ok_or(StoreError::NotFound)?;

    if kind != ConversationKind::Group.as_str() {
        return Err(ChatError::NotGroupConversation.into());
    }
    Ok(())
}

fn touch(conn: &rusqlite::Connection, id: ConversationId, now: &str) -> Result<()> {
    conn.execute(
        "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
        params![now, id.0.to_string()],
    )?;
    Ok(())
}

/// Raw column values of a `conversations` row.
struct ConversationRow {
    id: String,
    kind: String,
    name: Option<String>,
    owner: Option<String>,
    created_at: String,
    updated_at: String,
}

fn read_conversation_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConversationRow> {
    Ok(ConversationRow {
        id: row.get(0)?,
        kind: row.get(1)?,
        name: row.get(2)?,
        owner: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

impl ConversationRow {
    fn into_conversation(self, participants: Vec<PrincipalId>) -> Result<Conversation> {
        let kind = ConversationKind::from_str_opt(&self.kind).ok_or_else(|| {
            StoreError::Corrupt(format!("unknown conversation kind {:?}", self.kind))
        })?;

        Ok(Conversation {
            id: parse_conversation_id(&self.id)?,
            kind,
            participants,
            name: self.name,
            owner: self.owner.map(PrincipalId),
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
        })
    }
}

pub(crate) fn parse_conversation_id(raw: &str) -> Result<ConversationId> {
    Uuid::parse_str(raw)
        .map(ConversationId)
        .map_err(|e| StoreError::Corrupt(format!("conversation id {raw:?}: {e}")))
}

pub(crate) fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("timestamp {raw:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(s: &str) -> PrincipalId {
        PrincipalId(s.to_string())
    }

    fn group(owner: &str, members: &[&str]) -> Conversation {
        let now = Utc::now();
        let mut participants: Vec<PrincipalId> = members.iter().map(|m| pid(m)).collect();
        participants.push(pid(owner));
        participants.sort();
        Conversation {
            id: ConversationId::new(),
            kind: ConversationKind::Group,
            participants,
            name: Some("Care Circle".into()),
            owner: Some(pid(owner)),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn private_conversation_is_canonical() {
        let mut db = Database::open_in_memory().unwrap();
        let first = db.get_or_create_private(&pid("alice"), &pid("bob")).unwrap();
        let second = db.get_or_create_private(&pid("bob"), &pid("alice")).unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(first.kind, ConversationKind::Private);
        assert_eq!(first.participants, vec![pid("alice"), pid("bob")]);

        let count: i64 = db
            .conn()
            .query_row("SELECT COUNT(*) FROM conversations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn private_conversation_rejects_self() {
        let mut db = Database::open_in_memory().unwrap();
        let err = db.get_or_create_private(&pid("alice"), &pid("alice")).unwrap_err();
        assert!(matches!(
            err,
            StoreError::Rejected(ChatError::InvalidParticipants(_))
        ));
    }

    #[test]
    fn group_round_trip_and_membership() {
        let mut db = Database::open_in_memory().unwrap();
        let conv = group("owner", &["u1", "u2"]);
        db.insert_group(&conv).unwrap();

        let loaded = db.get_conversation(conv.id).unwrap();
        assert_eq!(loaded.participants, conv.participants);
        assert_eq!(loaded.owner, Some(pid("owner")));
        assert!(db.is_member(conv.id, &pid("u1")).unwrap());
        assert!(!db.is_member(conv.id, &pid("u9")).unwrap());

        assert!(db.add_member(conv.id, &pid("u3")).unwrap());
        assert!(!db.add_member(conv.id, &pid("u3")).unwrap());
        assert!(db.remove_member(conv.id, &pid("u1")).unwrap());
        assert!(!db.remove_member(conv.id, &pid("u1")).unwrap());

        let members = db.list_members(conv.id).unwrap();
        assert_eq!(members, vec![pid("owner"), pid("u2"), pid("u3")]);
    }

    #[test]
    fn member_mutation_on_private_is_refused() {
        let mut db = Database::open_in_memory().unwrap();
        let conv = db.get_or_create_private(&pid("alice"), &pid("bob")).unwrap();

        let err = db.add_member(conv.id, &pid("carol")).unwrap_err();
        assert!(matches!(
            err,
            StoreError::Rejected(ChatError::NotGroupConversation)
        ));
        assert!(matches!(
            db.remove_member(conv.id, &pid("bob")).unwrap_err(),
            StoreError::Rejected(ChatError::NotGroupConversation)
        ));
    }

    #[test]
    fn unknown_conversation_is_not_found() {
        let db = Database::open_in_memory().unwrap();
        assert!(matches!(
            db.get_conversation(ConversationId::new()),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn lists_conversations_for_principal() {
        let mut db = Database::open_in_memory().unwrap();
        db.get_or_create_private(&pid("alice"), &pid("bob")).unwrap();
        db.insert_group(&group("alice", &["carol", "dave"])).unwrap();

        assert_eq!(db.list_conversations_for(&pid("alice")).unwrap().len(), 2);
        assert_eq!(db.list_conversations_for(&pid("carol")).unwrap().len(), 1);
        assert!(db.list_conversations_for(&pid("zed")).unwrap().is_empty());
    }
}
