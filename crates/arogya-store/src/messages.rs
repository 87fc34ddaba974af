use arogya_shared::{ChatError, ChatMessage, ConversationId, PrincipalId};
use chrono::Utc;
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use uuid::Uuid;

use crate::conversations::{parse_conversation_id, parse_timestamp};
use crate::database::Database;
use crate::error::{Result, StoreError};

const MESSAGE_COLUMNS: &str = "id, conversation_id, seq, sender, content, created_at";

impl Database {
    /// Append a message to a conversation's log.
    ///
    /// Membership and the next sequence number are read inside the same
    /// immediate transaction as the insert, so concurrent appends to one
    /// conversation are serialized and `seq` never repeats or goes backwards.
    pub fn append_message(
        &mut self,
        conversation_id: ConversationId,
        sender: &PrincipalId,
        content: &str,
    ) -> Result<ChatMessage> {
        if content.trim().is_empty() {
            return Err(ChatError::EmptyContent.into());
        }

        let tx = self
            .conn_mut()
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let is_member = tx
            .query_row(
                "SELECT 1 FROM conversation_members
                 WHERE conversation_id = ?1 AND principal_id = ?2",
                params![conversation_id.0.to_string(), sender.as_str()],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if !is_member {
            return Err(ChatError::NotAMember.into());
        }

        let seq: i64 = tx.query_row(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM messages WHERE conversation_id = ?1",
            params![conversation_id.0.to_string()],
            |row| row.get(0),
        )?;

        let message = ChatMessage {
            id: Uuid::new_v4(),
            conversation_id,
            seq: seq as u64,
            sender: sender.clone(),
            content: content.to_string(),
            created_at: Utc::now(),
        };

        tx.execute(
            "INSERT INTO messages (id, conversation_id, seq, sender, content, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                message.id.to_string(),
                conversation_id.0.to_string(),
                seq,
                message.sender.as_str(),
                message.content,
                message.created_at.to_rfc3339(),
            ],
        )?;
        tx.execute(
            "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
            params![message.created_at.to_rfc3339(), conversation_id.0.to_string()],
        )?;

        tx.commit()?;
        Ok(message)
    }

    /// Up to `limit` messages with `seq > after_seq`, oldest first.
    pub fn list_messages_since(
        &self,
        conversation_id: ConversationId,
        after_seq: u64,
        limit: u32,
    ) -> Result<Vec<ChatMessage>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {MESSAGE_COLUMNS}
             FROM messages
             WHERE conversation_id = ?1 AND seq > ?2
             ORDER BY seq ASC
             LIMIT ?3"
        ))?;

        // SQLite integers are signed; a cursor past i64::MAX has nothing after it.
        let after_seq = i64::try_from(after_seq).unwrap_or(i64::MAX);
        let rows = stmt.query_map(
            params![conversation_id.0.to_string(), after_seq, limit],
            read_message_row,
        )?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?.into_message()?);
        }
        Ok(messages)
    }

    /// Highest sequence number in the conversation (0 when empty).
    pub fn last_seq(&self, conversation_id: ConversationId) -> Result<u64> {
        let seq: i64 = self.conn().query_row(
            "SELECT COALESCE(MAX(seq), 0) FROM messages WHERE conversation_id = ?1",
            params![conversation_id.0.to_string()],
            |row| row.get(0),
        )?;
        Ok(seq as u64)
    }
}

struct MessageRow {
    id: String,
    conversation_id: String,
    seq: i64,
    sender: String,
    content: String,
    created_at: String,
}

fn read_message_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        seq: row.get(2)?,
        sender: row.get(3)?,
        content: row.get(4)?,
        created_at: row.get(5)?,
    })
}

impl MessageRow {
    fn into_message(self) -> Result<ChatMessage> {
        let id = Uuid::parse_str(&self.id)
            .map_err(|e| StoreError::Corrupt(format!("message id {:?}: {e}", self.id)))?;

        Ok(ChatMessage {
            id,
            conversation_id: parse_conversation_id(&self.conversation_id)?,
            seq: self.seq as u64,
            sender: PrincipalId(self.sender),
            content: self.content,
            created_at: parse_timestamp(&self.created_at)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(s: &str) -> PrincipalId {
        PrincipalId(s.to_string())
    }

    fn private_chat(db: &mut Database) -> ConversationId {
        db.get_or_create_private(&pid("alice"), &pid("bob")).unwrap().id
    }

    #[test]
    fn append_assigns_increasing_seq() {
        let mut db = Database::open_in_memory().unwrap();
        let conv = private_chat(&mut db);

        let m1 = db.append_message(conv, &pid("alice"), "hello").unwrap();
        let m2 = db.append_message(conv, &pid("bob"), "hi there").unwrap();
        let m3 = db.append_message(conv, &pid("alice"), "how are you").unwrap();

        assert_eq!((m1.seq, m2.seq, m3.seq), (1, 2, 3));
        assert_eq!(db.last_seq(conv).unwrap(), 3);

        let listed = db.list_messages_since(conv, 1, 1).unwrap();
        assert_eq!(listed, vec![m2]);
    }

    #[test]
    fn sequences_are_per_conversation() {
        let mut db = Database::open_in_memory().unwrap();
        let first = private_chat(&mut db);
        let second = db.get_or_create_private(&pid("alice"), &pid("carol")).unwrap().id;

        db.append_message(first, &pid("alice"), "one").unwrap();
        db.append_message(first, &pid("alice"), "two").unwrap();
        let other = db.append_message(second, &pid("carol"), "first here").unwrap();

        assert_eq!(other.seq, 1);
    }

    #[test]
    fn append_rejects_blank_and_non_member() {
        let mut db = Database::open_in_memory().unwrap();
        let conv = private_chat(&mut db);

        assert!(matches!(
            db.append_message(conv, &pid("alice"), "   \n\t"),
            Err(StoreError::Rejected(ChatError::EmptyContent))
        ));
        assert!(matches!(
            db.append_message(conv, &pid("mallory"), "let me in"),
            Err(StoreError::Rejected(ChatError::NotAMember))
        ));
        assert_eq!(db.last_seq(conv).unwrap(), 0);
    }

    #[test]
    fn list_since_pages_oldest_first() {
        let mut db = Database::open_in_memory().unwrap();
        let conv = private_chat(&mut db);
        for i in 0..5 {
            db.append_message(conv, &pid("alice"), &format!("msg {i}")).unwrap();
        }

        let page = db.list_messages_since(conv, 0, 2).unwrap();
        assert_eq!(page.iter().map(|m| m.seq).collect::<Vec<_>>(), vec![1, 2]);

        let page = db.list_messages_since(conv, 2, 10).unwrap();
        assert_eq!(page.iter().map(|m| m.seq).collect::<Vec<_>>(), vec![3, 4, 5]);
        assert_eq!(page[0].content, "msg 2");

        assert!(db.list_messages_since(conv, 5, 10).unwrap().is_empty());
    }

    #[test]
    fn cursor_beyond_signed_range_is_empty() {
        let mut db = Database::open_in_memory().unwrap();
        let conv = private_chat(&mut db);
        db.append_message(conv, &pid("alice"), "only one").unwrap();

        assert!(db.list_messages_since(conv, u64::MAX, 10).unwrap().is_empty());
        assert!(db.list_messages_since(conv, i64::MAX as u64 + 1, 10).unwrap().is_empty());
        assert_eq!(db.list_messages_since(conv, 0, 10).unwrap().len(), 1);
    }
}
