//! Append-only, ordered message log per conversation.

use std::time::{Duration, Instant};

use arogya_shared::{ChatMessage, ConversationId, PrincipalId};
use futures::stream::{self, Stream};
use serde::Serialize;

use crate::db::SharedDb;
use crate::error::ServerError;

/// One page of history, oldest first.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePage {
    pub messages: Vec<ChatMessage>,
    /// Pass as `after` to fetch the next page; `None` once caught up.
    pub next_cursor: Option<u64>,
}

#[derive(Clone)]
pub struct MessageStore {
    db: SharedDb,
    persist_timeout: Duration,
}

impl MessageStore {
    pub fn new(db: SharedDb, persist_timeout: Duration) -> Self {
        Self {
            db,
            persist_timeout,
        }
    }

    /// Persist a message. Fails with `NotAMember`, `EmptyContent`, or
    /// `DeliveryFailed` when the write could not start in time.
    pub async fn append(
        &self,
        conversation_id: ConversationId,
        sender: &PrincipalId,
        content: &str,
    ) -> Result<ChatMessage, ServerError> {
        let deadline = Instant::now() + self.persist_timeout;
        let sender = sender.clone();
        let content = content.to_string();

        self.db
            .call_before(deadline, move |db| {
                db.append_message(conversation_id, &sender, &content)
            })
            .await
    }

    pub async fn list_since(
        &self,
        conversation_id: ConversationId,
        after_seq: u64,
        limit: u32,
    ) -> Result<MessagePage, ServerError> {
        let limit = limit.max(1);
        let messages = self
            .db
            .call(move |db| db.list_messages_since(conversation_id, after_seq, limit))
            .await?;

        let next_cursor = if messages.len() == limit as usize {
            messages.last().map(|m| m.seq)
        } else {
            None
        };

        Ok(MessagePage {
            messages,
            next_cursor,
        })
    }

    pub async fn last_seq(&self, conversation_id: ConversationId) -> Result<u64, ServerError> {
        self.db.call(move |db| db.last_seq(conversation_id)).await
    }

    /// Lazily walk the log after `after_seq`, one page per item. Ends after
    /// the first short page; restart from any seen `seq` to resume.
    pub fn history(
        &self,
        conversation_id: ConversationId,
        after_seq: u64,
        page_size: u32,
    ) -> impl Stream<Item = Result<Vec<ChatMessage>, ServerError>> + Send + 'static {
        let store = self.clone();
        stream::unfold(Some(after_seq), move |cursor| {
            let store = store.clone();
            async move {
                let after = cursor?;
                match store.list_since(conversation_id, after, page_size).await {
                    Ok(page) if page.messages.is_empty() => None,
                    Ok(page) => Some((Ok(page.messages), page.next_cursor)),
                    Err(e) => Some((Err(e), None)),
                }
            }
        })
    }
}
