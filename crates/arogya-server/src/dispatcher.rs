//! Delivery dispatcher: the single path from "principal P sends text T to
//! conversation C" to a persisted message and its fan-out.
//!
//! A per-conversation lock is held across append and fan-out, so every live
//! connection observes a conversation's messages in `seq` order. Joining
//! takes the same lock to read the catch-up marker and queue `joined`, which
//! closes the window between a history read and the first live push.

use std::sync::Arc;

use arogya_shared::protocol::ServerEvent;
use arogya_shared::{ChatError, ChatMessage, ConnectionId, ConversationId, PrincipalId};
use tracing::{debug, info};

use crate::error::ServerError;
use crate::locks::KeyedLocks;
use crate::message_store::MessageStore;
use crate::registry::{ConnectionRegistry, Push};
use crate::rooms::RoomMembershipStore;

#[derive(Clone)]
pub struct Dispatcher {
    rooms: RoomMembershipStore,
    messages: MessageStore,
    registry: ConnectionRegistry,
    ordering: Arc<KeyedLocks<ConversationId>>,
}

/// Result of a successful send.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: ChatMessage,
    /// Connections the `newMessage` event was queued on.
    pub recipients: usize,
}

impl Dispatcher {
    pub fn new(
        rooms: RoomMembershipStore,
        messages: MessageStore,
        registry: ConnectionRegistry,
    ) -> Self {
        Self {
            rooms,
            messages,
            registry,
            ordering: Arc::new(KeyedLocks::new()),
        }
    }

    /// Persist and fan out a message.
    ///
    /// `origin` is the sending connection, which is skipped; the sender's
    /// other joined connections still receive the message.
    pub async fn send(
        &self,
        origin: Option<ConnectionId>,
        sender: &PrincipalId,
        conversation_id: ConversationId,
        text: &str,
    ) -> Result<Delivery, ServerError> {
        if !self.rooms.is_member(conversation_id, sender).await? {
            return Err(ChatError::Forbidden(format!(
                "{sender} is not a participant in this conversation"
            ))
            .into());
        }

        let _order = self.ordering.lock(&conversation_id).await;

        let message = self.messages.append(conversation_id, sender, text).await?;
        self.rooms.note_activity(conversation_id, message.created_at);

        // Resolve members after the write so a concurrent removal is honoured.
        let conversation = self.rooms.get(conversation_id).await?;
        let event = ServerEvent::NewMessage {
            conversation_id,
            message: message.clone(),
        };

        let mut recipients = 0;
        for member in &conversation.participants {
            for connection in self.registry.joined_connections_for(member, conversation_id) {
                if Some(connection.id) == origin {
                    continue;
                }
                match connection.push(&self.registry, event.clone()) {
                    Push::Queued => recipients += 1,
                    Push::Lagging => {}
                    Push::Closed => {
                        debug!(connection = %connection.id, "Skipping closed connection");
                    }
                }
            }
        }

        info!(
            conversation = %conversation_id,
            sender = %sender,
            seq = message.seq,
            recipients,
            "Message delivered"
        );

        Ok(Delivery {
            message,
            recipients,
        })
    }

    /// Make `connection` live for `conversation_id`, queue `joined` on it and
    /// return the catch-up marker.
    ///
    /// Every message with `seq <= marker` is readable through history, and
    /// every later message is pushed to the connection after `joined`.
    pub async fn open_live(
        &self,
        connection: ConnectionId,
        conversation_id: ConversationId,
    ) -> Result<u64, ServerError> {
        let _order = self.ordering.lock(&conversation_id).await;

        let last_seq = self.messages.last_seq(conversation_id).await?;
        let handle = self.registry.bind(connection, conversation_id).ok_or_else(|| {
            ChatError::AuthRequired("connection is no longer registered".into())
        })?;

        let joined = ServerEvent::Joined {
            conversation_id,
            last_seq,
        };
        if handle.push(&self.registry, joined) != Push::Queued {
            debug!(connection = %connection, "Connection went away while joining");
        }

        Ok(last_seq)
    }

    pub fn prune_locks(&self) -> usize {
        self.ordering.prune()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use arogya_shared::ErrorCode;
    use arogya_store::Database;
    use tokio::sync::mpsc;

    use super::*;
    use crate::db::SharedDb;
    use crate::registry::OUTBOUND_QUEUE;

    fn pid(s: &str) -> PrincipalId {
        PrincipalId(s.to_string())
    }

    struct Fixture {
        dispatcher: Dispatcher,
        rooms: RoomMembershipStore,
        messages: MessageStore,
        registry: ConnectionRegistry,
    }

    fn fixture() -> Fixture {
        let db = SharedDb::new(Database::open_in_memory().unwrap());
        let rooms = RoomMembershipStore::new(db.clone());
        let messages = MessageStore::new(db, Duration::from_secs(5));
        let registry = ConnectionRegistry::new();
        Fixture {
            dispatcher: Dispatcher::new(rooms.clone(), messages.clone(), registry.clone()),
            rooms,
            messages,
            registry,
        }
    }

    impl Fixture {
        async fn live(
            &self,
            principal: &str,
            conversation: ConversationId,
        ) -> (ConnectionId, mpsc::Receiver<ServerEvent>) {
            let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
            let id = self.registry.register(&pid(principal), tx);
            self.dispatcher.open_live(id, conversation).await.unwrap();
            (id, rx)
        }
    }

    fn seqs(rx: &mut mpsc::Receiver<ServerEvent>) -> Vec<u64> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let ServerEvent::NewMessage { message, .. } = event {
                out.push(message.seq);
            }
        }
        out
    }

    #[tokio::test]
    async fn non_member_send_is_forbidden_and_silent() {
        let f = fixture();
        let conv = f.rooms.get_or_create_private(&pid("a"), &pid("b")).await.unwrap().id;
        let (_b, mut rx) = f.live("b", conv).await;

        let err = f.dispatcher.send(None, &pid("mallory"), conv, "hi").await.unwrap_err();
        assert_eq!(err.into_chat_error().code(), ErrorCode::Forbidden);
        assert_eq!(f.messages.last_seq(conv).await.unwrap(), 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn multi_device_sender_skips_origin_only() {
        let f = fixture();
        let conv = f.rooms.get_or_create_private(&pid("p"), &pid("q")).await.unwrap().id;
        let (phone, mut phone_rx) = f.live("p", conv).await;
        let (_laptop, mut laptop_rx) = f.live("p", conv).await;
        let (_q, mut q_rx) = f.live("q", conv).await;

        let delivery = f.dispatcher.send(Some(phone), &pid("p"), conv, "synced?").await.unwrap();
        assert_eq!(delivery.recipients, 2);
        assert!(seqs(&mut phone_rx).is_empty());
        assert_eq!(seqs(&mut laptop_rx), vec![1]);
        assert_eq!(seqs(&mut q_rx), vec![1]);
    }

    #[tokio::test]
    async fn offline_member_catches_up_from_history() {
        let f = fixture();
        let group = f
            .rooms
            .create_group(&pid("o"), "Care Circle", &[pid("u1"), pid("u2")])
            .await
            .unwrap();
        let (_u1, mut u1_rx) = f.live("u1", group.id).await;

        let delivery = f.dispatcher.send(None, &pid("o"), group.id, "session at 6").await.unwrap();
        assert_eq!(delivery.recipients, 1);
        assert_eq!(seqs(&mut u1_rx), vec![1]);

        // u2 comes online later and reads what it missed.
        let page = f.messages.list_since(group.id, 0, 50).await.unwrap();
        assert_eq!(page.messages.len(), 1);
        assert_eq!(page.messages[0].content, "session at 6");
        assert_eq!(page.messages[0].sender, pid("o"));
    }

    #[tokio::test]
    async fn removed_member_stops_receiving() {
        let f = fixture();
        let group = f
            .rooms
            .create_group(&pid("o"), "Diet plan", &[pid("u1"), pid("u2"), pid("u3")])
            .await
            .unwrap();
        let (_u3, mut u3_rx) = f.live("u3", group.id).await;

        f.rooms.remove_member(group.id, &pid("u3")).await.unwrap();
        f.dispatcher.send(None, &pid("o"), group.id, "after removal").await.unwrap();
        assert!(seqs(&mut u3_rx).is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_senders_are_seen_in_seq_order() {
        let f = fixture();
        let group = f
            .rooms
            .create_group(&pid("o"), "Morning walk", &[pid("u1"), pid("u2")])
            .await
            .unwrap();
        let (_watch, mut rx) = f.live("o", group.id).await;

        let mut tasks = Vec::new();
        for sender in ["u1", "u2"] {
            let dispatcher = f.dispatcher.clone();
            let id = group.id;
            tasks.push(tokio::spawn(async move {
                for i in 0..20 {
                    dispatcher
                        .send(None, &pid(sender), id, &format!("{sender}-{i}"))
                        .await
                        .unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let received = seqs(&mut rx);
        assert_eq!(received, (1..=40).collect::<Vec<_>>());

        let latest = f.messages.list_since(group.id, 39, 1).await.unwrap().messages;
        assert_eq!(f.rooms.get(group.id).await.unwrap().updated_at, latest[0].created_at);

        let history: Vec<u64> = f
            .messages
            .list_since(group.id, 0, 100)
            .await
            .unwrap()
            .messages
            .iter()
            .map(|m| m.seq)
            .collect();
        assert_eq!(history, received);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn join_during_concurrent_sends_leaves_no_gap() {
        let f = fixture();
        let group = f
            .rooms
            .create_group(&pid("o"), "Night shift", &[pid("u1"), pid("u2"), pid("late")])
            .await
            .unwrap();

        for i in 0..5 {
            f.dispatcher.send(None, &pid("o"), group.id, &format!("early {i}")).await.unwrap();
        }

        let mut senders = Vec::new();
        for sender in ["u1", "u2"] {
            let dispatcher = f.dispatcher.clone();
            let id = group.id;
            senders.push(tokio::spawn(async move {
                for i in 0..15 {
                    dispatcher
                        .send(None, &pid(sender), id, &format!("{sender}-{i}"))
                        .await
                        .unwrap();
                    tokio::task::yield_now().await;
                }
            }));
        }

        let (tx, mut rx) = mpsc::channel(OUTBOUND_QUEUE);
        let late = f.registry.register(&pid("late"), tx);
        let marker = f.dispatcher.open_live(late, group.id).await.unwrap();

        for task in senders {
            task.await.unwrap();
        }

        let mut seen: Vec<u64> = f
            .messages
            .list_since(group.id, 0, 1000)
            .await
            .unwrap()
            .messages
            .iter()
            .map(|m| m.seq)
            .filter(|seq| *seq <= marker)
            .collect();
        let live = seqs(&mut rx);
        assert!(live.iter().all(|seq| *seq > marker));
        seen.extend(live);

        assert_eq!(seen, (1..=35).collect::<Vec<_>>());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn joined_is_queued_before_any_live_message() {
        let f = fixture();
        let group = f
            .rooms
            .create_group(&pid("o"), "Rehab", &[pid("u1"), pid("late")])
            .await
            .unwrap();

        let dispatcher = f.dispatcher.clone();
        let id = group.id;
        let sender = tokio::spawn(async move {
            for i in 0..60 {
                dispatcher.send(None, &pid("u1"), id, &format!("m{i}")).await.unwrap();
                tokio::task::yield_now().await;
            }
        });

        let mut joins = Vec::new();
        for _ in 0..20 {
            let (tx, mut rx) = mpsc::channel(OUTBOUND_QUEUE);
            let connection = f.registry.register(&pid("late"), tx);
            let marker = f.dispatcher.open_live(connection, group.id).await.unwrap();
            joins.push((connection, marker, rx.try_recv().unwrap(), rx));
            tokio::task::yield_now().await;
        }
        sender.await.unwrap();

        for (connection, marker, first, mut rx) in joins {
            match first {
                ServerEvent::Joined { last_seq, .. } => assert_eq!(last_seq, marker),
                other => panic!("connection {connection} saw {other:?} before joined"),
            }
            assert!(seqs(&mut rx).iter().all(|seq| *seq > marker));
        }
    }

    #[tokio::test]
    async fn lagging_recipient_is_evicted_without_blocking_others() {
        let f = fixture();
        let conv = f.rooms.get_or_create_private(&pid("a"), &pid("b")).await.unwrap().id;

        // Room for `joined` plus one message, and nobody reading.
        let (tx, _stalled) = mpsc::channel(2);
        let slow = f.registry.register(&pid("b"), tx);
        f.dispatcher.open_live(slow, conv).await.unwrap();
        let (_fast, mut fast_rx) = f.live("a", conv).await;

        for i in 0..3 {
            f.dispatcher.send(None, &pid("a"), conv, &format!("m{i}")).await.unwrap();
        }

        assert!(!f.registry.is_online(&pid("b")));
        assert_eq!(seqs(&mut fast_rx), vec![1, 2, 3]);
        assert_eq!(f.messages.last_seq(conv).await.unwrap(), 3);
    }
}
