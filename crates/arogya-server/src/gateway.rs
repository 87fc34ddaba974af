//! Presence/session gateway.
//!
//! A [`Session`] is the per-connection state machine. It knows nothing about
//! sockets: the WebSocket actor feeds it text frames and forwards whatever it
//! queues on the outbound channel, and tests drive it directly.

use std::collections::HashSet;
use std::future;
use std::sync::Arc;

use arogya_shared::constants::{CLOSE_AUTH_REQUIRED, CLOSE_PROTOCOL_VIOLATION};
use arogya_shared::protocol::{ClientEvent, ServerEvent};
use arogya_shared::{ChatError, ConnectionId, ConversationId, PrincipalId};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::auth::TokenVerifier;
use crate::config::ServerConfig;
use crate::db::SharedDb;
use crate::dispatcher::Dispatcher;
use crate::error::ServerError;
use crate::message_store::MessageStore;
use crate::registry::{ConnectionRegistry, ConnectionSender};
use crate::rooms::RoomMembershipStore;

/// Every long-lived component, shared by the socket and HTTP layers.
#[derive(Clone)]
pub struct Gateway {
    pub verifier: Arc<TokenVerifier>,
    pub registry: ConnectionRegistry,
    pub rooms: RoomMembershipStore,
    pub messages: MessageStore,
    pub dispatcher: Dispatcher,
}

impl Gateway {
    pub fn new(db: SharedDb, config: &ServerConfig) -> Self {
        let verifier = Arc::new(TokenVerifier::new(config.auth_service_pubkey));
        let registry = ConnectionRegistry::new();
        let rooms = RoomMembershipStore::new(db.clone());
        let messages = MessageStore::new(db, config.persist_timeout);
        let dispatcher = Dispatcher::new(rooms.clone(), messages.clone(), registry.clone());

        Self {
            verifier,
            registry,
            rooms,
            messages,
            dispatcher,
        }
    }

    /// Start a session for a freshly accepted transport connection.
    pub fn session(&self, outbound: ConnectionSender) -> Session {
        Session {
            gateway: self.clone(),
            outbound,
            state: SessionState::Unauthenticated,
            evicted: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    Authenticated {
        principal: PrincipalId,
        connection_id: ConnectionId,
        joined: HashSet<ConversationId>,
    },
    Disconnected,
}

/// What the transport should do after an inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Continue,
    Close { code: u16, reason: &'static str },
}

impl Outcome {
    const PROTOCOL_VIOLATION: Outcome = Outcome::Close {
        code: CLOSE_PROTOCOL_VIOLATION,
        reason: "protocol violation",
    };
    const AUTH_FAILED: Outcome = Outcome::Close {
        code: CLOSE_AUTH_REQUIRED,
        reason: "authentication failed",
    };
}

pub struct Session {
    gateway: Gateway,
    outbound: ConnectionSender,
    state: SessionState,
    evicted: Option<Arc<Notify>>,
}

impl Session {
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn is_joined(&self, conversation_id: ConversationId) -> bool {
        match &self.state {
            SessionState::Authenticated { joined, .. } => joined.contains(&conversation_id),
            _ => false,
        }
    }

    /// Resolves once the registry drops this connection for falling behind.
    /// Never resolves before authentication.
    pub async fn evicted(&self) {
        match &self.evicted {
            Some(signal) => signal.notified().await,
            None => future::pending().await,
        }
    }

    /// Parse and handle one text frame.
    pub async fn handle_frame(&mut self, text: &str) -> Outcome {
        match ClientEvent::from_json(text) {
            Ok(event) => self.handle(event).await,
            Err(e) => {
                warn!(error = %e, "Malformed client frame");
                Outcome::PROTOCOL_VIOLATION
            }
        }
    }

    pub async fn handle(&mut self, event: ClientEvent) -> Outcome {
        debug!(event = event.name(), "Client event");

        let current = match &self.state {
            SessionState::Disconnected => return Outcome::PROTOCOL_VIOLATION,
            SessionState::Unauthenticated => None,
            SessionState::Authenticated {
                principal,
                connection_id,
                ..
            } => Some((principal.clone(), *connection_id)),
        };
        let Some((principal, connection_id)) = current else {
            return match event {
                ClientEvent::Authenticate { token } => self.authenticate(&token).await,
                _ => {
                    self.reply_error(&ChatError::AuthRequired(
                        "authenticate before using the connection".into(),
                    ));
                    Outcome::Continue
                }
            };
        };

        let result = match event {
            ClientEvent::Authenticate { .. } => {
                warn!(principal = %principal, "Repeated authenticate on a live session");
                return Outcome::PROTOCOL_VIOLATION;
            }
            ClientEvent::JoinConversation { conversation_id } => {
                self.join(&principal, connection_id, conversation_id).await
            }
            ClientEvent::JoinPrivate { other_principal_id } => {
                match self
                    .gateway
                    .rooms
                    .get_or_create_private(&principal, &other_principal_id)
                    .await
                {
                    Ok(conversation) => self.join(&principal, connection_id, conversation.id).await,
                    Err(e) => Err(e),
                }
            }
            ClientEvent::SendMessage {
                conversation_id,
                text,
            } => {
                if self.is_joined(conversation_id) {
                    self.gateway
                        .dispatcher
                        .send(Some(connection_id), &principal, conversation_id, &text)
                        .await
                        .map(|_| ())
                } else {
                    Err(ChatError::Forbidden("join the conversation before sending".into()).into())
                }
            }
        };

        if let Err(e) = result {
            let err = e.into_chat_error();
            if err.code().is_client_error() {
                debug!(principal = %principal, code = %err.code(), "Request rejected");
            } else {
                warn!(principal = %principal, error = %err, "Request failed");
            }
            self.reply_error(&err);
        }
        Outcome::Continue
    }

    /// Transport is gone. Idempotent.
    pub fn disconnect(&mut self) {
        let previous = std::mem::replace(&mut self.state, SessionState::Disconnected);
        if let SessionState::Authenticated {
            principal,
            connection_id,
            joined,
        } = previous
        {
            self.gateway.registry.unregister(connection_id);
            info!(
                principal = %principal,
                connection = %connection_id,
                rooms = joined.len(),
                "Session closed"
            );
        }
    }

    async fn authenticate(&mut self, token: &str) -> Outcome {
        match self.gateway.verifier.authenticate(token).await {
            Ok(principal) => {
                let connection_id = self
                    .gateway
                    .registry
                    .register(&principal, self.outbound.clone());
                self.evicted = self.gateway.registry.eviction_signal(connection_id);
                info!(principal = %principal, connection = %connection_id, "Session authenticated");

                self.reply(ServerEvent::Authenticated {
                    principal_id: principal.clone(),
                    connection_id,
                });
                self.state = SessionState::Authenticated {
                    principal,
                    connection_id,
                    joined: HashSet::new(),
                };
                Outcome::Continue
            }
            Err(e) => {
                warn!(error = %e, "Session authentication failed");
                self.reply_error(&e);
                Outcome::AUTH_FAILED
            }
        }
    }

    async fn join(
        &mut self,
        principal: &PrincipalId,
        connection_id: ConnectionId,
        conversation_id: ConversationId,
    ) -> Result<(), ServerError> {
        if !self.gateway.rooms.is_member(conversation_id, principal).await? {
            return Err(ChatError::Forbidden(format!(
                "{principal} is not a participant in this conversation"
            ))
            .into());
        }

        // `joined` is queued by the dispatcher ahead of any live message.
        let last_seq = self
            .gateway
            .dispatcher
            .open_live(connection_id, conversation_id)
            .await?;

        if let SessionState::Authenticated { joined, .. } = &mut self.state {
            joined.insert(conversation_id);
        }
        info!(
            principal = %principal,
            conversation = %conversation_id,
            last_seq,
            "Joined conversation"
        );
        Ok(())
    }

    fn reply(&self, event: ServerEvent) {
        // A closed queue means the writer already exited; a full one means
        // the connection is being evicted. Either way the transport closes next.
        if self.outbound.try_send(event).is_err() {
            debug!("Dropped reply on an unavailable outbound queue");
        }
    }

    fn reply_error(&self, err: &ChatError) {
        self.reply(ServerEvent::error(err));
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.disconnect();
    }
}
