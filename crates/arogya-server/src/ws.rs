//! WebSocket transport for the session gateway.
//!
//! Each socket gets a reader loop (this task), a writer task that owns the
//! sink, and a ping task. Everything the rest of the server wants to say to
//! the client goes through the session's outbound queue.

use std::sync::Arc;
use std::time::Duration;

use arogya_shared::constants::{
    CLOSE_IDLE_TIMEOUT, CLOSE_PROTOCOL_VIOLATION, CLOSE_SLOW_CONSUMER, MAX_MESSAGE_SIZE,
};
use arogya_shared::protocol::ServerEvent;
use axum::body::Bytes;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{interval, timeout};
use tracing::{debug, info, warn};

use crate::api::AppState;
use crate::config::ServerConfig;
use crate::gateway::{Gateway, Outcome};
use crate::registry::OUTBOUND_QUEUE;

/// How long the writer gets to flush queued events once the session ends.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// `GET /ws`. Authentication happens in-band with the `authenticate` event.
pub async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let gateway = state.gateway.clone();
    let config = state.config.clone();
    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| run_connection(socket, gateway, config))
}

pub async fn run_connection(socket: WebSocket, gateway: Gateway, config: Arc<ServerConfig>) {
    let (sink, mut stream) = socket.split();
    let (events_tx, events_rx) = mpsc::channel::<ServerEvent>(OUTBOUND_QUEUE);
    let (control_tx, control_rx) = mpsc::channel::<Message>(4);

    let mut session = gateway.session(events_tx);
    let mut writer = tokio::spawn(writer_task(sink, events_rx, control_rx));

    let heartbeat = config.heartbeat_interval;
    let pinger = tokio::spawn(async move {
        let mut ticker = interval(heartbeat);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if control_tx.send(Message::Ping(Bytes::new())).await.is_err() {
                break;
            }
        }
    });

    debug!("WebSocket connection opened");

    let close = loop {
        let next = tokio::select! {
            _ = session.evicted() => {
                warn!(state = ?session.state(), "Outbound queue overflowed, disconnecting");
                break Some((CLOSE_SLOW_CONSUMER, "too slow to keep up"));
            }
            next = timeout(config.idle_timeout, stream.next()) => next,
        };

        let frame = match next {
            Err(_) => {
                info!(state = ?session.state(), "Idle timeout, disconnecting");
                break Some((CLOSE_IDLE_TIMEOUT, "idle timeout"));
            }
            Ok(None) => break None,
            Ok(Some(Err(e))) => {
                debug!(error = %e, "WebSocket receive error");
                break None;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        match frame {
            Message::Text(text) => match session.handle_frame(text.as_str()).await {
                Outcome::Continue => {}
                Outcome::Close { code, reason } => break Some((code, reason)),
            },
            Message::Binary(_) => {
                warn!("Binary frame on a text protocol");
                break Some((CLOSE_PROTOCOL_VIOLATION, "binary frames are not supported"));
            }
            // Pongs only need to reset the idle timer; pings are answered by axum.
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Close(_) => break None,
        }
    };

    pinger.abort();
    session.disconnect();
    drop(session);

    // Once the session is gone the outbound queue closes, so the writer drains
    // what is left and hands the sink back for the close frame.
    let sink = match timeout(FLUSH_TIMEOUT, &mut writer).await {
        Ok(Ok(sink)) => sink,
        _ => {
            writer.abort();
            None
        }
    };

    if let (Some(mut sink), Some((code, reason))) = (sink, close) {
        let frame = CloseFrame {
            code,
            reason: reason.into(),
        };
        if sink.send(Message::Close(Some(frame))).await.is_err() {
            debug!(code, "Peer went away before the close frame");
        }
    }

    debug!("WebSocket connection closed");
}

async fn writer_task(
    mut sink: SplitSink<WebSocket, Message>,
    mut events: mpsc::Receiver<ServerEvent>,
    mut control: mpsc::Receiver<Message>,
) -> Option<SplitSink<WebSocket, Message>> {
    loop {
        let message = tokio::select! {
            biased;
            event = events.recv() => {
                let Some(event) = event else { break };
                match event.to_json() {
                    Ok(json) => Message::Text(json.into()),
                    Err(e) => {
                        warn!(error = %e, "Failed to encode server event");
                        continue;
                    }
                }
            }
            Some(message) = control.recv() => message,
        };

        if sink.send(message).await.is_err() {
            return None;
        }
    }
    Some(sink)
}

#[cfg(test)]
mod tests {
    use arogya_shared::protocol::ClientEvent;
    use arogya_shared::{ConnectionId, ErrorCode, PrincipalId};
    use arogya_store::Database;
    use tokio::net::{TcpListener, TcpStream};
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    use super::*;
    use crate::api::build_router;
    use crate::auth::test_support::TestIssuer;
    use crate::db::SharedDb;

    type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

    struct TestServer {
        url: String,
        issuer: TestIssuer,
        gateway: Gateway,
    }

    async fn start(idle_timeout: Duration) -> TestServer {
        let issuer = TestIssuer::new();
        let config = ServerConfig {
            auth_service_pubkey: issuer.pubkey(),
            idle_timeout,
            heartbeat_interval: Duration::from_secs(60),
            ..ServerConfig::default()
        };
        let gateway = Gateway::new(SharedDb::new(Database::open_in_memory().unwrap()), &config);
        let state = AppState {
            gateway: gateway.clone(),
            config: Arc::new(config),
        };

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, build_router(state)).await.unwrap();
        });

        TestServer {
            url: format!("ws://{addr}/ws"),
            issuer,
            gateway,
        }
    }

    async fn connect(server: &TestServer) -> Socket {
        let (socket, _) = connect_async(server.url.as_str()).await.expect("Failed to connect");
        socket
    }

    async fn send(socket: &mut Socket, event: &ClientEvent) {
        let json = serde_json::to_string(event).unwrap();
        socket.send(WsMessage::text(json)).await.unwrap();
    }

    /// Next server event, skipping control frames.
    async fn next_event(socket: &mut Socket) -> ServerEvent {
        loop {
            match timeout(Duration::from_secs(2), socket.next()).await {
                Ok(Some(Ok(WsMessage::Text(text)))) => {
                    return serde_json::from_str(text.as_str()).unwrap();
                }
                Ok(Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_)))) => {}
                other => panic!("expected an event, got {other:?}"),
            }
        }
    }

    /// Read until the server closes, returning the events before the close
    /// frame and its code.
    async fn close_code(socket: &mut Socket) -> (Vec<ServerEvent>, Option<u16>) {
        let mut events = Vec::new();
        loop {
            match timeout(Duration::from_secs(3), socket.next()).await {
                Ok(Some(Ok(WsMessage::Text(text)))) => {
                    events.push(serde_json::from_str(text.as_str()).unwrap());
                }
                Ok(Some(Ok(WsMessage::Close(frame)))) => {
                    return (events, frame.map(|f| u16::from(f.code)));
                }
                Ok(Some(Ok(_))) => {}
                _ => return (events, None),
            }
        }
    }

    async fn login(server: &TestServer, principal: &str) -> (Socket, ConnectionId) {
        let mut socket = connect(server).await;
        let token = server.issuer.token_for(principal);
        send(&mut socket, &ClientEvent::Authenticate { token }).await;
        match next_event(&mut socket).await {
            ServerEvent::Authenticated { connection_id, .. } => (socket, connection_id),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn silent_client_is_closed_as_idle() {
        let server = start(Duration::from_millis(300)).await;
        let mut socket = connect(&server).await;

        let (events, code) = close_code(&mut socket).await;
        assert!(events.is_empty());
        assert_eq!(code, Some(CLOSE_IDLE_TIMEOUT));
    }

    #[tokio::test]
    async fn binary_frame_is_a_protocol_violation() {
        let server = start(Duration::from_secs(5)).await;
        let mut socket = connect(&server).await;

        socket.send(WsMessage::binary(vec![1u8, 2, 3])).await.unwrap();
        let (_, code) = close_code(&mut socket).await;
        assert_eq!(code, Some(CLOSE_PROTOCOL_VIOLATION));
    }

    #[tokio::test]
    async fn malformed_json_is_a_protocol_violation() {
        let server = start(Duration::from_secs(5)).await;
        let mut socket = connect(&server).await;

        socket.send(WsMessage::text("{\"event\":\"typing\"}")).await.unwrap();
        let (_, code) = close_code(&mut socket).await;
        assert_eq!(code, Some(CLOSE_PROTOCOL_VIOLATION));
    }

    #[tokio::test]
    async fn bad_token_reports_error_before_closing() {
        let server = start(Duration::from_secs(5)).await;
        let forger = TestIssuer::new();
        let mut socket = connect(&server).await;

        let token = forger.token_for("alice");
        send(&mut socket, &ClientEvent::Authenticate { token }).await;
        let (events, code) = close_code(&mut socket).await;

        assert!(matches!(
            events.as_slice(),
            [ServerEvent::Error { code: ErrorCode::AuthRequired, .. }]
        ));
        assert_eq!(code, Some(arogya_shared::constants::CLOSE_AUTH_REQUIRED));
    }

    #[tokio::test]
    async fn private_message_crosses_sockets() {
        let server = start(Duration::from_secs(5)).await;
        let (mut alice, _) = login(&server, "alice").await;
        let (mut bob, _) = login(&server, "bob").await;

        send(
            &mut alice,
            &ClientEvent::JoinPrivate {
                other_principal_id: PrincipalId("bob".into()),
            },
        )
        .await;
        let conversation_id = match next_event(&mut alice).await {
            ServerEvent::Joined {
                conversation_id, ..
            } => conversation_id,
            other => panic!("unexpected {other:?}"),
        };
        send(&mut bob, &ClientEvent::JoinConversation { conversation_id }).await;
        assert!(matches!(next_event(&mut bob).await, ServerEvent::Joined { .. }));

        let text = "see you at 5".to_string();
        send(&mut alice, &ClientEvent::SendMessage { conversation_id, text }).await;
        match next_event(&mut bob).await {
            ServerEvent::NewMessage { message, .. } => {
                assert_eq!(message.seq, 1);
                assert_eq!(message.content, "see you at 5");
            }
            other => panic!("unexpected {other:?}"),
        }

        alice.close(None).await.unwrap();
        let _ = close_code(&mut alice).await;
        timeout(Duration::from_secs(2), async {
            while server.gateway.registry.is_online(&PrincipalId("alice".into())) {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("closed socket should leave the registry");
    }

    #[tokio::test]
    async fn evicted_connection_is_closed_as_slow() {
        let server = start(Duration::from_secs(5)).await;
        let (mut socket, connection_id) = login(&server, "alice").await;

        assert!(server.gateway.registry.evict(connection_id));
        let (_, code) = close_code(&mut socket).await;
        assert_eq!(code, Some(CLOSE_SLOW_CONSUMER));
    }
}
