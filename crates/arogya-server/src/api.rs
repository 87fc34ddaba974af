use std::sync::Arc;

use arogya_shared::constants::DEFAULT_HISTORY_PAGE;
use arogya_shared::{ChatError, Conversation, ConversationId, PrincipalId};
use axum::{
    extract::{FromRequestParts, Path, Query, State},
    http::{request::Parts, Method, StatusCode},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::gateway::Gateway;
use crate::message_store::MessagePage;
use crate::ws::ws_upgrade;

#[derive(Clone)]
pub struct AppState {
    pub gateway: Gateway,
    pub config: Arc<ServerConfig>,
}

/// The principal behind the request's bearer token.
pub struct Caller(pub PrincipalId);

impl FromRequestParts<AppState> for Caller {
    type Rejection = ServerError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let principal = state
            .gateway
            .verifier
            .authenticate_headers(&parts.headers)
            .await?;
        Ok(Caller(principal))
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/info", get(server_info))
        .route("/ws", get(ws_upgrade))
        .route("/conversations", get(list_conversations))
        .route("/conversations/private", post(open_private))
        .route("/conversations/group", post(create_group))
        .route("/conversations/{id}", get(get_conversation))
        .route("/conversations/{id}/members", post(add_member))
        .route("/conversations/{id}/members/{principal_id}", delete(remove_member))
        .route("/conversations/{id}/messages", get(list_messages))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ServerInfoResponse {
    name: String,
    version: &'static str,
    online_principals: usize,
    connections: usize,
    history_page_limit: u32,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PrivateRequest {
    other_principal_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GroupRequest {
    name: String,
    participant_ids: Vec<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MemberRequest {
    principal_id: String,
}

#[derive(Deserialize)]
struct HistoryQuery {
    after: Option<u64>,
    limit: Option<u32>,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn server_info(State(state): State<AppState>) -> Json<ServerInfoResponse> {
    let registry = &state.gateway.registry;
    Json(ServerInfoResponse {
        name: state.config.instance_name.clone(),
        version: env!("CARGO_PKG_VERSION"),
        online_principals: registry.snapshot().len(),
        connections: registry.connection_count(),
        history_page_limit: state.config.history_page_limit,
    })
}

async fn list_conversations(
    State(state): State<AppState>,
    Caller(caller): Caller,
) -> Result<Json<Vec<Conversation>>, ServerError> {
    Ok(Json(state.gateway.rooms.list_for(&caller).await?))
}

async fn open_private(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Json(req): Json<PrivateRequest>,
) -> Result<Json<Conversation>, ServerError> {
    let other = PrincipalId::parse(&req.other_principal_id)?;
    let conversation = state.gateway.rooms.get_or_create_private(&caller, &other).await?;
    Ok(Json(conversation.as_ref().clone()))
}

async fn create_group(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Json(req): Json<GroupRequest>,
) -> Result<(StatusCode, Json<Conversation>), ServerError> {
    let participants = req
        .participant_ids
        .iter()
        .map(|raw| PrincipalId::parse(raw))
        .collect::<Result<Vec<_>, _>>()?;

    let conversation = state
        .gateway
        .rooms
        .create_group(&caller, &req.name, &participants)
        .await?;
    Ok((StatusCode::CREATED, Json(conversation.as_ref().clone())))
}

/// Load a conversation the caller takes part in.
async fn member_view(
    state: &AppState,
    caller: &PrincipalId,
    id: ConversationId,
) -> Result<Arc<Conversation>, ServerError> {
    let conversation = state.gateway.rooms.get(id).await?;
    if !conversation.is_member(caller) {
        return Err(ChatError::Forbidden(format!("{caller} is not a participant")).into());
    }
    Ok(conversation)
}

/// Membership changes are reserved for the group's owner.
async fn owner_view(
    state: &AppState,
    caller: &PrincipalId,
    id: ConversationId,
) -> Result<Arc<Conversation>, ServerError> {
    let conversation = member_view(state, caller, id).await?;
    if !conversation.is_group() {
        return Err(ChatError::NotGroupConversation.into());
    }
    if conversation.owner.as_ref() != Some(caller) {
        return Err(ChatError::Forbidden("only the group owner can change members".into()).into());
    }
    Ok(conversation)
}

async fn get_conversation(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(id): Path<ConversationId>,
) -> Result<Json<Conversation>, ServerError> {
    let conversation = member_view(&state, &caller, id).await?;
    Ok(Json(conversation.as_ref().clone()))
}

async fn add_member(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(id): Path<ConversationId>,
    Json(req): Json<MemberRequest>,
) -> Result<Json<Conversation>, ServerError> {
    owner_view(&state, &caller, id).await?;
    let principal = PrincipalId::parse(&req.principal_id)?;

    let conversation = state.gateway.rooms.add_member(id, &principal).await?;
    info!(conversation = %id, by = %caller, principal = %principal, "Member added via API");
    Ok(Json(conversation.as_ref().clone()))
}

async fn remove_member(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path((id, principal_id)): Path<(ConversationId, String)>,
) -> Result<Json<Conversation>, ServerError> {
    owner_view(&state, &caller, id).await?;
    let principal = PrincipalId::parse(&principal_id)?;

    let conversation = state.gateway.rooms.remove_member(id, &principal).await?;
    info!(conversation = %id, by = %caller, principal = %principal, "Member removed via API");
    Ok(Json(conversation.as_ref().clone()))
}

async fn list_messages(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(id): Path<ConversationId>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<MessagePage>, ServerError> {
    member_view(&state, &caller, id).await?;

    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_PAGE)
        .clamp(1, state.config.history_page_limit);
    let page = state
        .gateway
        .messages
        .list_since(id, query.after.unwrap_or(0), limit)
        .await?;
    Ok(Json(page))
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
