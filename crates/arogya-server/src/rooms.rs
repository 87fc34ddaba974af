//! Room membership: the authoritative participant set of every conversation
//! and canonical room ids for 1:1 chats.
//!
//! Reads are served from a write-through cache; every mutation goes to the
//! database first under a per-conversation lock and then refreshes the
//! cached copy. Entries nobody has read for a while are evicted by the
//! housekeeping task and reloaded on demand.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arogya_shared::constants::{MAX_GROUP_NAME_LEN, MIN_GROUP_MEMBERS};
use arogya_shared::{
    ChatError, Conversation, ConversationId, ConversationKind, PrincipalId, RoomId,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::info;

use crate::db::SharedDb;
use crate::error::ServerError;
use crate::locks::KeyedLocks;

/// Normalize both ids of a 1:1 chat and derive its room key, in either order.
pub fn canonical_private_room_id(
    a: &PrincipalId,
    b: &PrincipalId,
) -> Result<(RoomId, PrincipalId, PrincipalId), ChatError> {
    let a = PrincipalId::parse(a.as_str())?;
    let b = PrincipalId::parse(b.as_str())?;
    let room = RoomId::canonical_private(&a, &b)?;
    Ok((room, a, b))
}

/// Check a new group's shape and return its sorted participant set
/// (owner included).
pub fn validate_group(
    owner: &PrincipalId,
    name: &str,
    participant_ids: &[PrincipalId],
) -> Result<(String, Vec<PrincipalId>), ChatError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ChatError::InvalidGroup("group name is required".into()));
    }
    if name.chars().count() > MAX_GROUP_NAME_LEN {
        return Err(ChatError::InvalidGroup(format!(
            "group name exceeds {MAX_GROUP_NAME_LEN} characters"
        )));
    }

    let mut seen = HashSet::new();
    seen.insert(owner.clone());
    for id in participant_ids {
        let id = PrincipalId::parse(id.as_str())?;
        if !seen.insert(id.clone()) {
            return Err(ChatError::DuplicateMember(id.to_string()));
        }
    }

    let others = seen.len() - 1;
    if others < MIN_GROUP_MEMBERS {
        return Err(ChatError::InvalidGroup(format!(
            "a group needs at least {MIN_GROUP_MEMBERS} members besides the owner, got {others}"
        )));
    }

    let mut participants: Vec<PrincipalId> = seen.into_iter().collect();
    participants.sort();
    Ok((name.to_string(), participants))
}

struct CacheEntry {
    conversation: Arc<Conversation>,
    touched: Instant,
}

#[derive(Clone)]
pub struct RoomMembershipStore {
    db: SharedDb,
    cache: Arc<DashMap<ConversationId, CacheEntry>>,
    locks: Arc<KeyedLocks<ConversationId>>,
}

impl RoomMembershipStore {
    pub fn new(db: SharedDb) -> Self {
        Self {
            db,
            cache: Arc::new(DashMap::new()),
            locks: Arc::new(KeyedLocks::new()),
        }
    }

    pub async fn get_or_create_private(
        &self,
        a: &PrincipalId,
        b: &PrincipalId,
    ) -> Result<Arc<Conversation>, ServerError> {
        let (room, a, b) = canonical_private_room_id(a, b)?;
        let id = ConversationId::for_room(&room);

        if let Some(conversation) = self.cached(id) {
            return Ok(conversation);
        }

        let _guard = self.locks.lock(&id).await;
        let conversation = self
            .db
            .call(move |db| db.get_or_create_private(&a, &b))
            .await?;

        Ok(self.remember(conversation))
    }

    pub async fn create_group(
        &self,
        owner: &PrincipalId,
        name: &str,
        participant_ids: &[PrincipalId],
    ) -> Result<Arc<Conversation>, ServerError> {
        let (name, participants) = validate_group(owner, name, participant_ids)?;
        let now = Utc::now();
        let conversation = Conversation {
            id: ConversationId::new(),
            kind: ConversationKind::Group,
            participants,
            name: Some(name),
            owner: Some(owner.clone()),
            created_at: now,
            updated_at: now,
        };

        let row = conversation.clone();
        self.db.call(move |db| db.insert_group(&row)).await?;

        info!(
            conversation = %conversation.id,
            owner = %owner,
            members = conversation.participants.len(),
            "Created group conversation"
        );
        Ok(self.remember(conversation))
    }

    /// Current conversation record, loading it into the cache on first use.
    pub async fn get(&self, id: ConversationId) -> Result<Arc<Conversation>, ServerError> {
        if let Some(conversation) = self.cached(id) {
            return Ok(conversation);
        }

        let _guard = self.locks.lock(&id).await;
        if let Some(conversation) = self.cached(id) {
            return Ok(conversation);
        }

        let conversation = self
            .db
            .call(move |db| db.get_conversation(id))
            .await
            .map_err(|e| match e {
                ServerError::NotFound(_) => ServerError::NotFound(format!("conversation {id}")),
                other => other,
            })?;
        Ok(self.remember(conversation))
    }

    pub async fn is_member(
        &self,
        id: ConversationId,
        principal: &PrincipalId,
    ) -> Result<bool, ServerError> {
        Ok(self.get(id).await?.is_member(principal))
    }

    pub async fn add_member(
        &self,
        id: ConversationId,
        principal: &PrincipalId,
    ) -> Result<Arc<Conversation>, ServerError> {
        let principal = &PrincipalId::parse(principal.as_str())?;
        let current = self.get(id).await?;
        if !current.is_group() {
            return Err(ChatError::NotGroupConversation.into());
        }
        if current.is_member(principal) {
            return Err(ChatError::DuplicateMember(principal.to_string()).into());
        }

        let _guard = self.locks.lock(&id).await;
        let who = principal.clone();
        let conversation = self
            .db
            .call(move |db| {
                if !db.add_member(id, &who)? {
                    return Err(ChatError::DuplicateMember(who.to_string()).into());
                }
                db.get_conversation(id)
            })
            .await?;

        info!(conversation = %id, principal = %principal, "Member added");
        Ok(self.remember(conversation))
    }

    /// Remove a participant. The owner cannot leave their own group, and a
    /// group never shrinks below the owner plus one member.
    pub async fn remove_member(
        &self,
        id: ConversationId,
        principal: &PrincipalId,
    ) -> Result<Arc<Conversation>, ServerError> {
        let principal = &PrincipalId::parse(principal.as_str())?;
        let current = self.get(id).await?;
        if !current.is_group() {
            return Err(ChatError::NotGroupConversation.into());
        }
        if current.owner.as_ref() == Some(principal) {
            return Err(ChatError::InvalidGroup("the owner cannot be removed".into()).into());
        }
        if !current.is_member(principal) {
            return Err(ChatError::NotAMember.into());
        }

        let _guard = self.locks.lock(&id).await;
        let who = principal.clone();
        let conversation = self
            .db
            .call(move |db| {
                if db.list_members(id)?.len() <= 2 {
                    return Err(ChatError::InvalidGroup(
                        "a group needs at least two participants".into(),
                    )
                    .into());
                }
                if !db.remove_member(id, &who)? {
                    return Err(ChatError::NotAMember.into());
                }
                db.get_conversation(id)
            })
            .await?;

        info!(conversation = %id, principal = %principal, "Member removed");
        Ok(self.remember(conversation))
    }

    pub async fn list_for(
        &self,
        principal: &PrincipalId,
    ) -> Result<Vec<Conversation>, ServerError> {
        let who = principal.clone();
        self.db.call(move |db| db.list_conversations_for(&who)).await
    }

    /// Bump the cached `updated_at` after a message lands. The database row
    /// is already updated by the append.
    pub fn note_activity(&self, id: ConversationId, at: DateTime<Utc>) {
        if let Some(mut entry) = self.cache.get_mut(&id) {
            if entry.conversation.updated_at < at {
                let mut conversation = (*entry.conversation).clone();
                conversation.updated_at = at;
                entry.conversation = Arc::new(conversation);
            }
        }
    }

    /// Drop idle per-conversation lock slots.
    pub fn prune_locks(&self) -> usize {
        self.locks.prune()
    }

    /// Forget cached conversations not read within `max_idle`.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let before = self.cache.len();
        self.cache.retain(|_, entry| entry.touched.elapsed() < max_idle);
        before.saturating_sub(self.cache.len())
    }

    pub fn cached_count(&self) -> usize {
        self.cache.len()
    }

    fn cached(&self, id: ConversationId) -> Option<Arc<Conversation>> {
        let mut entry = self.cache.get_mut(&id)?;
        entry.touched = Instant::now();
        Some(entry.conversation.clone())
    }

    fn remember(&self, conversation: Conversation) -> Arc<Conversation> {
        let conversation = Arc::new(conversation);
        self.cache.insert(
            conversation.id,
            CacheEntry {
                conversation: conversation.clone(),
                touched: Instant::now(),
            },
        );
        conversation
    }
}
