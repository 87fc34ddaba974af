//! Session token verification and caching.
//!
//! Verifies `SessionToken`s issued by the external auth service using
//! ed25519-dalek, and caches successful verifications so reconnecting
//! devices do not re-check signatures on every handshake.

use std::collections::HashMap;
use std::sync::Arc;

use arogya_shared::token::{verify_session_token, SessionToken};
use arogya_shared::{ChatError, PrincipalId};
use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// A cached verification result.
#[derive(Debug, Clone)]
struct CachedPrincipal {
    principal: PrincipalId,
    expires_at: DateTime<Utc>,
}

impl CachedPrincipal {
    fn is_fresh(&self) -> bool {
        Utc::now() < self.expires_at
    }
}

/// Resolves transport credentials to principals.
#[derive(Clone)]
pub struct TokenVerifier {
    /// The auth service's Ed25519 public key.
    auth_pubkey: [u8; 32],
    /// Cache: raw token -> principal it proved.
    cache: Arc<RwLock<HashMap<String, CachedPrincipal>>>,
}

impl TokenVerifier {
    pub fn new(auth_pubkey: [u8; 32]) -> Self {
        Self {
            auth_pubkey,
            cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Resolve a raw wire token to the principal it was issued for.
    pub async fn authenticate(&self, raw: &str) -> Result<PrincipalId, ChatError> {
        {
            let cache = self.cache.read().await;
            if let Some(entry) = cache.get(raw) {
                if entry.is_fresh() {
                    debug!(principal = %entry.principal, "Session token served from cache");
                    return Ok(entry.principal.clone());
                }
            }
        }

        let token = SessionToken::decode(raw)?;
        let principal = verify_session_token(&token, &self.auth_pubkey)?;

        self.cache.write().await.insert(
            raw.to_string(),
            CachedPrincipal {
                principal: principal.clone(),
                expires_at: token.expires_at,
            },
        );

        info!(principal = %principal, until = %token.expires_at, "Session token verified");
        Ok(principal)
    }

    /// Resolve the `Authorization: Bearer <token>` header of an HTTP request.
    pub async fn authenticate_headers(
        &self,
        headers: &HeaderMap,
    ) -> Result<PrincipalId, ChatError> {
        let auth = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");

        let Some(token) = auth.strip_prefix("Bearer ") else {
            return Err(ChatError::AuthRequired("missing bearer token".into()));
        };

        self.authenticate(token).await
    }

    /// Evict expired entries from the cache.
    pub async fn purge_expired(&self) {
        let mut cache = self.cache.write().await;
        let before = cache.len();
        cache.retain(|_, entry| entry.is_fresh());
        let removed = before - cache.len();
        if removed > 0 {
            debug!(removed, "Purged expired session cache entries");
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use arogya_shared::token::create_session_token;
    use arogya_shared::PrincipalId;
    use chrono::{Duration, Utc};
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;

    /// Stand-in for the auth service: signs tokens for any principal.
    pub struct TestIssuer {
        key: SigningKey,
    }

    impl TestIssuer {
        pub fn new() -> Self {
            Self {
                key: SigningKey::generate(&mut OsRng),
            }
        }

        pub fn pubkey(&self) -> [u8; 32] {
            self.key.verifying_key().to_bytes()
        }

        pub fn token_for(&self, principal: &str) -> String {
            self.token_expiring(principal, Duration::hours(1))
        }

        pub fn token_expiring(&self, principal: &str, ttl: Duration) -> String {
            create_session_token(&PrincipalId(principal.to_string()), Utc::now() + ttl, &self.key)
                .encode()
        }
    }
}
