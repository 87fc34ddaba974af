use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::error::TokenError;
use crate::types::PrincipalId;

// Token signed by the auth service, presented by clients on connect
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionToken {
    pub principal_id: PrincipalId,
    pub expires_at: DateTime<Utc>,
    pub signature: Vec<u8>,
}

impl SessionToken {
    /// Wire form: base64url (unpadded) of the JSON encoding.
    pub fn encode(&self) -> String {
        // Serializing plain strings and byte vectors cannot fail.
        let json = serde_json::to_vec(self).unwrap_or_default();
        URL_SAFE_NO_PAD.encode(json)
    }

    pub fn decode(raw: &str) -> Result<Self, TokenError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(raw.trim())
            .map_err(|_| TokenError::Malformed)?;
        serde_json::from_slice(&bytes).map_err(|_| TokenError::Malformed)
    }
}

// payload = principal_id || expires_at (rfc3339)
fn signing_payload(principal_id: &PrincipalId, expires_at: &DateTime<Utc>) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(principal_id.as_str().as_bytes());
    payload.extend_from_slice(expires_at.to_rfc3339().as_bytes());
    payload
}

pub fn verify_session_token(
    token: &SessionToken,
    auth_pubkey: &[u8; 32],
) -> Result<PrincipalId, TokenError> {
    if Utc::now() > token.expires_at {
        return Err(TokenError::Expired);
    }

    let verifying_key =
        VerifyingKey::from_bytes(auth_pubkey).map_err(|_| TokenError::BadSignature)?;
    let signature = Signature::from_slice(&token.signature).map_err(|_| TokenError::Malformed)?;

    verifying_key
        .verify(&signing_payload(&token.principal_id, &token.expires_at), &signature)
        .map_err(|_| TokenError::BadSignature)?;

    Ok(token.principal_id.clone())
}

pub fn create_session_token(
    principal_id: &PrincipalId,
    expires_at: DateTime<Utc>,
    auth_signing_key: &ed25519_dalek::SigningKey,
) -> SessionToken {
    use ed25519_dalek::Signer;

    let signature = auth_signing_key.sign(&signing_payload(principal_id, &expires_at));

    SessionToken {
        principal_id: principal_id.clone(),
        expires_at,
        signature: signature.to_bytes().to_vec(),
    }
}
