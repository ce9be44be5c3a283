//! Bearer-token verification for user-authenticated routes.
//!
//! Token issuance lives with the external auth service; this layer only
//! verifies. A token is `<user_uuid>.<hex(HMAC_SHA256(secret, uuid))>`,
//! checked in constant time via the mac verifier.

use crate::error::ApiError;
use crate::AppState;
use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::sync::Arc;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

pub fn verify_token(secret: &str, token: &str) -> Option<Uuid> {
    let (user, signature_hex) = token.split_once('.')?;
    let user_id = Uuid::parse_str(user).ok()?;
    let signature = hex::decode(signature_hex).ok()?;
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(user.as_bytes());
    mac.verify_slice(&signature).ok()?;
    Some(user_id)
}

/// Produce a token in the shape `verify_token` accepts. Kept next to the
/// verifier so the format has one definition; real issuance is external.
pub fn mint_token(secret: &str, user_id: Uuid) -> String {
    let user = user_id.to_string();
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(user.as_bytes());
    let signature = mac.finalize().into_bytes();
    format!("{user}.{}", hex::encode(signature))
}

/// The authenticated caller of a user route.
pub struct AuthedUser(pub Uuid);

#[axum::async_trait]
impl FromRequestParts<Arc<AppState>> for AuthedUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .ok_or(ApiError::Unauthenticated)?;
        let user_id = verify_token(&state.config.auth_token_secret, token)
            .ok_or(ApiError::Unauthenticated)?;
        Ok(AuthedUser(user_id))
    }
}

/// Whether the request carries the configured admin token. Admin requests
/// bypass the response cache by convention.
pub fn is_admin(state: &AppState, headers: &HeaderMap) -> bool {
    let Some(expected) = state.config.admin_token.as_deref() else {
        return false;
    };
    headers
        .get("x-admin-token")
        .and_then(|value| value.to_str().ok())
        .map(|token| token == expected)
        .unwrap_or(false)
}

pub fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    if is_admin(state, headers) {
        Ok(())
    } else {
        Err(ApiError::Forbidden)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_round_trip() {
        let user = Uuid::new_v4();
        let token = mint_token("secret", user);
        assert_eq!(verify_token("secret", &token), Some(user));
    }

    #[test]
    fn bad_tokens_are_rejected() {
        let user = Uuid::new_v4();
        let token = mint_token("secret", user);
        assert_eq!(verify_token("other-secret", &token), None);
        assert_eq!(verify_token("secret", "not-a-token"), None);
        assert_eq!(verify_token("secret", &format!("{user}.deadbeef")), None);

        let other = Uuid::new_v4();
        let forged = format!("{other}.{}", token.split_once('.').unwrap().1);
        assert_eq!(verify_token("secret", &forged), None);
    }
}
