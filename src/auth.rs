//! Auth/Token: decodes and validates bearer credentials into a [`UserIdentity`] (§4.1).
//!
//! `original_source/apps/backend-core/unpod/common/authentication.py`'s `DualJWTAuthentication`
//! is authoritative here: both the `JWT <token>` and `Bearer <token>` prefixes decode through
//! the same path, a missing/malformed header is a distinct [`AuthError`] from an
//! expired/invalid token, and an inactive user record is rejected even with a structurally
//! valid token.

use std::collections::HashMap;

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::error::AuthError;
use crate::identity::{IdentityCache, UserIdentity, UserStore};

/// Claims expected in the signed JWT: at minimum an `email` to drive the user store lookup
/// and a standard `exp` (checked automatically by `jsonwebtoken`'s default [`Validation`]).
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub email: String,
    pub exp: usize,
}

/// Resolves the caller's [`UserIdentity`] from an `Authorization` header and/or query
/// parameters.
///
/// Recognized shapes, first match wins:
/// - `Authorization: JWT <token>` or `Authorization: Bearer <token>`
/// - `?session_user=<id>` with no `Authorization` header → deterministic anonymous identity
///
/// A JWT is rejected when its signature doesn't verify or its `exp` is in the past. After
/// structural validation, the token's signature segment is looked up in `identity_cache`; on
/// miss `user_store` is queried by the claimed email, cached, and returned.
pub async fn validate(
    authorization_header: Option<&str>,
    query_params: &HashMap<String, String>,
    jwt_secret: &str,
    identity_cache: &IdentityCache,
    user_store: &dyn UserStore,
    anonymous_domain: &str,
) -> Result<UserIdentity, AuthError> {
    if let Some(header) = authorization_header {
        let token = extract_token(header).ok_or(AuthError::MissingCredentials)?;
        return validate_token(token, jwt_secret, identity_cache, user_store).await;
    }

    if let Some(session_user) = query_params.get("session_user") {
        return Ok(UserIdentity::anonymous(session_user, anonymous_domain));
    }

    Err(AuthError::MissingCredentials)
}

/// Strips a recognized `JWT `/`Bearer ` scheme prefix, returning the bare token.
fn extract_token(header: &str) -> Option<&str> {
    header
        .strip_prefix("JWT ")
        .or_else(|| header.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

async fn validate_token(
    token: &str,
    jwt_secret: &str,
    identity_cache: &IdentityCache,
    user_store: &dyn UserStore,
) -> Result<UserIdentity, AuthError> {
    let signature_segment = token
        .rsplit('.')
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| AuthError::InvalidToken("malformed JWT".to_string()))?
        .to_string();

    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = true;
    let decoded = decode::<Claims>(token, &DecodingKey::from_secret(jwt_secret.as_bytes()), &validation)
        .map_err(|e| AuthError::InvalidToken(e.to_string()))?;

    let identity = identity_cache
        .get_or_load(&signature_segment, &decoded.claims.email, user_store)
        .await
        .map_err(|e| AuthError::InvalidToken(e.to_string()))?
        .ok_or(AuthError::UserNotFound)?;

    if !identity.active {
        return Err(AuthError::InactiveUser);
    }

    Ok(identity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::InMemoryUserStore;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SECRET: &str = "test-secret";

    fn sign(email: &str, exp_offset_secs: i64) -> String {
        let exp = (chrono::Utc::now().timestamp() + exp_offset_secs) as usize;
        let claims = Claims {
            email: email.to_string(),
            exp,
        };
        encode(&Header::default(), &claims, &EncodingKey::from_secret(SECRET.as_bytes())).unwrap()
    }

    #[tokio::test]
    async fn anonymous_session_user_with_no_header() {
        let cache = IdentityCache::new();
        let store = InMemoryUserStore::new();
        let mut params = HashMap::new();
        params.insert("session_user".to_string(), "guest42".to_string());

        let identity = validate(None, &params, SECRET, &cache, &store, "unpod.tv")
            .await
            .unwrap();

        assert!(identity.anonymous);
        assert_eq!(identity.full_name(), "Anonymous User");
    }

    #[tokio::test]
    async fn missing_credentials_without_header_or_session_user() {
        let cache = IdentityCache::new();
        let store = InMemoryUserStore::new();
        let err = validate(None, &HashMap::new(), SECRET, &cache, &store, "unpod.tv")
            .await
            .unwrap_err();
        assert_eq!(err, AuthError::MissingCredentials);
    }

    #[tokio::test]
    async fn expired_token_is_rejected() {
        let cache = IdentityCache::new();
        let store = InMemoryUserStore::new();
        let token = sign("person@example.com", -3600);
        let header = format!("JWT {token}");
        let err = validate(Some(&header), &HashMap::new(), SECRET, &cache, &store, "unpod.tv")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidToken(_)));
    }

    #[tokio::test]
    async fn valid_token_but_user_missing_from_store() {
        let cache = IdentityCache::new();
        let store = InMemoryUserStore::new();
        let token = sign("ghost@example.com", 3600);
        let header = format!("Bearer {token}");
        let err = validate(Some(&header), &HashMap::new(), SECRET, &cache, &store, "unpod.tv")
            .await
            .unwrap_err();
        assert_eq!(err, AuthError::UserNotFound);
    }

    #[tokio::test]
    async fn inactive_user_is_rejected_even_with_valid_token() {
        let cache = IdentityCache::new();
        let store = InMemoryUserStore::new();
        store.insert(UserIdentity {
            id: "u1".to_string(),
            email: "person@example.com".to_string(),
            username: "person".to_string(),
            first_name: "Pat".to_string(),
            last_name: "Doe".to_string(),
            active: false,
            anonymous: false,
        });
        let token = sign("person@example.com", 3600);
        let header = format!("JWT {token}");
        let err = validate(Some(&header), &HashMap::new(), SECRET, &cache, &store, "unpod.tv")
            .await
            .unwrap_err();
        assert_eq!(err, AuthError::InactiveUser);
    }

    #[tokio::test]
    async fn both_jwt_and_bearer_prefixes_decode_the_same_way() {
        let store = InMemoryUserStore::new();
        store.insert(UserIdentity {
            id: "u1".to_string(),
            email: "person@example.com".to_string(),
            username: "person".to_string(),
            first_name: "Pat".to_string(),
            last_name: "Doe".to_string(),
            active: true,
            anonymous: false,
        });
        let token = sign("person@example.com", 3600);

        let cache_a = IdentityCache::new();
        let via_jwt = validate(Some(&format!("JWT {token}")), &HashMap::new(), SECRET, &cache_a, &store, "unpod.tv")
            .await
            .unwrap();

        let cache_b = IdentityCache::new();
        let via_bearer = validate(Some(&format!("Bearer {token}")), &HashMap::new(), SECRET, &cache_b, &store, "unpod.tv")
            .await
            .unwrap();

        assert_eq!(via_jwt, via_bearer);
    }
}
