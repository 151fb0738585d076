//! Bearer-token sessions.
//!
//! Registration/login hands out a signed JWT whose subject is the user id;
//! the [`AuthedUser`] extractor resolves it back to the acting user on every
//! authenticated route.

use axum::{
    extract::FromRequestParts,
    http::{header, request::Parts},
};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    models::User,
    AppState,
};

const SESSION_TTL_SECS: usize = 60 * 60 * 24 * 7;

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    iat: usize,
    exp: usize,
}

fn unix_now() -> usize {
    use std::time::SystemTime;
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs() as usize)
        .unwrap_or(0)
}

/// Issue a session token for a user id.
pub fn issue_token(user_id: &str, secret: &str) -> Result<String> {
    let now = unix_now();
    let claims = Claims {
        sub: user_id.to_string(),
        iat: now,
        exp: now + SESSION_TTL_SECS,
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| Error::Internal(e.into()))
}

/// Decode a session token back to the user id it was issued for.
pub fn verify_token(token: &str, secret: &str) -> Result<String> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::new(Algorithm::HS256),
    )
    .map_err(|_| Error::Unauthorized("invalid or expired session token"))?;
    Ok(data.claims.sub)
}

/// The acting user, resolved from the `Authorization: Bearer` header.
#[derive(Debug, Clone)]
pub struct AuthedUser(pub User);

#[axum::async_trait]
impl FromRequestParts<AppState> for AuthedUser {
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self> {
        let header_value = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or(Error::Unauthorized("missing Authorization header"))?;
        let token = header_value
            .strip_prefix("Bearer ")
            .ok_or(Error::Unauthorized("expected a bearer token"))?;

        let user_id = verify_token(token, &state.session_secret)?;
        let user = state
            .engine
            .store()
            .get_user(&user_id)
            .await?
            .ok_or(Error::Unauthorized("session user no longer exists"))?;
        Ok(AuthedUser(user))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_round_trip() {
        let token = issue_token("user-42", "sekrit").unwrap();
        let sub = verify_token(&token, "sekrit").unwrap();
        assert_eq!(sub, "user-42");
    }

    #[test]
    fn wrong_secret_rejected() {
        let token = issue_token("user-42", "sekrit").unwrap();
        let err = verify_token(&token, "other").unwrap_err();
        assert!(matches!(err, Error::Unauthorized(_)));
    }
}
