//! Bearer-token authentication
//!
//! HS256 JWT validation via an axum extractor. Routes that take an
//! `AuthUser` argument reject unauthenticated requests with 401 before the
//! handler body runs.

use axum::{extract::FromRequestParts, http::request::Parts};
use jsonwebtoken::{decode, DecodingKey, Validation};
use plume_credits::CreditsError;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{error::ApiError, state::AppState};

/// JWT claims carried by the session token.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// User id.
    pub sub: String,
    pub email: String,
    /// Expiry as unix seconds.
    pub exp: i64,
}

/// Authenticated caller identity.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub email: String,
}

/// Validate a bearer token and extract the caller identity.
pub fn verify_token(token: &str, secret: &str) -> Result<AuthUser, CreditsError> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|e| {
        tracing::debug!(error = %e, "Token validation failed");
        CreditsError::Unauthenticated
    })?;

    let user_id = Uuid::parse_str(&data.claims.sub).map_err(|_| CreditsError::Unauthenticated)?;

    Ok(AuthUser {
        user_id,
        email: data.claims.email,
    })
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|h| h.to_str().ok())
            .and_then(|h| h.strip_prefix("Bearer "))
            .ok_or(ApiError::Credits(CreditsError::Unauthenticated))?;

        verify_token(token, &state.config.jwt_secret).map_err(ApiError::Credits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use time::OffsetDateTime;

    const SECRET: &str = "test-secret-test-secret-test-secret";

    fn make_token(sub: &str, exp_offset_secs: i64, secret: &str) -> String {
        let claims = Claims {
            sub: sub.to_string(),
            email: "writer@example.com".to_string(),
            exp: OffsetDateTime::now_utc().unix_timestamp() + exp_offset_secs,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn test_valid_token_round_trip() {
        let user_id = Uuid::new_v4();
        let token = make_token(&user_id.to_string(), 3600, SECRET);
        let user = verify_token(&token, SECRET).unwrap();
        assert_eq!(user.user_id, user_id);
        assert_eq!(user.email, "writer@example.com");
    }

    #[test]
    fn test_expired_token_rejected() {
        let token = make_token(&Uuid::new_v4().to_string(), -3600, SECRET);
        assert!(matches!(
            verify_token(&token, SECRET),
            Err(CreditsError::Unauthenticated)
        ));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let token = make_token(&Uuid::new_v4().to_string(), 3600, "another-secret-another-secret!");
        assert!(matches!(
            verify_token(&token, SECRET),
            Err(CreditsError::Unauthenticated)
        ));
    }

    #[test]
    fn test_non_uuid_subject_rejected() {
        let token = make_token("not-a-uuid", 3600, SECRET);
        assert!(matches!(
            verify_token(&token, SECRET),
            Err(CreditsError::Unauthenticated)
        ));
    }
}
