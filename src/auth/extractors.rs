//! Axum extractors for authentication.

use axum::{
    extract::FromRequestParts,
    http::{HeaderMap, header, request::Parts},
};

use super::errors::ApiAuthError;
use super::state::HasAuthBackend;
use super::types::AuthenticatedUser;
use crate::jwt::unix_now;

/// Read the token from an `Authorization: Bearer <token>` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

/// Verify the bearer token on a request. Pure apart from reading the clock.
fn authenticate_request<S>(parts: &Parts, state: &S) -> Result<AuthenticatedUser, ApiAuthError>
where
    S: HasAuthBackend,
{
    let token = bearer_token(&parts.headers).ok_or(ApiAuthError::NotAuthenticated)?;
    let now = unix_now().map_err(|_| ApiAuthError::InvalidToken)?;

    let claims = state
        .jwt()
        .verify_access_token_at(token, now)
        .map_err(|e| {
            tracing::debug!(error = %e, "Rejected access token");
            ApiAuthError::InvalidToken
        })?;

    Ok(AuthenticatedUser { claims })
}

/// Extractor for endpoints that require authentication.
/// Validates the access token only; an expired token is the client's cue to refresh.
pub struct Auth(pub AuthenticatedUser);

impl<S> FromRequestParts<S> for Auth
where
    S: HasAuthBackend + Send + Sync,
{
    type Rejection = ApiAuthError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        authenticate_request(parts, state).map(Auth)
    }
}
