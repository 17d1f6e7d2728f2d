//! Token endpoints.
//!
//! - POST `/token` - Exchange email and password for an access token and refresh cookie
//! - GET|POST `/token/refresh` - Exchange the refresh cookie for a new access token (rotating)
//! - DELETE `/token` - Revoke the refresh cookie's session and clear it
//! - PUT `/password` - Change password, revoke every session, start a new one

use axum::{
    Json, Router,
    extract::State,
    http::{Extensions, HeaderMap, HeaderValue, StatusCode, header::SET_COOKIE},
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};

use super::error::{ApiError, ResultExt};
use super::users::{hash_password, validate_new_password};
use crate::auth::{
    Auth, REFRESH_COOKIE_NAME, clear_refresh_cookie, extract_client_ip, get_cookie,
    refresh_cookie,
};
use crate::impl_has_auth_backend;
use crate::db::{Database, NewSession, RefreshSession, RotateOutcome, SessionStore, User};
use crate::jwt::{JwtConfig, unix_now};
use crate::password;

#[derive(Clone)]
pub struct AuthState {
    pub db: Database,
    pub jwt: Arc<JwtConfig>,
    pub secure_cookies: bool,
    pub trust_proxy: bool,
}

impl_has_auth_backend!(AuthState);

pub fn router(state: AuthState) -> Router {
    Router::new()
        .route("/token", post(issue_token).delete(revoke_token))
        .route("/token/refresh", get(refresh_token).post(refresh_token))
        .route("/password", put(change_password))
        .with_state(state)
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct LoginRequest {
    email: String,
    password: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ChangePasswordRequest {
    current_password: String,
    new_password: String,
    confirm_password: String,
}

#[derive(Serialize)]
struct TokenResponse {
    access_token: String,
}

const INVALID_LOGIN: &str = "Invalid email or password";

/// How long after an exchange the same refresh token may be presented again
/// and still be honored, as long as its successor has not been used.
/// Covers a client retrying after the exchange response was lost.
pub const REUSE_GRACE_SECS: u64 = 30;

/// Current time for token minting; a broken clock is a server fault.
fn now() -> Result<u64, ApiError> {
    unix_now().map_err(|e| {
        error!("Failed to read clock: {}", e);
        ApiError::internal("Failed to generate token")
    })
}

/// Respond with a fresh access token and set the refresh cookie.
fn token_response(
    state: &AuthState,
    status: StatusCode,
    access_token: String,
    refresh_token: &str,
) -> Response {
    let cookie = refresh_cookie(refresh_token, state.jwt.refresh_duration(), state.secure_cookies);
    (
        status,
        [(SET_COOKIE, cookie)],
        Json(TokenResponse { access_token }),
    )
        .into_response()
}

/// Log in: verify the password, then mint an access token and start a refresh session.
async fn issue_token(
    State(state): State<AuthState>,
    headers: HeaderMap,
    extensions: Extensions,
    Json(payload): Json<LoginRequest>,
) -> Result<Response, ApiError> {
    let email = payload.email.trim();
    if email.is_empty() || payload.password.is_empty() {
        return Err(ApiError::bad_request(INVALID_LOGIN));
    }

    let user = state
        .db
        .users()
        .get_by_email(email)
        .await
        .db_err("Failed to get user")?
        .ok_or_else(|| ApiError::bad_request(INVALID_LOGIN))?;

    if !verify_password(payload.password, &user).await? {
        info!(user_id = user.id, "Rejected login with wrong password");
        return Err(ApiError::bad_request(INVALID_LOGIN));
    }

    let client_ip = extract_client_ip(&headers, &extensions, state.trust_proxy);
    let (access_token, refresh_token) = mint_session(&state, &user, client_ip.as_deref()).await?;

    info!(user_id = user.id, "Issued new session");
    Ok(token_response(
        &state,
        StatusCode::CREATED,
        access_token,
        &refresh_token,
    ))
}

async fn verify_password(password: String, user: &User) -> Result<bool, ApiError> {
    let hash = user.password_hash.clone();
    tokio::task::spawn_blocking(move || password::verify(&password, &hash))
        .await
        .map_err(|e| {
            error!("Password verification task failed: {}", e);
            ApiError::internal("Failed to verify password")
        })
}

/// Mint an access token and a refresh token starting a new family, and record the latter.
async fn mint_session(
    state: &AuthState,
    user: &User,
    client_ip: Option<&str>,
) -> Result<(String, String), ApiError> {
    let now = now()?;

    let access = state
        .jwt
        .generate_access_token_at(&user.uuid, user.role, now)
        .map_err(|e| {
            error!("Failed to generate access token: {}", e);
            ApiError::internal("Failed to generate token")
        })?;

    let refresh = state
        .jwt
        .generate_refresh_token_at(&user.uuid, None, now)
        .map_err(|e| {
            error!("Failed to generate refresh token: {}", e);
            ApiError::internal("Failed to generate token")
        })?;

    state
        .db
        .sessions()
        .create(&NewSession {
            jti: &refresh.jti,
            family: &refresh.family,
            user_id: user.id,
            ip: client_ip,
            issued_at: refresh.issued_at,
            expires_at: refresh.expires_at,
        })
        .await
        .db_err("Failed to store refresh token")?;

    Ok((access.token, refresh.token))
}

/// Refresh the access token using the refresh cookie.
/// Session rejections also clear the cookie; server faults leave it in place.
async fn refresh_token(State(state): State<AuthState>, request: axum::extract::Request) -> Response {
    let (parts, _body) = request.into_parts();

    match exchange_refresh_token(&state, &parts.headers, &parts.extensions).await {
        Ok(response) => response,
        Err(e @ ApiError::SessionInvalid(_)) => {
            let mut response = e.into_response();
            if let Ok(value) = HeaderValue::from_str(&clear_refresh_cookie(state.secure_cookies)) {
                response.headers_mut().append(SET_COOKIE, value);
            }
            response
        }
        Err(e) => e.into_response(),
    }
}

async fn exchange_refresh_token(
    state: &AuthState,
    headers: &HeaderMap,
    extensions: &Extensions,
) -> Result<Response, ApiError> {
    let now = now()?;

    let token = get_cookie(headers, REFRESH_COOKIE_NAME)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ApiError::session_invalid("No refresh token"))?;

    let claims = state
        .jwt
        .verify_refresh_token_at(token, now)
        .map_err(|_| ApiError::session_invalid("Invalid or expired refresh token"))?;

    let sessions = state.db.sessions();

    let session = sessions
        .get_by_jti(&claims.jti)
        .await
        .db_err("Failed to check token")?
        .ok_or_else(|| ApiError::session_invalid("Refresh token has been revoked"))?;

    let session = if session.used {
        match retry_successor(&sessions, &session, now).await? {
            Some(successor) => {
                info!(
                    user_id = session.user_id,
                    "Refresh token presented again within grace window"
                );
                successor
            }
            None => {
                let revoked = sessions
                    .delete_family(&session.family)
                    .await
                    .db_err("Failed to revoke session")?;
                warn!(
                    user_id = session.user_id,
                    revoked, "Refresh token reuse detected, session revoked"
                );
                return Err(ApiError::session_invalid("Refresh token has been revoked"));
            }
        }
    } else {
        session
    };

    if session.is_expired(now) {
        return Err(ApiError::session_invalid("Invalid or expired refresh token"));
    }

    let user = match state
        .db
        .users()
        .get_by_uuid(&claims.sub)
        .await
        .db_err("Failed to get user")?
    {
        Some(user) if user.id == session.user_id => user,
        _ => {
            sessions
                .delete_family(&session.family)
                .await
                .db_err("Failed to revoke session")?;
            return Err(ApiError::session_invalid("User not found"));
        }
    };

    let access = state
        .jwt
        .generate_access_token_at(&user.uuid, user.role, now)
        .map_err(|e| {
            error!("Failed to generate access token: {}", e);
            ApiError::internal("Failed to generate token")
        })?;

    let next = state
        .jwt
        .generate_refresh_token_at(&user.uuid, Some(&session.family), now)
        .map_err(|e| {
            error!("Failed to generate refresh token: {}", e);
            ApiError::internal("Failed to generate token")
        })?;

    let client_ip = extract_client_ip(headers, extensions, state.trust_proxy)
        .or_else(|| session.last_ip.clone());

    let outcome = sessions
        .rotate(
            &session.jti,
            &NewSession {
                jti: &next.jti,
                family: &next.family,
                user_id: user.id,
                ip: client_ip.as_deref(),
                issued_at: next.issued_at,
                expires_at: next.expires_at,
            },
            now,
        )
        .await
        .db_err("Failed to rotate refresh token")?;

    if outcome == RotateOutcome::Stale {
        // Another request exchanged this token first.
        sessions
            .delete_family(&session.family)
            .await
            .db_err("Failed to revoke session")?;
        warn!(
            user_id = user.id,
            "Concurrent refresh token reuse, session revoked"
        );
        return Err(ApiError::session_invalid("Refresh token has been revoked"));
    }

    info!(user_id = user.id, "Refreshed access token");
    Ok(token_response(state, StatusCode::OK, access.token, &next.token))
}

/// The live successor of a used token, if the token was exchanged within
/// [`REUSE_GRACE_SECS`] and nothing has exchanged the successor since.
async fn retry_successor(
    sessions: &SessionStore,
    used: &RefreshSession,
    now: u64,
) -> Result<Option<RefreshSession>, ApiError> {
    if !used.used_within(now, REUSE_GRACE_SECS) {
        return Ok(None);
    }
    let Some(jti) = used.replaced_by.as_deref() else {
        return Ok(None);
    };

    let successor = sessions
        .get_by_jti(jti)
        .await
        .db_err("Failed to check token")?;
    Ok(successor.filter(|s| !s.used && !s.is_expired(now)))
}

/// Change the password. Every refresh family of the user is revoked, then the
/// caller gets a new session. Access tokens already issued run out on their own.
async fn change_password(
    State(state): State<AuthState>,
    Auth(auth): Auth,
    headers: HeaderMap,
    extensions: Extensions,
    Json(payload): Json<ChangePasswordRequest>,
) -> Result<Response, ApiError> {
    let user = state
        .db
        .users()
        .get_by_uuid(auth.subject())
        .await
        .db_err("Failed to get user")?
        .ok_or_else(|| ApiError::not_found("User not found"))?;

    if !verify_password(payload.current_password, &user).await? {
        info!(user_id = user.id, "Rejected password change with wrong password");
        return Err(ApiError::bad_request("Current password is incorrect"));
    }
    validate_new_password(&payload.new_password, &payload.confirm_password)?;
    let password_hash = hash_password(payload.new_password).await?;

    state
        .db
        .users()
        .update_password(user.id, &password_hash)
        .await
        .db_err("Failed to update password")?;
    let revoked = state
        .db
        .sessions()
        .delete_by_user(user.id)
        .await
        .db_err("Failed to revoke sessions")?;

    let client_ip = extract_client_ip(&headers, &extensions, state.trust_proxy);
    let (access_token, refresh_token) = mint_session(&state, &user, client_ip.as_deref()).await?;

    info!(user_id = user.id, revoked, "Password changed");
    Ok(token_response(&state, StatusCode::OK, access_token, &refresh_token))
}

/// Logout - revoke the refresh session and clear the cookie.
/// Always succeeds, whether or not a session existed.
async fn revoke_token(
    State(state): State<AuthState>,
    request: axum::extract::Request,
) -> Result<impl IntoResponse, ApiError> {
    let (parts, _body) = request.into_parts();

    if let Some(token) = get_cookie(&parts.headers, REFRESH_COOKIE_NAME) {
        if let Ok(claims) = state.jwt.validate_refresh_token(token) {
            let revoked = state
                .db
                .sessions()
                .delete_family(&claims.family)
                .await
                .db_err("Failed to revoke session")?;
            if revoked > 0 {
                info!(revoked, "Session revoked on logout");
            }
        }
    }

    Ok((
        StatusCode::OK,
        [(SET_COOKIE, clear_refresh_cookie(state.secure_cookies))],
        Json(serde_json::json!({ "success": true })),
    ))
}
