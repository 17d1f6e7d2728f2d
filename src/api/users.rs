//! User endpoints.
//!
//! - POST `/` - Register a new account
//! - GET `/me` - Profile of the authenticated subject
//! - DELETE `/me` - Delete the authenticated subject's account

use axum::{
    Json, Router,
    extract::State,
    http::{StatusCode, header::SET_COOKIE},
    response::IntoResponse,
    routing::{get, post},
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{error, info};

use super::error::{ApiError, ResultExt};
use crate::auth::{Auth, clear_refresh_cookie};
use crate::db::{Database, NewUser, PublicUser, User};
use crate::impl_has_auth_backend;
use crate::jwt::JwtConfig;
use crate::password;

const MIN_PASSWORD_LENGTH: usize = 8;
const MAX_FIELD_LENGTH: usize = 254;

#[derive(Clone)]
pub struct UsersState {
    pub db: Database,
    pub jwt: Arc<JwtConfig>,
    pub secure_cookies: bool,
}

impl_has_auth_backend!(UsersState);

pub fn router(state: UsersState) -> Router {
    Router::new()
        .route("/", post(create_user))
        .route("/me", get(current_user).delete(delete_account))
        .with_state(state)
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct CreateUserRequest {
    email: String,
    password: String,
    confirm_password: String,
    first_name: String,
    last_name: String,
    #[serde(default)]
    bio: Option<String>,
}

pub(super) fn validate_new_password(password: &str, confirm: &str) -> Result<(), ApiError> {
    if password.len() < MIN_PASSWORD_LENGTH {
        return Err(ApiError::bad_request(format!(
            "Password must be at least {} characters",
            MIN_PASSWORD_LENGTH
        )));
    }
    if password != confirm {
        return Err(ApiError::bad_request("Passwords do not match"));
    }
    Ok(())
}

pub(super) async fn hash_password(password: String) -> Result<String, ApiError> {
    tokio::task::spawn_blocking(move || password::hash(&password))
        .await
        .map_err(|e| {
            error!("Password hashing task failed: {}", e);
            ApiError::internal("Failed to hash password")
        })?
        .map_err(|e| {
            error!("Failed to hash password: {}", e);
            ApiError::internal("Failed to hash password")
        })
}

fn validate_registration(payload: &CreateUserRequest) -> Result<(), ApiError> {
    let email = payload.email.trim();
    if email.is_empty() || !email.contains('@') {
        return Err(ApiError::bad_request("A valid email is required"));
    }
    if payload.first_name.trim().is_empty() || payload.last_name.trim().is_empty() {
        return Err(ApiError::bad_request("First and last name are required"));
    }
    if [email, payload.first_name.trim(), payload.last_name.trim()]
        .iter()
        .any(|field| field.len() > MAX_FIELD_LENGTH)
    {
        return Err(ApiError::bad_request("Field is too long"));
    }
    validate_new_password(&payload.password, &payload.confirm_password)
}

async fn create_user(
    State(state): State<UsersState>,
    Json(payload): Json<CreateUserRequest>,
) -> Result<impl IntoResponse, ApiError> {
    validate_registration(&payload)?;
    let email = payload.email.trim();

    let exists = state
        .db
        .users()
        .email_exists(email)
        .await
        .db_err("Failed to check email")?;
    if exists {
        return Err(ApiError::bad_request(format!("Email {} already exists", email)));
    }

    let password_hash = hash_password(payload.password.clone()).await?;

    let uuid = uuid::Uuid::new_v4().to_string();
    let bio = payload.bio.as_deref().map(str::trim).filter(|b| !b.is_empty());

    let created = state
        .db
        .users()
        .create(&NewUser {
            uuid: &uuid,
            email,
            first_name: payload.first_name.trim(),
            last_name: payload.last_name.trim(),
            bio,
            password_hash: &password_hash,
        })
        .await;

    let id = match created {
        Ok(id) => id,
        Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
            return Err(ApiError::bad_request(format!("Email {} already exists", email)));
        }
        Err(e) => return Err(ApiError::db_error("Failed to create user", e)),
    };

    let user = state
        .db
        .users()
        .get_by_uuid(&uuid)
        .await
        .db_err("Failed to get user")?
        .ok_or_else(|| ApiError::internal("User vanished after creation"))?;

    info!(user_id = id, "Registered user");
    Ok((StatusCode::CREATED, Json(PublicUser::from(user))))
}

async fn subject_user(state: &UsersState, subject: &str) -> Result<User, ApiError> {
    state
        .db
        .users()
        .get_by_uuid(subject)
        .await
        .db_err("Failed to get user")?
        .ok_or_else(|| ApiError::not_found("User not found"))
}

/// Profile of the authenticated subject, looked up by the token's `sub`.
async fn current_user(
    State(state): State<UsersState>,
    Auth(auth): Auth,
) -> Result<impl IntoResponse, ApiError> {
    let user = subject_user(&state, auth.subject()).await?;
    Ok(Json(PublicUser::from(user)))
}

/// Delete the account. Its refresh sessions are removed with it.
async fn delete_account(
    State(state): State<UsersState>,
    Auth(auth): Auth,
) -> Result<impl IntoResponse, ApiError> {
    let user = subject_user(&state, auth.subject()).await?;

    state
        .db
        .users()
        .delete(user.id)
        .await
        .db_err("Failed to delete user")?;

    info!(user_id = user.id, "Deleted account");
    Ok((
        StatusCode::OK,
        [(SET_COOKIE, clear_refresh_cookie(state.secure_cookies))],
        Json(serde_json::json!({ "success": true })),
    ))
}
