mod auth;
mod error;
mod users;

use axum::Router;
use std::sync::Arc;

use crate::db::Database;
use crate::jwt::JwtConfig;

pub use auth::{AuthState, REUSE_GRACE_SECS};
pub use error::{ApiError, SESSION_INVALID_CODE};
pub use users::UsersState;

/// Create the API router.
pub fn create_api_router(
    db: Database,
    jwt: Arc<JwtConfig>,
    secure_cookies: bool,
    trust_proxy: bool,
) -> Router {
    let auth_state = auth::AuthState {
        db: db.clone(),
        jwt: jwt.clone(),
        secure_cookies,
        trust_proxy,
    };

    let users_state = users::UsersState {
        db,
        jwt,
        secure_cookies,
    };

    Router::new()
        .nest("/auth", auth::router(auth_state))
        .nest("/users", users::router(users_state))
}
