//! Server-side authentication.
//!
//! Dual-token system: short-lived access tokens carried in the
//! `Authorization: Bearer` header (stateless, verified on every request) and
//! long-lived refresh tokens carried in an HTTP-only cookie (database-tracked,
//! rotated on every use).

mod cookie;
mod errors;
mod extractors;
mod ip;
mod state;
mod types;

pub use cookie::{
    REFRESH_COOKIE_NAME, REFRESH_COOKIE_PATH, clear_refresh_cookie, get_cookie, refresh_cookie,
};
pub use errors::ApiAuthError;
pub use extractors::{Auth, bearer_token};
pub use ip::extract_client_ip;
pub use state::HasAuthBackend;
pub use types::AuthenticatedUser;
