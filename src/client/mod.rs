//! Client-side session handling.
//!
//! A [`SessionReconciler`] sits between the app and the auth server. It keeps
//! the access token in a [`TokenCache`], hands out a valid token on demand,
//! and refreshes through an [`AuthTransport`] when the cached one expires.
//!
//! ```no_run
//! use std::sync::Arc;
//! use shakedown::client::{Credentials, HttpTransport, MemoryTokenCache, SessionReconciler};
//!
//! # async fn run() -> Result<(), shakedown::client::ClientError> {
//! let transport = Arc::new(HttpTransport::new("http://localhost:5000")?);
//! let session = SessionReconciler::new(transport, Arc::new(MemoryTokenCache::new()));
//!
//! session.init().await?;
//! session
//!     .login(&Credentials {
//!         email: "jerry@example.com".into(),
//!         password: "cornell77".into(),
//!     })
//!     .await?;
//! let token = session.get_token().await?;
//! # Ok(())
//! # }
//! ```

mod cache;
mod error;
mod session;
mod token;
mod transport;

pub use cache::{FileTokenCache, MemoryTokenCache, TokenCache};
pub use error::ClientError;
pub use session::{SessionReconciler, SessionState};
pub use token::{Clock, PeekedClaims, SystemClock, is_locally_valid, peek_claims};
pub use transport::{
    AuthTransport, Credentials, DEFAULT_TIMEOUT, HttpTransport, PasswordChange, Registration,
};
