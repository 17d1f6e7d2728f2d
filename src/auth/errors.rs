//! Authentication error types.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

/// Why a protected request was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiAuthError {
    /// No bearer token on the request
    NotAuthenticated,
    /// Malformed, badly signed, or expired token
    InvalidToken,
}

impl ApiAuthError {
    fn message(&self) -> &'static str {
        match self {
            ApiAuthError::NotAuthenticated => "Not authenticated",
            ApiAuthError::InvalidToken => "Invalid or expired token",
        }
    }
}

impl IntoResponse for ApiAuthError {
    fn into_response(self) -> Response {
        #[derive(Serialize)]
        struct ErrorResponse {
            error: &'static str,
        }

        // The refresh cookie is left alone so the client can still refresh.
        (
            StatusCode::UNAUTHORIZED,
            [(axum::http::header::WWW_AUTHENTICATE, "Bearer")],
            Json(ErrorResponse {
                error: self.message(),
            }),
        )
            .into_response()
    }
}
