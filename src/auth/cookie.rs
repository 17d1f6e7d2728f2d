//! Cookie helpers for the refresh token transport.

use axum::http::header;

/// Cookie name for the refresh token.
pub const REFRESH_COOKIE_NAME: &str = "refresh_token";

/// The refresh cookie is only sent to the token endpoints.
pub const REFRESH_COOKIE_PATH: &str = "/api/auth";

/// Extract a cookie value from the Cookie header.
pub fn get_cookie<'a>(headers: &'a axum::http::HeaderMap, name: &str) -> Option<&'a str> {
    let cookie_header = headers.get(header::COOKIE)?.to_str().ok()?;
    for part in cookie_header.split(';') {
        let part = part.trim();
        if let Some((key, value)) = part.split_once('=') {
            if key.trim() == name {
                return Some(value.trim());
            }
        }
    }
    None
}

/// Build the Set-Cookie value carrying a refresh token.
pub fn refresh_cookie(token: &str, max_age: u64, secure: bool) -> String {
    let secure = if secure { "; Secure" } else { "" };
    format!(
        "{}={}; HttpOnly; SameSite=Strict; Path={}; Max-Age={}{}",
        REFRESH_COOKIE_NAME, token, REFRESH_COOKIE_PATH, max_age, secure
    )
}

/// Build the Set-Cookie value that removes the refresh token.
pub fn clear_refresh_cookie(secure: bool) -> String {
    let secure = if secure { "; Secure" } else { "" };
    format!(
        "{}=; HttpOnly; SameSite=Strict; Path={}; Max-Age=0{}",
        REFRESH_COOKIE_NAME, REFRESH_COOKIE_PATH, secure
    )
}
