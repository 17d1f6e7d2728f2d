//! JWT token generation and validation.
//!
//! Verification is a pure function of the token, the current time and the
//! signing key. It never touches the database.

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::db::UserRole;

/// Token type for distinguishing access vs refresh tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenType {
    /// Short-lived access token - stateless, no JTI
    Access,
    /// Long-lived refresh token - tracked in database with JTI
    Refresh,
}

/// JWT claims for access tokens (stateless, no JTI).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessClaims {
    /// Subject (user UUID)
    pub sub: String,
    /// User role, carried but not evaluated here
    pub role: UserRole,
    /// Token type
    #[serde(rename = "typ")]
    pub token_type: TokenType,
    /// Issued at (Unix timestamp)
    pub iat: u64,
    /// Expiration time (Unix timestamp)
    pub exp: u64,
}

/// JWT claims for refresh tokens (tracked with JTI).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshClaims {
    /// JWT ID (unique identifier for revocation tracking)
    pub jti: String,
    /// Session family, shared by every rotation of one login
    #[serde(rename = "fam")]
    pub family: String,
    /// Subject (user UUID)
    pub sub: String,
    /// Token type
    #[serde(rename = "typ")]
    pub token_type: TokenType,
    /// Issued at (Unix timestamp)
    pub iat: u64,
    /// Expiration time (Unix timestamp)
    pub exp: u64,
}

/// Default access token duration: 15 minutes
pub const ACCESS_TOKEN_DURATION_SECS: u64 = 15 * 60;

/// Default refresh token duration: 2 weeks
pub const REFRESH_TOKEN_DURATION_SECS: u64 = 14 * 24 * 60 * 60;

/// Configuration for JWT operations.
#[derive(Clone)]
pub struct JwtConfig {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    access_duration: u64,
    refresh_duration: u64,
}

/// Result of generating an access token (no JTI).
#[derive(Debug, Clone)]
pub struct AccessTokenResult {
    /// The JWT token string
    pub token: String,
    /// Expiration timestamp (Unix seconds)
    pub expires_at: u64,
    /// Token duration in seconds
    pub duration: u64,
}

/// Result of generating a refresh token (with JTI for tracking).
#[derive(Debug, Clone)]
pub struct RefreshTokenResult {
    /// The JWT token string
    pub token: String,
    /// JWT ID (unique identifier for database tracking)
    pub jti: String,
    /// Session family the token belongs to
    pub family: String,
    /// Issued at timestamp (Unix seconds)
    pub issued_at: u64,
    /// Expiration timestamp (Unix seconds)
    pub expires_at: u64,
    /// Token duration in seconds
    pub duration: u64,
}

/// Current wall-clock time as Unix seconds.
pub fn unix_now() -> Result<u64, JwtError> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .map_err(|_| JwtError::TimeError)
}

impl JwtConfig {
    /// Create a new JWT configuration with the given secret and default durations.
    pub fn new(secret: &[u8]) -> Self {
        Self::with_durations(secret, ACCESS_TOKEN_DURATION_SECS, REFRESH_TOKEN_DURATION_SECS)
    }

    /// Create a JWT configuration with custom token lifetimes (seconds).
    pub fn with_durations(secret: &[u8], access_duration: u64, refresh_duration: u64) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            access_duration,
            refresh_duration,
        }
    }

    pub fn refresh_duration(&self) -> u64 {
        self.refresh_duration
    }

    /// Generate an access token for a user, issued now.
    pub fn generate_access_token(
        &self,
        user_uuid: &str,
        role: UserRole,
    ) -> Result<AccessTokenResult, JwtError> {
        self.generate_access_token_at(user_uuid, role, unix_now()?)
    }

    /// Generate an access token issued at `now`.
    pub fn generate_access_token_at(
        &self,
        user_uuid: &str,
        role: UserRole,
        now: u64,
    ) -> Result<AccessTokenResult, JwtError> {
        let exp = now + self.access_duration;

        let claims = AccessClaims {
            sub: user_uuid.to_string(),
            role,
            token_type: TokenType::Access,
            iat: now,
            exp,
        };

        let token = jsonwebtoken::encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(JwtError::Encoding)?;

        Ok(AccessTokenResult {
            token,
            expires_at: exp,
            duration: self.access_duration,
        })
    }

    /// Generate a refresh token for a user.
    /// Pass `None` as family to start a new session, or the current family when rotating.
    pub fn generate_refresh_token(
        &self,
        user_uuid: &str,
        family: Option<&str>,
    ) -> Result<RefreshTokenResult, JwtError> {
        self.generate_refresh_token_at(user_uuid, family, unix_now()?)
    }

    /// Generate a refresh token issued at `now`.
    pub fn generate_refresh_token_at(
        &self,
        user_uuid: &str,
        family: Option<&str>,
        now: u64,
    ) -> Result<RefreshTokenResult, JwtError> {
        let jti = uuid::Uuid::new_v4().to_string();
        let family = family
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let exp = now + self.refresh_duration;

        let claims = RefreshClaims {
            jti: jti.clone(),
            family: family.clone(),
            sub: user_uuid.to_string(),
            token_type: TokenType::Refresh,
            iat: now,
            exp,
        };

        let token = jsonwebtoken::encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(JwtError::Encoding)?;

        Ok(RefreshTokenResult {
            token,
            jti,
            family,
            issued_at: now,
            expires_at: exp,
            duration: self.refresh_duration,
        })
    }

    /// Validate and decode an access token against the wall clock.
    pub fn validate_access_token(&self, token: &str) -> Result<AccessClaims, JwtError> {
        self.verify_access_token_at(token, unix_now()?)
    }

    /// Validate and decode an access token at time `now`.
    /// A token is expired once `now >= exp`.
    pub fn verify_access_token_at(&self, token: &str, now: u64) -> Result<AccessClaims, JwtError> {
        let claims: AccessClaims = self.decode(token)?;

        if claims.token_type != TokenType::Access {
            return Err(JwtError::WrongTokenType);
        }
        if now >= claims.exp {
            return Err(JwtError::Expired);
        }

        Ok(claims)
    }

    /// Validate and decode a refresh token against the wall clock.
    pub fn validate_refresh_token(&self, token: &str) -> Result<RefreshClaims, JwtError> {
        self.verify_refresh_token_at(token, unix_now()?)
    }

    /// Validate and decode a refresh token at time `now`.
    pub fn verify_refresh_token_at(
        &self,
        token: &str,
        now: u64,
    ) -> Result<RefreshClaims, JwtError> {
        let claims: RefreshClaims = self.decode(token)?;

        if claims.token_type != TokenType::Refresh {
            return Err(JwtError::WrongTokenType);
        }
        if now >= claims.exp {
            return Err(JwtError::Expired);
        }

        Ok(claims)
    }

    fn decode<T: serde::de::DeserializeOwned>(&self, token: &str) -> Result<T, JwtError> {
        // Expiry is checked by the caller against an explicit clock.
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.validate_exp = false;

        jsonwebtoken::decode::<T>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(JwtError::Decoding)
    }
}

/// Errors that can occur during JWT operations.
#[derive(Debug, thiserror::Error)]
pub enum JwtError {
    #[error("Failed to encode token: {0}")]
    Encoding(jsonwebtoken::errors::Error),
    #[error("Failed to decode token: {0}")]
    Decoding(jsonwebtoken::errors::Error),
    #[error("Token has expired")]
    Expired,
    #[error("System time error")]
    TimeError,
    /// Wrong token type (e.g., using refresh token as access token)
    #[error("Wrong token type")]
    WrongTokenType,
}
