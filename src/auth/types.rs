//! Authentication user types.

use crate::jwt::AccessClaims;

/// Authenticated subject extracted from a verified access token.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    /// JWT claims from the access token
    pub claims: AccessClaims,
}

impl AuthenticatedUser {
    /// The subject's user UUID.
    pub fn subject(&self) -> &str {
        &self.claims.sub
    }
}
