//! Bearer credential validation for connection handshakes
//!
//! Tokens are issued by the identity service; this module only validates them.
//!
//! ## Security Design
//!
//! - **RS256 ONLY**: No symmetric algorithms (HS256) to prevent confusion attacks
//! - **No hardcoded keys**: The public key is supplied by configuration
//! - **Explicit instance**: The validator is passed through application state, not stored globally
//!
//! ## Usage
//!
//! ```rust,ignore
//! use crypto_core::jwt::JwtValidator;
//!
//! let validator = JwtValidator::from_rsa_pem(&std::env::var("JWT_PUBLIC_KEY_PEM")?)?;
//! let user_id = validator.validate("eyJ...")?;
//! ```

use crate::{CryptoError, CryptoResult};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// JWT algorithm - MUST be RS256
pub const JWT_ALGORITHM: Algorithm = Algorithm::RS256;

/// Claims required on a connection token
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    /// Subject (user ID as UUID string)
    pub sub: String,
    /// Issued at (Unix timestamp)
    #[serde(default)]
    pub iat: i64,
    /// Expiration time (Unix timestamp)
    pub exp: i64,
    /// Token type: "access" or "refresh"
    #[serde(default)]
    pub token_type: Option<String>,
}

#[derive(Clone)]
pub struct JwtValidator {
    key: DecodingKey,
    validation: Validation,
}

impl JwtValidator {
    pub fn from_rsa_pem(public_key_pem: &str) -> CryptoResult<Self> {
        let key = DecodingKey::from_rsa_pem(public_key_pem.as_bytes())
            .map_err(|e| CryptoError::InvalidKeyFormat(format!("RSA public key: {e}")))?;

        let mut validation = Validation::new(JWT_ALGORITHM);
        validation.validate_exp = true;

        Ok(Self { key, validation })
    }

    /// Validate a token and return the authenticated user id.
    ///
    /// Every failure (bad signature, expiry, refresh token, malformed subject)
    /// collapses to `Unauthorized`.
    pub fn validate(&self, token: &str) -> CryptoResult<Uuid> {
        let data = decode::<Claims>(token, &self.key, &self.validation).map_err(|e| {
            tracing::debug!(error = %e, "token validation failed");
            CryptoError::Unauthorized
        })?;

        if data.claims.token_type.as_deref() == Some("refresh") {
            return Err(CryptoError::Unauthorized);
        }

        Uuid::parse_str(&data.claims.sub).map_err(|_| CryptoError::Unauthorized)
    }
}

/// Strip the `Bearer ` scheme from an Authorization header value.
pub fn bearer_token(header_value: &str) -> Option<&str> {
    header_value
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}
