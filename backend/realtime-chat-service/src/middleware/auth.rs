use crate::error::{AppError, AppResult};
use crypto_core::jwt::{bearer_token, JwtValidator};
use uuid::Uuid;

/// Turns a bearer credential into the user id it was issued for.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, token: &str) -> AppResult<Uuid>;
}

/// RS256 access tokens issued by the identity service.
pub struct JwtAuthenticator {
    validator: JwtValidator,
}

impl JwtAuthenticator {
    pub fn new(validator: JwtValidator) -> Self {
        Self { validator }
    }

    pub fn from_public_key_pem(pem: &str) -> AppResult<Self> {
        JwtValidator::from_rsa_pem(pem)
            .map(Self::new)
            .map_err(|e| AppError::Config(format!("JWT_PUBLIC_KEY_PEM: {e}")))
    }
}

impl Authenticator for JwtAuthenticator {
    fn authenticate(&self, token: &str) -> AppResult<Uuid> {
        self.validator
            .validate(token)
            .map_err(|_| AppError::Unauthorized)
    }
}

/// Pick the credential off a connection request: the `Authorization: Bearer`
/// header wins over a `token` query parameter.
pub fn extract_token(authorization: Option<&str>, query: Option<&str>) -> Option<String> {
    if let Some(token) = authorization.and_then(bearer_token) {
        return Some(token.to_string());
    }

    query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == "token")
        .map(|(_, value)| value.to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_preferred_over_query() {
        assert_eq!(
            extract_token(Some("Bearer from-header"), Some("token=from-query")),
            Some("from-header".to_string())
        );
    }

    #[test]
    fn test_query_fallback() {
        assert_eq!(
            extract_token(None, Some("v=1&token=abc.def.ghi")),
            Some("abc.def.ghi".to_string())
        );
        assert_eq!(
            extract_token(Some("Basic xyz"), Some("token=q")),
            Some("q".to_string())
        );
    }

    #[test]
    fn test_missing_or_empty() {
        assert_eq!(extract_token(None, None), None);
        assert_eq!(extract_token(None, Some("token=")), None);
        assert_eq!(extract_token(None, Some("other=1")), None);
    }

    #[test]
    fn test_bad_pem_is_config_error() {
        assert!(matches!(
            JwtAuthenticator::from_public_key_pem("nope"),
            Err(AppError::Config(_))
        ));
    }
}
