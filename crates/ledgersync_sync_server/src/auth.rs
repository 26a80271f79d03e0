//! Bearer-token authentication for the sync server.
//!
//! ## Token Format
//!
//! ```text
//! <subject>.<issued-at unix millis>.<hex HMAC-SHA256 of "<subject>.<issued-at>">
//! ```
//!
//! The subject names the user or device the token was issued to.

use crate::error::{ServerError, ServerResult};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::fmt::Write as _;
use std::time::Duration;

type HmacSha256 = Hmac<Sha256>;

/// Authentication configuration.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Secret key for HMAC.
    pub secret: Vec<u8>,
    /// Token expiration duration.
    pub token_expiry: Duration,
}

impl AuthConfig {
    /// Creates a new auth configuration.
    pub fn new(secret: Vec<u8>) -> Self {
        Self {
            secret,
            token_expiry: Duration::from_secs(24 * 60 * 60),
        }
    }

    /// Sets the token expiration duration.
    pub fn with_expiry(mut self, expiry: Duration) -> Self {
        self.token_expiry = expiry;
        self
    }
}

/// Issues and validates signed bearer tokens.
#[derive(Clone)]
pub struct TokenValidator {
    config: AuthConfig,
}

impl TokenValidator {
    /// Creates a new token validator.
    pub fn new(config: AuthConfig) -> Self {
        Self { config }
    }

    /// Issues a token for `subject`, valid from `issued_at` (Unix millis).
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::InvalidRequest`] if the subject is empty or
    /// contains a `.`.
    pub fn create_token(&self, subject: &str, issued_at: i64) -> ServerResult<String> {
        if subject.is_empty() || subject.contains('.') {
            return Err(ServerError::InvalidRequest(format!(
                "invalid token subject: {subject:?}"
            )));
        }
        let claims = format!("{subject}.{issued_at}");
        let signature = self.sign(&claims)?;
        Ok(format!("{claims}.{signature}"))
    }

    /// Validates a token at time `now` (Unix millis) and returns its subject.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Unauthorized`] for a malformed, forged or
    /// expired token.
    pub fn validate_token(&self, token: &str, now: i64) -> ServerResult<String> {
        let mut parts = token.rsplitn(3, '.');
        let (Some(signature), Some(issued_at), Some(subject)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(ServerError::Unauthorized("malformed token".into()));
        };

        let expected = self.sign(&format!("{subject}.{issued_at}"))?;
        if !constant_time_eq(signature.as_bytes(), expected.as_bytes()) {
            return Err(ServerError::Unauthorized("invalid signature".into()));
        }

        let issued_at: i64 = issued_at
            .parse()
            .map_err(|_| ServerError::Unauthorized("malformed token".into()))?;
        let expiry = i64::try_from(self.config.token_expiry.as_millis()).unwrap_or(i64::MAX);
        if now > issued_at.saturating_add(expiry) {
            return Err(ServerError::Unauthorized("token expired".into()));
        }

        Ok(subject.to_string())
    }

    fn sign(&self, claims: &str) -> ServerResult<String> {
        let mut mac = HmacSha256::new_from_slice(&self.config.secret)
            .map_err(|err| ServerError::Internal(format!("invalid auth secret: {err}")))?;
        mac.update(claims.as_bytes());
        let digest = mac.finalize().into_bytes();

        let mut hex = String::with_capacity(digest.len() * 2);
        for byte in digest {
            let _ = write!(hex, "{byte:02x}");
        }
        Ok(hex)
    }
}

impl std::fmt::Debug for TokenValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenValidator")
            .field("token_expiry", &self.config.token_expiry)
            .finish_non_exhaustive()
    }
}

/// Validator that accepts exactly one shared token. Useful for testing.
#[derive(Clone)]
pub struct SimpleTokenValidator {
    secret: String,
}

impl SimpleTokenValidator {
    /// Creates a validator with a shared secret.
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Accepts the token if it equals the secret.
    pub fn validate(&self, token: &str) -> ServerResult<()> {
        if constant_time_eq(token.as_bytes(), self.secret.as_bytes()) {
            Ok(())
        } else {
            Err(ServerError::Unauthorized("invalid token".into()))
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> TokenValidator {
        TokenValidator::new(AuthConfig::new(b"test-secret-key-32-bytes-long!!".to_vec()))
    }

    #[test]
    fn create_and_validate_token() {
        let validator = validator();
        let token = validator.create_token("user-1", 1_000).unwrap();
        assert_eq!(validator.validate_token(&token, 2_000).unwrap(), "user-1");
    }

    #[test]
    fn reject_tampered_token() {
        let validator = validator();
        let token = validator.create_token("user-1", 1_000).unwrap();
        let forged = token.replacen("user-1", "user-2", 1);
        assert!(matches!(
            validator.validate_token(&forged, 2_000),
            Err(ServerError::Unauthorized(_))
        ));
    }

    #[test]
    fn reject_other_secret() {
        let token = validator().create_token("user-1", 1_000).unwrap();
        let other = TokenValidator::new(AuthConfig::new(b"another-secret".to_vec()));
        assert!(other.validate_token(&token, 2_000).is_err());
    }

    #[test]
    fn reject_expired_token() {
        let validator = TokenValidator::new(
            AuthConfig::new(b"secret".to_vec()).with_expiry(Duration::from_secs(60)),
        );
        let token = validator.create_token("user-1", 0).unwrap();
        assert!(validator.validate_token(&token, 60_000).is_ok());
        assert!(validator.validate_token(&token, 60_001).is_err());
    }

    #[test]
    fn reject_malformed_token() {
        let validator = validator();
        assert!(validator.validate_token("garbage", 0).is_err());
        assert!(validator.create_token("a.b", 0).is_err());
    }

    #[test]
    fn simple_validator() {
        let validator = SimpleTokenValidator::new("shared-secret");
        assert!(validator.validate("shared-secret").is_ok());
        assert!(validator.validate("wrong-secret").is_err());
    }
}
