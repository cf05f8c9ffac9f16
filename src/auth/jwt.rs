//! JWT Token Handler
//! Mission: Generate and validate API bearer tokens securely

use crate::auth::models::Claims;
use anyhow::{Context, Result};
use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use tracing::debug;

/// HS256 handler for the API's bearer tokens.
pub struct JwtHandler {
    secret: String,
    validity_minutes: i64,
}

impl JwtHandler {
    /// Tokens are valid for 30 minutes.
    pub fn new(secret: String) -> Self {
        Self {
            secret,
            validity_minutes: 30,
        }
    }

    /// Generate a token carrying `{username, exp}`.
    pub fn generate_token(&self, username: &str) -> Result<String> {
        let expiration = Utc::now()
            .checked_add_signed(chrono::Duration::minutes(self.validity_minutes))
            .context("Invalid timestamp")?
            .timestamp() as usize;

        let claims = Claims {
            username: username.to_string(),
            exp: expiration,
        };

        debug!(username, "generating JWT, valid {}m", self.validity_minutes);

        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .context("Failed to generate JWT")
    }

    /// Validate a token and extract its claims.
    pub fn validate_token(&self, token: &str) -> Result<Claims> {
        let decoded = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &Validation::default(),
        )
        .context("Invalid or expired token")?;

        Ok(decoded.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generation_and_validation() {
        let handler = JwtHandler::new("test-secret-key-12345".to_string());

        let token = handler.generate_token("alice").unwrap();
        assert!(!token.is_empty());

        let claims = handler.validate_token(&token).unwrap();
        assert_eq!(claims.username, "alice");
        assert!(claims.exp > Utc::now().timestamp() as usize);
        // 30-minute validity window.
        assert!(claims.exp <= (Utc::now().timestamp() + 30 * 60 + 5) as usize);
    }

    #[test]
    fn test_invalid_token_rejected() {
        let handler = JwtHandler::new("test-secret-key-12345".to_string());
        assert!(handler.validate_token("invalid.token.here").is_err());
    }

    #[test]
    fn test_different_secrets_reject() {
        let handler1 = JwtHandler::new("secret1".to_string());
        let handler2 = JwtHandler::new("secret2".to_string());

        let token = handler1.generate_token("bob").unwrap();
        assert!(handler2.validate_token(&token).is_err());
    }

    #[test]
    fn test_expired_token_rejected() {
        let handler = JwtHandler::new("secret".to_string());
        let expired = Claims {
            username: "carol".to_string(),
            exp: (Utc::now().timestamp() - 3600) as usize,
        };
        let token = encode(
            &Header::default(),
            &expired,
            &EncodingKey::from_secret("secret".as_bytes()),
        )
        .unwrap();

        assert!(handler.validate_token(&token).is_err());
    }
}
