//! Bearer tokens for callers of the HTTP surface that may trigger a sync.
//!
//! Tokens are compact HS256 JWTs carrying `sub`, `role`, `iat` and `exp`.
//! The engine itself never issues or checks them.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

const MIN_SECRET_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub role: String,
    pub iat: i64,
    pub exp: i64,
}

/// Signing secret read from `TOKEN_SECRET`.
#[derive(Clone)]
pub struct AuthConfig {
    secret: Vec<u8>,
}

impl AuthConfig {
    pub fn from_env() -> Result<Self> {
        let secret = std::env::var("TOKEN_SECRET")
            .map_err(|_| Error::Config("TOKEN_SECRET must be set".to_string()))?;
        Self::new(secret.into_bytes())
    }

    pub fn new(secret: Vec<u8>) -> Result<Self> {
        if secret.len() < MIN_SECRET_LEN {
            return Err(Error::Config(format!(
                "token secret must be at least {} bytes",
                MIN_SECRET_LEN
            )));
        }
        Ok(Self { secret })
    }
}

pub struct TokenIssuer {
    config: AuthConfig,
}

impl TokenIssuer {
    pub fn new(config: AuthConfig) -> Self {
        Self { config }
    }

    pub fn issue(&self, subject: &str, role: &str, ttl: Duration) -> Result<String> {
        self.issue_at(subject, role, ttl, Utc::now())
    }

    pub fn issue_at(
        &self,
        subject: &str,
        role: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<String> {
        if ttl <= Duration::zero() {
            return Err(Error::Token("token lifetime must be positive".to_string()));
        }

        let claims = Claims {
            sub: subject.to_string(),
            role: role.to_string(),
            iat: now.timestamp(),
            exp: (now + ttl).timestamp(),
        };

        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims)?);
        let signing_input = format!("{}.{}", header, payload);

        let signature = URL_SAFE_NO_PAD.encode(self.sign(signing_input.as_bytes())?);
        Ok(format!("{}.{}", signing_input, signature))
    }

    fn sign(&self, input: &[u8]) -> Result<Vec<u8>> {
        let mut mac = HmacSha256::new_from_slice(&self.config.secret)
            .map_err(|e| Error::Token(e.to_string()))?;
        mac.update(input);
        Ok(mac.finalize().into_bytes().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issuer() -> TokenIssuer {
        TokenIssuer::new(AuthConfig::new(vec![7u8; 32]).unwrap())
    }

    #[test]
    fn test_token_has_three_parts_and_claims() {
        let now = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let token = issuer()
            .issue_at("user-42", "admin", Duration::hours(1), now)
            .unwrap();

        let parts: Vec<&str> = token.split('.').collect();
        assert_eq!(parts.len(), 3);

        let claims: Claims =
            serde_json::from_slice(&URL_SAFE_NO_PAD.decode(parts[1]).unwrap()).unwrap();
        assert_eq!(claims.sub, "user-42");
        assert_eq!(claims.role, "admin");
        assert_eq!(claims.iat, 1_700_000_000);
        assert_eq!(claims.exp, 1_700_003_600);
    }

    #[test]
    fn test_signature_matches_secret() {
        let token = issuer().issue("user-1", "viewer", Duration::minutes(5)).unwrap();
        let (signing_input, signature) = token.rsplit_once('.').unwrap();

        let mut mac = HmacSha256::new_from_slice(&[7u8; 32]).unwrap();
        mac.update(signing_input.as_bytes());
        mac.verify_slice(&URL_SAFE_NO_PAD.decode(signature).unwrap())
            .unwrap();
    }

    #[test]
    fn test_short_secret_is_rejected() {
        assert!(matches!(AuthConfig::new(b"short".to_vec()), Err(Error::Config(_))));
    }

    #[test]
    fn test_non_positive_ttl_is_rejected() {
        assert!(matches!(
            issuer().issue("user-1", "viewer", Duration::zero()),
            Err(Error::Token(_))
        ));
    }
}
