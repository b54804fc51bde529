//! Session token issuance.

use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::error::{LoginGuardError, Result};

/// Issues an opaque session token for a verified identity.
pub trait TokenIssuer: Send + Sync {
    fn issue_token(&self, identity_id: &str) -> Result<String>;
}

/// Token configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenConfig {
    /// HMAC secret used to sign tokens
    #[serde(default)]
    pub secret: String,
    /// Token lifetime in hours
    #[serde(default = "default_ttl_hours")]
    pub ttl_hours: u64,
    /// Optional `iss` claim
    #[serde(default)]
    pub issuer: Option<String>,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            ttl_hours: default_ttl_hours(),
            issuer: None,
        }
    }
}

fn default_ttl_hours() -> u64 {
    720
}

/// Ten years.
const MAX_TTL_HOURS: u64 = 87_600;

impl TokenConfig {
    pub fn validate(&self) -> Result<()> {
        if self.secret.is_empty() {
            return Err(LoginGuardError::Config("tokens.secret must be set".to_string()));
        }
        if self.ttl_hours == 0 || self.ttl_hours > MAX_TTL_HOURS {
            return Err(LoginGuardError::Config(format!(
                "tokens.ttl_hours must be between 1 and {MAX_TTL_HOURS}"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
    pub jti: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
}

/// HS256 JWT issuer.
pub struct JwtTokenIssuer {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    ttl_hours: u64,
    issuer: Option<String>,
}

impl JwtTokenIssuer {
    pub fn new(config: &TokenConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            encoding_key: EncodingKey::from_secret(config.secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(config.secret.as_bytes()),
            ttl_hours: config.ttl_hours,
            issuer: config.issuer.clone(),
        })
    }

    /// Decode and validate a token issued here.
    pub fn verify_token(&self, token: &str) -> Result<Claims> {
        let mut validation = Validation::default();
        if let Some(issuer) = &self.issuer {
            validation.set_issuer(&[issuer]);
        }

        decode::<Claims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|e| LoginGuardError::Token(e.to_string()))
    }
}

impl TokenIssuer for JwtTokenIssuer {
    fn issue_token(&self, identity_id: &str) -> Result<String> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: identity_id.to_string(),
            iat: now,
            exp: now + (self.ttl_hours * 3600) as i64,
            jti: uuid::Uuid::new_v4().to_string(),
            iss: self.issuer.clone(),
        };

        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|e| LoginGuardError::Token(e.to_string()))
    }
}
