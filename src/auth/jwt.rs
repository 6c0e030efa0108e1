//! JWT issuing and validation
//!
//! HS256 tokens with a configurable expiry. `new_dev()` uses a fixed secret and
//! must only be used with `--dev-mode`.

use std::time::{SystemTime, UNIX_EPOCH};

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::LedgerError;

const DEV_SECRET: &str = "family-points-dev-secret-do-not-use-in-production";
const DEV_EXPIRY_SECONDS: u64 = 86400;

/// Token claims
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Claims {
    /// User id
    pub sub: String,
    /// Display name, informational only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub iat: u64,
    pub exp: u64,
}

/// Input for issuing a token
#[derive(Debug, Clone)]
pub struct TokenInput {
    pub user_id: String,
    pub name: Option<String>,
}

/// Result of validating a token
#[derive(Debug, Clone)]
pub struct TokenValidationResult {
    pub valid: bool,
    pub claims: Option<Claims>,
    pub error: Option<String>,
}

impl TokenValidationResult {
    /// The caller's user id, or an `Auth` error
    pub fn into_user_id(self) -> Result<String, LedgerError> {
        match (self.valid, self.claims) {
            (true, Some(claims)) => Ok(claims.sub),
            _ => Err(LedgerError::Auth(
                self.error.unwrap_or_else(|| "Invalid token".to_string()),
            )),
        }
    }
}

/// Issues and validates tokens with one shared secret
#[derive(Clone)]
pub struct JwtValidator {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    expiry_seconds: u64,
}

impl JwtValidator {
    /// Create a validator for `secret`
    pub fn new(secret: String, expiry_seconds: u64) -> Result<Self, LedgerError> {
        if secret.is_empty() {
            return Err(LedgerError::Config("JWT secret must not be empty".into()));
        }
        if expiry_seconds == 0 {
            return Err(LedgerError::Config("JWT expiry must be positive".into()));
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;

        Ok(Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            expiry_seconds,
        })
    }

    /// Validator with a fixed development secret
    pub fn new_dev() -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;

        Self {
            encoding_key: EncodingKey::from_secret(DEV_SECRET.as_bytes()),
            decoding_key: DecodingKey::from_secret(DEV_SECRET.as_bytes()),
            validation,
            expiry_seconds: DEV_EXPIRY_SECONDS,
        }
    }

    /// Validator for the configured secret, or the dev validator in dev mode
    pub fn from_config(config: &Config) -> Result<Self, LedgerError> {
        if config.dev_mode {
            warn!("Dev mode: using the built-in JWT secret");
            return Ok(Self::new_dev());
        }
        let secret = config
            .jwt_secret
            .clone()
            .ok_or_else(|| LedgerError::Config("JWT secret is not configured".into()))?;
        Self::new(secret, config.jwt_expiry_seconds)
    }

    /// Issue a signed token
    pub fn generate_token(&self, input: TokenInput) -> Result<String, LedgerError> {
        let now = unix_now();
        let claims = Claims {
            sub: input.user_id,
            name: input.name,
            iat: now,
            exp: now.saturating_add(self.expiry_seconds),
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| LedgerError::Internal(format!("Failed to sign token: {}", e)))
    }

    /// Validate a token's signature and expiry
    pub fn verify_token(&self, token: &str) -> TokenValidationResult {
        match decode::<Claims>(token, &self.decoding_key, &self.validation) {
            Ok(data) => TokenValidationResult {
                valid: true,
                claims: Some(data.claims),
                error: None,
            },
            Err(e) => {
                debug!(error = %e, "Token rejected");
                let message = match e.kind() {
                    jsonwebtoken::errors::ErrorKind::ExpiredSignature => "Token expired",
                    jsonwebtoken::errors::ErrorKind::InvalidSignature => "Invalid token signature",
                    _ => "Invalid token",
                };
                TokenValidationResult {
                    valid: false,
                    claims: None,
                    error: Some(message.to_string()),
                }
            }
        }
    }

    pub fn expiry_seconds(&self) -> u64 {
        self.expiry_seconds
    }
}

/// Extract the token from an `Authorization: Bearer <token>` header value
pub fn extract_token_from_header(header: Option<&str>) -> Option<&str> {
    let value = header?.trim();
    let token = value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))?
        .trim();

    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
